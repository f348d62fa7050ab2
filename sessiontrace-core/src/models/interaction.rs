use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{optional_str, optional_timestamp, required_str, required_timestamp};
use super::{DecodeError, Entity, EntityKind, ID_COLUMN};
use crate::schema::{ColumnType, Record, TableSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InteractionType {
    Turn,
    SessionEnd,
}

impl InteractionType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "TURN" => Some(InteractionType::Turn),
            "SESSION_END" => Some(InteractionType::SessionEnd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub session_id: String,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub interaction_type: Option<InteractionType>,
    pub topic_name: Option<String>,
}

impl Entity for Interaction {
    const KIND: EntityKind = EntityKind::Interaction;

    fn schema() -> TableSchema {
        TableSchema::new([
            (ID_COLUMN, ColumnType::Utf8),
            ("session_id", ColumnType::Utf8),
            ("start_timestamp", ColumnType::Utf8),
            ("end_timestamp", ColumnType::Utf8),
            ("interaction_type", ColumnType::Utf8),
            ("topic_name", ColumnType::Utf8),
        ])
    }

    fn from_record(record: &Record) -> Result<Self, DecodeError> {
        let interaction_type = match optional_str(record, "interaction_type") {
            None => None,
            Some(raw) => Some(InteractionType::parse(&raw).ok_or(DecodeError::InvalidValue {
                entity: Self::KIND,
                field: "interaction_type",
                value: raw,
            })?),
        };

        Ok(Self {
            id: required_str(record, Self::KIND, ID_COLUMN)?,
            session_id: required_str(record, Self::KIND, "session_id")?,
            start_timestamp: required_timestamp(record, Self::KIND, "start_timestamp")?,
            end_timestamp: optional_timestamp(record, Self::KIND, "end_timestamp")?,
            interaction_type,
            topic_name: optional_str(record, "topic_name"),
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}
