use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{optional_str, optional_timestamp, required_str, required_timestamp};
use super::{DecodeError, Entity, EntityKind, ID_COLUMN};
use crate::schema::{ColumnType, Record, TableSchema};

/// How a session ended. Values outside the known set are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEndType {
    UserEnded,
    AgentEnded,
    Escalated,
    Timeout,
    Error,
    Other(String),
}

impl SessionEndType {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "USER_ENDED" => SessionEndType::UserEnded,
            "AGENT_ENDED" => SessionEndType::AgentEnded,
            "ESCALATED" => SessionEndType::Escalated,
            "TIMEOUT" => SessionEndType::Timeout,
            "ERROR" => SessionEndType::Error,
            _ => SessionEndType::Other(raw.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: Option<DateTime<Utc>>,
    pub channel_type: Option<String>,
    pub end_type: Option<SessionEndType>,
    pub agent_name: Option<String>,
}

impl Entity for Session {
    const KIND: EntityKind = EntityKind::Session;

    fn schema() -> TableSchema {
        TableSchema::new([
            (ID_COLUMN, ColumnType::Utf8),
            ("start_timestamp", ColumnType::Utf8),
            ("end_timestamp", ColumnType::Utf8),
            ("channel_type", ColumnType::Utf8),
            ("end_type", ColumnType::Utf8),
            ("agent_name", ColumnType::Utf8),
        ])
    }

    fn from_record(record: &Record) -> Result<Self, DecodeError> {
        Ok(Self {
            id: required_str(record, Self::KIND, ID_COLUMN)?,
            start_timestamp: required_timestamp(record, Self::KIND, "start_timestamp")?,
            end_timestamp: optional_timestamp(record, Self::KIND, "end_timestamp")?,
            channel_type: optional_str(record, "channel_type"),
            end_type: optional_str(record, "end_type").map(|s| SessionEndType::parse(&s)),
            agent_name: optional_str(record, "agent_name"),
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}
