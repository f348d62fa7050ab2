use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{optional_str, required_str, required_timestamp};
use super::{DecodeError, Entity, EntityKind, ID_COLUMN};
use crate::schema::{ColumnType, Record, TableSchema};

/// Session-level message summary. Sibling of `Interaction`, not its child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub start_timestamp: DateTime<Utc>,
    pub request_summary: Option<String>,
    pub response_summary: Option<String>,
    pub agent_name: Option<String>,
}

impl Entity for Message {
    const KIND: EntityKind = EntityKind::Message;

    fn schema() -> TableSchema {
        TableSchema::new([
            (ID_COLUMN, ColumnType::Utf8),
            ("session_id", ColumnType::Utf8),
            ("start_timestamp", ColumnType::Utf8),
            ("request_summary", ColumnType::Utf8),
            ("response_summary", ColumnType::Utf8),
            ("agent_name", ColumnType::Utf8),
        ])
    }

    fn from_record(record: &Record) -> Result<Self, DecodeError> {
        Ok(Self {
            id: required_str(record, Self::KIND, ID_COLUMN)?,
            session_id: required_str(record, Self::KIND, "session_id")?,
            start_timestamp: required_timestamp(record, Self::KIND, "start_timestamp")?,
            request_summary: optional_str(record, "request_summary"),
            response_summary: optional_str(record, "response_summary"),
            agent_name: optional_str(record, "agent_name"),
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}
