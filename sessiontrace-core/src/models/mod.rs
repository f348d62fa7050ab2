//! Typed entities of the session trace hierarchy.
//!
//! Session → Interaction → Step, plus Message as a session-level sibling of
//! Interaction. Rows cross the query boundary as `Record`s; every page is
//! decoded into these types before it is buffered, and they are the
//! strongly-typed view used when reading extracted tables back.

pub mod interaction;
pub mod message;
pub mod session;
pub mod step;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::schema::{Record, TableSchema};

pub use interaction::{Interaction, InteractionType};
pub use message::Message;
pub use session::{Session, SessionEndType};
pub use step::{Step, StepType};

/// Identifier column shared by every entity table.
pub const ID_COLUMN: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Session,
    Interaction,
    Step,
    Message,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Session,
        EntityKind::Interaction,
        EntityKind::Step,
        EntityKind::Message,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Session => "session",
            EntityKind::Interaction => "interaction",
            EntityKind::Step => "step",
            EntityKind::Message => "message",
        }
    }

    /// Output location stem, one per entity type.
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Session => "sessions",
            EntityKind::Interaction => "interactions",
            EntityKind::Step => "steps",
            EntityKind::Message => "messages",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.parquet", self.table_name())
    }

    pub fn schema(&self) -> TableSchema {
        match self {
            EntityKind::Session => Session::schema(),
            EntityKind::Interaction => Interaction::schema(),
            EntityKind::Step => Step::schema(),
            EntityKind::Message => Message::schema(),
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum DecodeError {
    #[error("{entity} record is missing required field '{field}'")]
    MissingField { entity: EntityKind, field: &'static str },

    #[error("{entity} record has invalid {field}: {value}")]
    InvalidValue {
        entity: EntityKind,
        field: &'static str,
        value: String,
    },
}

/// Common surface of the four extracted entity types.
pub trait Entity: Sized {
    const KIND: EntityKind;

    fn schema() -> TableSchema;

    fn from_record(record: &Record) -> Result<Self, DecodeError>;

    fn id(&self) -> &str;
}

/// A decoded row of any entity type.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRow {
    Session(Session),
    Interaction(Interaction),
    Step(Step),
    Message(Message),
}

impl EntityRow {
    pub fn decode(kind: EntityKind, record: &Record) -> Result<Self, DecodeError> {
        Ok(match kind {
            EntityKind::Session => EntityRow::Session(Session::from_record(record)?),
            EntityKind::Interaction => EntityRow::Interaction(Interaction::from_record(record)?),
            EntityKind::Step => EntityRow::Step(Step::from_record(record)?),
            EntityKind::Message => EntityRow::Message(Message::from_record(record)?),
        })
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRow::Session(_) => EntityKind::Session,
            EntityRow::Interaction(_) => EntityKind::Interaction,
            EntityRow::Step(_) => EntityKind::Step,
            EntityRow::Message(_) => EntityKind::Message,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            EntityRow::Session(s) => s.id(),
            EntityRow::Interaction(i) => i.id(),
            EntityRow::Step(s) => s.id(),
            EntityRow::Message(m) => m.id(),
        }
    }
}

/// Decode a batch of records into one entity type.
pub fn decode_records<T: Entity>(records: &[Record]) -> Result<Vec<T>, DecodeError> {
    records.iter().map(T::from_record).collect()
}

// ============================================================================
// Field helpers
// ============================================================================

/// String view of a field; numbers and booleans render as text, null and
/// empty strings read as absent.
pub(crate) fn optional_str(record: &Record, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub(crate) fn required_str(
    record: &Record,
    entity: EntityKind,
    field: &'static str,
) -> Result<String, DecodeError> {
    optional_str(record, field).ok_or(DecodeError::MissingField { entity, field })
}

pub(crate) fn optional_timestamp(
    record: &Record,
    entity: EntityKind,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, DecodeError> {
    match optional_str(record, field) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|_| DecodeError::InvalidValue {
                entity,
                field,
                value: raw,
            }),
    }
}

pub(crate) fn required_timestamp(
    record: &Record,
    entity: EntityKind,
    field: &'static str,
) -> Result<DateTime<Utc>, DecodeError> {
    optional_timestamp(record, entity, field)?.ok_or(DecodeError::MissingField { entity, field })
}
