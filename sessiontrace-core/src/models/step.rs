use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{optional_str, required_str, required_timestamp};
use super::{DecodeError, Entity, EntityKind, ID_COLUMN};
use crate::schema::{ColumnType, Record, TableSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    LlmStep,
    ActionStep,
}

impl StepType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "LLM_STEP" => Some(StepType::LlmStep),
            "ACTION_STEP" => Some(StepType::ActionStep),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub interaction_id: String,
    pub start_timestamp: DateTime<Utc>,
    pub step_type: Option<StepType>,
    pub name: Option<String>,
    pub input_text: Option<String>,
    pub output_text: Option<String>,
    pub generation_id: Option<String>,
}

impl Entity for Step {
    const KIND: EntityKind = EntityKind::Step;

    fn schema() -> TableSchema {
        TableSchema::new([
            (ID_COLUMN, ColumnType::Utf8),
            ("interaction_id", ColumnType::Utf8),
            ("start_timestamp", ColumnType::Utf8),
            ("step_type", ColumnType::Utf8),
            ("name", ColumnType::Utf8),
            ("input_text", ColumnType::Utf8),
            ("output_text", ColumnType::Utf8),
            ("generation_id", ColumnType::Utf8),
        ])
    }

    fn from_record(record: &Record) -> Result<Self, DecodeError> {
        let step_type = match optional_str(record, "step_type") {
            None => None,
            Some(raw) => Some(StepType::parse(&raw).ok_or(DecodeError::InvalidValue {
                entity: Self::KIND,
                field: "step_type",
                value: raw,
            })?),
        };

        Ok(Self {
            id: required_str(record, Self::KIND, ID_COLUMN)?,
            interaction_id: required_str(record, Self::KIND, "interaction_id")?,
            start_timestamp: required_timestamp(record, Self::KIND, "start_timestamp")?,
            step_type,
            name: optional_str(record, "name"),
            input_text: optional_str(record, "input_text"),
            output_text: optional_str(record, "output_text"),
            generation_id: optional_str(record, "generation_id"),
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}
