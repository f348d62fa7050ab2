//! SQL for each level of the entity cascade.
//!
//! Source fields are aliased to the snake_case column names of the entity
//! schemas, so query output lands in the tables without renaming.

use chrono::{DateTime, SecondsFormat, Utc};
use sessiontrace_core::EntityKind;

pub const SESSION_TABLE: &str = "ssot__AiAgentSession__dlm";
pub const INTERACTION_TABLE: &str = "ssot__AiAgentInteraction__dlm";
pub const STEP_TABLE: &str = "ssot__AiAgentInteractionStep__dlm";
pub const MESSAGE_TABLE: &str = "ssot__AiAgentInteractionMessage__dlm";

const SESSION_COLUMNS: &[(&str, &str)] = &[
    ("ssot__Id__c", "id"),
    ("ssot__StartTimestamp__c", "start_timestamp"),
    ("ssot__EndTimestamp__c", "end_timestamp"),
    ("ssot__AiAgentChannelType__c", "channel_type"),
    ("ssot__AiAgentSessionEndType__c", "end_type"),
    ("ssot__AiAgentApiName__c", "agent_name"),
];

const INTERACTION_COLUMNS: &[(&str, &str)] = &[
    ("ssot__Id__c", "id"),
    ("ssot__AiAgentSessionId__c", "session_id"),
    ("ssot__StartTimestamp__c", "start_timestamp"),
    ("ssot__EndTimestamp__c", "end_timestamp"),
    ("ssot__AiAgentInteractionType__c", "interaction_type"),
    ("ssot__TopicApiName__c", "topic_name"),
];

const STEP_COLUMNS: &[(&str, &str)] = &[
    ("ssot__Id__c", "id"),
    ("ssot__AiAgentInteractionId__c", "interaction_id"),
    ("ssot__StartTimestamp__c", "start_timestamp"),
    ("ssot__AiAgentInteractionStepType__c", "step_type"),
    ("ssot__Name__c", "name"),
    ("ssot__InputValueText__c", "input_text"),
    ("ssot__OutputValueText__c", "output_text"),
    ("ssot__GenerationId__c", "generation_id"),
];

const MESSAGE_COLUMNS: &[(&str, &str)] = &[
    ("ssot__Id__c", "id"),
    ("ssot__AiAgentSessionId__c", "session_id"),
    ("ssot__MessageSentTimestamp__c", "start_timestamp"),
    ("ssot__RequestSummaryText__c", "request_summary"),
    ("ssot__ResponseSummaryText__c", "response_summary"),
    ("ssot__AiAgentApiName__c", "agent_name"),
];

fn table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Session => SESSION_TABLE,
        EntityKind::Interaction => INTERACTION_TABLE,
        EntityKind::Step => STEP_TABLE,
        EntityKind::Message => MESSAGE_TABLE,
    }
}

fn columns(kind: EntityKind) -> &'static [(&'static str, &'static str)] {
    match kind {
        EntityKind::Session => SESSION_COLUMNS,
        EntityKind::Interaction => INTERACTION_COLUMNS,
        EntityKind::Step => STEP_COLUMNS,
        EntityKind::Message => MESSAGE_COLUMNS,
    }
}

/// Source field holding the parent id for child levels.
fn parent_column(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Session => "ssot__Id__c",
        EntityKind::Interaction | EntityKind::Message => "ssot__AiAgentSessionId__c",
        EntityKind::Step => "ssot__AiAgentInteractionId__c",
    }
}

/// Output column names for `kind`, in select order.
pub fn output_columns(kind: EntityKind) -> Vec<&'static str> {
    columns(kind).iter().map(|(_, alias)| *alias).collect()
}

fn select(kind: EntityKind) -> String {
    let projection = columns(kind)
        .iter()
        .map(|(source, alias)| format!("{} AS {}", source, alias))
        .collect::<Vec<_>>()
        .join(", ");
    format!("SELECT {} FROM {}", projection, table(kind))
}

/// Single-quoted SQL string literal.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn timestamp_literal(ts: DateTime<Utc>) -> String {
    quote(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn in_list(values: &[String]) -> String {
    values.iter().map(|v| quote(v)).collect::<Vec<_>>().join(", ")
}

/// Sessions starting in `[start, end)`, optionally limited to some agents.
pub fn sessions_in_window(start: DateTime<Utc>, end: DateTime<Utc>, agent_names: &[String]) -> String {
    let mut sql = format!(
        "{} WHERE ssot__StartTimestamp__c >= {} AND ssot__StartTimestamp__c < {}",
        select(EntityKind::Session),
        timestamp_literal(start),
        timestamp_literal(end)
    );
    if !agent_names.is_empty() {
        sql.push_str(&format!(" AND ssot__AiAgentApiName__c IN ({})", in_list(agent_names)));
    }
    sql.push_str(" ORDER BY ssot__StartTimestamp__c");
    sql
}

/// Rows of `kind` whose parent id is in `parent_ids`. For sessions the
/// "parent" is the session id itself.
pub fn by_parent_ids(kind: EntityKind, parent_ids: &[String]) -> String {
    format!(
        "{} WHERE {} IN ({}) ORDER BY ssot__Id__c",
        select(kind),
        parent_column(kind),
        in_list(parent_ids)
    )
}

/// One query per chunk of at most `chunk_size` ids.
pub fn chunked_by_parent_ids(kind: EntityKind, parent_ids: &[String], chunk_size: usize) -> Vec<String> {
    parent_ids
        .chunks(chunk_size.max(1))
        .map(|chunk| by_parent_ids(kind, chunk))
        .collect()
}
