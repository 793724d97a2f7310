//! Identifier extraction from registry response envelopes.
//!
//! The registry and its workflow endpoints do not agree on a response
//! shape: search results arrive as FHIR-style `entry`/`resource` bundles,
//! composite workflow results nest the identifier under a named
//! sub-section, and some deployments wrap either shape in an extra `data`
//! envelope. Each pipeline declares an ordered strategy chain; the first
//! strategy that yields an identifier wins.

use serde_json::Value;

/// One way of locating a remote identifier in a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdStrategy {
    /// `entry[0].resource.id`, the search-result envelope.
    SearchEntry,
    /// `data.<section>.data.id`, the composite workflow-result envelope.
    WorkflowSection(&'static str),
    /// `data.<section>.<field>`, a flat field inside a workflow section.
    WorkflowField(&'static str, &'static str),
    /// `data.id`, `data.resource.id`, or a scalar `data` value.
    DataId,
    /// A top-level `id` (or `_id`).
    TopLevelId,
}

/// Try each strategy in order until one yields an identifier.
///
/// Returns `None` when no known shape matched; callers treat that as a
/// parse failure distinct from an HTTP-level failure, since the response
/// may well have been a 2xx.
pub fn extract_id(body: &Value, strategies: &[IdStrategy]) -> Option<String> {
    strategies.iter().find_map(|strategy| apply(*strategy, body))
}

fn apply(strategy: IdStrategy, body: &Value) -> Option<String> {
    match strategy {
        IdStrategy::SearchEntry => {
            first_entry_id(body).or_else(|| first_entry_id(&body["data"]))
        }
        IdStrategy::WorkflowSection(section) => {
            id_value(&body["data"][section]["data"]["id"])
                .or_else(|| id_value(&body[section]["data"]["id"]))
        }
        IdStrategy::WorkflowField(section, field) => {
            id_value(&body["data"][section][field]).or_else(|| id_value(&body[section][field]))
        }
        IdStrategy::DataId => {
            let data = &body["data"];
            id_value(&data["id"])
                .or_else(|| id_value(&data["resource"]["id"]))
                .or_else(|| id_value(data))
        }
        IdStrategy::TopLevelId => id_value(&body["id"]).or_else(|| id_value(&body["_id"])),
    }
}

fn first_entry_id(envelope: &Value) -> Option<String> {
    id_value(&envelope["entry"][0]["resource"]["id"])
}

/// Identifiers have been observed both as JSON strings and as numbers.
fn id_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
