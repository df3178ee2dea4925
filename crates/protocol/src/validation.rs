//! Inbound event guard.
//!
//! Every field of a [`WorkflowEvent`] is required on the wire, including
//! `node_name` (which may be `null`). The guard inspects the raw JSON
//! instead of relying on serde defaults so that a missing field is
//! distinguishable from an empty one.

use serde_json::{Map, Value};

use crate::constants::WS_MAX_MESSAGE_SIZE;
use crate::event::{Phase, WorkflowEvent};

/// Why an inbound frame was not accepted as a [`WorkflowEvent`].
#[derive(Debug, thiserror::Error)]
pub enum EventRejection {
    #[error("message too large ({0} bytes)")]
    Oversized(usize),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("unknown phase `{0}`")]
    UnknownPhase(String),
}

/// Parses and validates a text frame.
pub fn parse_event(text: &str) -> Result<WorkflowEvent, EventRejection> {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        return Err(EventRejection::Oversized(text.len()));
    }
    let value: Value = serde_json::from_str(text)?;
    validate_event(value)
}

/// Validates an already-parsed JSON value.
pub fn validate_event(value: Value) -> Result<WorkflowEvent, EventRejection> {
    let Value::Object(mut obj) = value else {
        return Err(EventRejection::NotAnObject);
    };

    let event_id = take_string(&mut obj, "event_id")?;
    let run_id = take_string(&mut obj, "run_id")?;
    let timestamp = take_string(&mut obj, "timestamp")?;

    let node_name = match obj.remove("node_name") {
        None => return Err(EventRejection::MissingField("node_name")),
        Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(_) => {
            return Err(EventRejection::WrongType {
                field: "node_name",
                expected: "a string or null",
            });
        }
    };

    let phase_raw = take_string(&mut obj, "phase")?;
    let phase =
        Phase::from_wire(&phase_raw).ok_or(EventRejection::UnknownPhase(phase_raw))?;

    let metrics = take_object(&mut obj, "metrics")?;
    let issues = match obj.remove("issues") {
        None => return Err(EventRejection::MissingField("issues")),
        Some(Value::Array(a)) => a,
        Some(_) => {
            return Err(EventRejection::WrongType {
                field: "issues",
                expected: "an array",
            });
        }
    };
    let data = take_object(&mut obj, "data")?;

    Ok(WorkflowEvent {
        event_id,
        run_id,
        timestamp,
        node_name,
        phase,
        metrics,
        issues,
        data,
    })
}

fn take_string(
    obj: &mut Map<String, Value>,
    field: &'static str,
) -> Result<String, EventRejection> {
    match obj.remove(field) {
        None => Err(EventRejection::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(EventRejection::WrongType {
            field,
            expected: "a string",
        }),
    }
}

fn take_object(
    obj: &mut Map<String, Value>,
    field: &'static str,
) -> Result<Map<String, Value>, EventRejection> {
    match obj.remove(field) {
        None => Err(EventRejection::MissingField(field)),
        Some(Value::Object(m)) => Ok(m),
        Some(_) => Err(EventRejection::WrongType {
            field,
            expected: "an object",
        }),
    }
}
