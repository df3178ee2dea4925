use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle phase reported by a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Start,
    End,
    Fail,
    Info,
}

impl Phase {
    /// Parses the wire form (`"start"`, `"end"`, `"fail"`, `"info"`).
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "start" => Some(Self::Start),
            "end" => Some(Self::End),
            "fail" => Some(Self::Fail),
            "info" => Some(Self::Info),
            _ => None,
        }
    }

    /// Returns the wire form of this phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Fail => "fail",
            Self::Info => "info",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A workflow execution event pushed by the backend.
///
/// Two events with the same `event_id` are the same logical event; the
/// client uses it for deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_id: String,
    pub run_id: String,
    /// ISO-8601 timestamp as sent by the backend.
    pub timestamp: String,
    pub node_name: Option<String>,
    pub phase: Phase,
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default)]
    pub issues: Vec<Value>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl WorkflowEvent {
    /// Creates an event with empty metrics, issues and data.
    pub fn new(
        event_id: impl Into<String>,
        run_id: impl Into<String>,
        timestamp: impl Into<String>,
        phase: Phase,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            run_id: run_id.into(),
            timestamp: timestamp.into(),
            node_name: None,
            phase,
            metrics: Map::new(),
            issues: Vec::new(),
            data: Map::new(),
        }
    }

    /// Sets the node that produced the event.
    pub fn with_node(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    /// Whether this event reports a node failure.
    pub fn is_failure(&self) -> bool {
        self.phase == Phase::Fail
    }
}
