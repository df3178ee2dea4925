pub mod constants;
pub mod event;
pub mod validation;

// Re-export primary types for convenience.
pub use event::{Phase, WorkflowEvent};
pub use validation::{EventRejection, parse_event, validate_event};
