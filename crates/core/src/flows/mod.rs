pub mod engine;
pub mod states;
pub mod validation;

pub use engine::{ensure_valid_structure, reachable_from, WorkflowEngine, WorkflowError};
pub use states::{AdvanceRequest, StartRequest, TransitionOutcome, TransitionRejection};
pub use validation::{validate_stages, StructureViolation};
