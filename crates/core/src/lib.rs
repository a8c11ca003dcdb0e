pub mod collaborators;
pub mod config;
pub mod derivation;
pub mod domain;
pub mod errors;
pub mod flows;

pub use collaborators::{
    CollaboratorError, EntityDirectory, InMemoryEntityDirectory, NoopActionExecutor,
    RecordingActionExecutor, StageActionExecutor,
};
pub use derivation::{
    bulk_status, entity_status, installation_status, payment_status, vehicle_status,
    workflow_progress, EntityStatus, InstallationStatus, PaymentStatus, TrackedWorkflow,
    VehicleStatus,
};
pub use domain::entity::EntitySnapshot;
pub use domain::instance::{
    EntityRef, InstanceStatus, StageHistoryEntry, WorkflowInstance, WorkflowInstanceId,
};
pub use domain::payload::{Payload, PayloadValue};
pub use domain::tenant::{
    ConnectionDescriptor, FeatureValue, Tenant, TenantFeatures, TenantId, TenantStatus,
};
pub use domain::workflow::{
    DefinitionPatch, DefinitionStatus, NewWorkflowDefinition, Stage, StageAction, StageKind,
    WorkflowDefinition, WorkflowDefinitionId, WorkflowRules, WorkflowType,
};
pub use errors::{ClassifiedError, ErrorKind, InterfaceError};
pub use flows::{
    AdvanceRequest, StartRequest, StructureViolation, TransitionOutcome, WorkflowEngine,
    WorkflowError,
};
