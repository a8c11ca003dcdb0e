use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flows::WorkflowError;

/// Machine-readable category of every failure the core can report. HTTP
/// collaborators map these to status codes without reading messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TenantNotFound,
    TenantInactive,
    ConnectionError,
    ConnectionTimeout,
    InvalidWorkflowStructure,
    DuplicateName,
    WorkflowNotFound,
    DefinitionNotFound,
    NoStartStage,
    EntityNotFound,
    InstanceNotFound,
    InstanceTerminal,
    InvalidTransition,
    MissingRequiredFields,
    ConcurrentModification,
    Persistence,
    Configuration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TenantNotFound => "tenant_not_found",
            Self::TenantInactive => "tenant_inactive",
            Self::ConnectionError => "connection_error",
            Self::ConnectionTimeout => "connection_timeout",
            Self::InvalidWorkflowStructure => "invalid_workflow_structure",
            Self::DuplicateName => "duplicate_name",
            Self::WorkflowNotFound => "workflow_not_found",
            Self::DefinitionNotFound => "definition_not_found",
            Self::NoStartStage => "no_start_stage",
            Self::EntityNotFound => "entity_not_found",
            Self::InstanceNotFound => "instance_not_found",
            Self::InstanceTerminal => "instance_terminal",
            Self::InvalidTransition => "invalid_transition",
            Self::MissingRequiredFields => "missing_required_fields",
            Self::ConcurrentModification => "concurrent_modification",
            Self::Persistence => "persistence",
            Self::Configuration => "configuration",
        }
    }
}

/// Implemented by every error type that crosses the core's boundary.
pub trait ClassifiedError: std::error::Error {
    fn kind(&self) -> ErrorKind;

    fn into_interface(&self, correlation_id: impl Into<String>) -> InterfaceError
    where
        Self: Sized,
    {
        InterfaceError::from_kind(self.kind(), self.to_string(), correlation_id)
    }
}

impl ClassifiedError for WorkflowError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidStructure { .. } => ErrorKind::InvalidWorkflowStructure,
            Self::WorkflowNotFound { .. } => ErrorKind::WorkflowNotFound,
            Self::NoStartStage { .. } => ErrorKind::NoStartStage,
            Self::InstanceTerminal { .. } => ErrorKind::InstanceTerminal,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::MissingRequiredFields { .. } => ErrorKind::MissingRequiredFields,
            Self::DefinitionMismatch { .. } => ErrorKind::InvalidTransition,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request ({}): {message}", .kind.as_str())]
    BadRequest { kind: ErrorKind, message: String, correlation_id: String },
    #[error("forbidden ({}): {message}", .kind.as_str())]
    Forbidden { kind: ErrorKind, message: String, correlation_id: String },
    #[error("not found ({}): {message}", .kind.as_str())]
    NotFound { kind: ErrorKind, message: String, correlation_id: String },
    #[error("conflict ({}): {message}", .kind.as_str())]
    Conflict { kind: ErrorKind, message: String, correlation_id: String },
    #[error("service unavailable ({}): {message}", .kind.as_str())]
    ServiceUnavailable { kind: ErrorKind, message: String, correlation_id: String },
    #[error("internal error ({}): {message}", .kind.as_str())]
    Internal { kind: ErrorKind, message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn from_kind(
        kind: ErrorKind,
        message: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let correlation_id = correlation_id.into();
        match kind {
            ErrorKind::InvalidWorkflowStructure
            | ErrorKind::InvalidTransition
            | ErrorKind::MissingRequiredFields => {
                Self::BadRequest { kind, message, correlation_id }
            }
            ErrorKind::TenantInactive => Self::Forbidden { kind, message, correlation_id },
            ErrorKind::TenantNotFound
            | ErrorKind::WorkflowNotFound
            | ErrorKind::DefinitionNotFound
            | ErrorKind::EntityNotFound
            | ErrorKind::InstanceNotFound => Self::NotFound { kind, message, correlation_id },
            ErrorKind::DuplicateName
            | ErrorKind::InstanceTerminal
            | ErrorKind::ConcurrentModification => Self::Conflict { kind, message, correlation_id },
            ErrorKind::ConnectionError | ErrorKind::ConnectionTimeout | ErrorKind::Persistence => {
                Self::ServiceUnavailable { kind, message, correlation_id }
            }
            ErrorKind::NoStartStage | ErrorKind::Configuration => {
                Self::Internal { kind, message, correlation_id }
            }
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest { kind, .. }
            | Self::Forbidden { kind, .. }
            | Self::NotFound { kind, .. }
            | Self::Conflict { kind, .. }
            | Self::ServiceUnavailable { kind, .. }
            | Self::Internal { kind, .. } => *kind,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "This organization is not currently active.",
            Self::NotFound { .. } => "The requested resource was not found.",
            Self::Conflict { .. } => {
                "The request conflicts with the current state. Refresh and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }
}
