use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use tenantflow_core::domain::instance::{EntityRef, WorkflowInstance, WorkflowInstanceId};
use tenantflow_core::domain::tenant::TenantId;
use tenantflow_core::domain::workflow::{WorkflowDefinition, WorkflowDefinitionId};

pub mod definition;
pub mod instance;
pub mod memory;

pub use definition::SqlWorkflowDefinitionRepository;
pub use instance::SqlWorkflowInstanceRepository;
pub use memory::{InMemoryWorkflowDefinitionRepository, InMemoryWorkflowInstanceRepository};

// Keeps bound parameters well below SQLite's variable limit.
pub(crate) const BIND_CHUNK: usize = 400;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("instance `{instance_id}` is no longer at version {expected}")]
    VersionConflict { instance_id: WorkflowInstanceId, expected: u32 },
}

impl RepositoryError {
    /// Folds a unique-index violation into `Conflict`, leaving other errors intact.
    pub(crate) fn from_write(error: sqlx::Error, subject: impl Into<String>) -> Self {
        match &error {
            sqlx::Error::Database(db) if db.is_unique_violation() => Self::Conflict(subject.into()),
            _ => Self::Database(error),
        }
    }
}

#[async_trait]
pub trait WorkflowDefinitionRepository: Send + Sync {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &WorkflowDefinitionId,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError>;

    async fn find_active_by_name(
        &self,
        tenant_id: &TenantId,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError>;

    async fn list(
        &self,
        tenant_id: &TenantId,
        include_inactive: bool,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError>;

    async fn list_by_ids(
        &self,
        tenant_id: &TenantId,
        ids: &[WorkflowDefinitionId],
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError>;

    /// Inserts or replaces the definition. An active name clash yields `Conflict`.
    async fn save(&self, definition: WorkflowDefinition) -> Result<(), RepositoryError>;

    /// Removes the definition outright; returns whether a row was deleted.
    async fn delete(
        &self,
        tenant_id: &TenantId,
        id: &WorkflowDefinitionId,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait WorkflowInstanceRepository: Send + Sync {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &WorkflowInstanceId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError>;

    /// The instance holding the natural key, ignoring cancelled runs.
    async fn find_live(
        &self,
        tenant_id: &TenantId,
        definition_id: &WorkflowDefinitionId,
        entity: &EntityRef,
    ) -> Result<Option<WorkflowInstance>, RepositoryError>;

    async fn list_for_entity(
        &self,
        tenant_id: &TenantId,
        entity: &EntityRef,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError>;

    /// Loads every instance of every listed entity in one round of queries.
    async fn list_for_entities(
        &self,
        tenant_id: &TenantId,
        entities: &[EntityRef],
    ) -> Result<Vec<WorkflowInstance>, RepositoryError>;

    async fn count_for_definition(
        &self,
        tenant_id: &TenantId,
        definition_id: &WorkflowDefinitionId,
    ) -> Result<u64, RepositoryError>;

    /// Persists a freshly started instance with its opening history entry.
    /// A live instance with the same natural key yields `Conflict`.
    async fn insert(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError>;

    /// Writes `instance` only if the stored row is still at `expected_version`,
    /// appending the history entries recorded after that version.
    async fn append_transition(
        &self,
        instance: &WorkflowInstance,
        expected_version: u32,
    ) -> Result<(), RepositoryError>;
}

pub(crate) fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("{field}: {error}")))
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(
    field: &str,
    raw: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(raw).map_err(|error| RepositoryError::Decode(format!("{field}: {error}")))
}

pub(crate) fn encode_json<T: serde::Serialize>(
    field: &str,
    value: &T,
) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("{field}: {error}")))
}
