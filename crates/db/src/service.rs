//! Tenant-scoped workflow operations: definition management, instance
//! transitions and derived status, each routed to the caller's tenant store.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tenantflow_core::collaborators::{CollaboratorError, EntityDirectory, StageActionExecutor};
use tenantflow_core::derivation::{self, EntityStatus, TrackedWorkflow};
use tenantflow_core::domain::entity::EntitySnapshot;
use tenantflow_core::domain::instance::{EntityRef, WorkflowInstance, WorkflowInstanceId};
use tenantflow_core::domain::tenant::TenantId;
use tenantflow_core::domain::workflow::{
    DefinitionPatch, DefinitionStatus, NewWorkflowDefinition, WorkflowDefinition,
    WorkflowDefinitionId,
};
use tenantflow_core::errors::{ClassifiedError, ErrorKind};
use tenantflow_core::flows::{
    ensure_valid_structure, AdvanceRequest, StartRequest, TransitionOutcome, WorkflowEngine,
    WorkflowError,
};

use crate::repositories::RepositoryError;
use crate::router::RouterError;
use crate::stores::{TenantStore, TenantStores};

/// Reload-and-reapply budget for a transition that loses a version race.
pub const MAX_APPEND_ATTEMPTS: u32 = 8;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("an active workflow definition named `{name}` already exists")]
    DuplicateName { name: String },
    #[error("workflow definition `{0}` was not found")]
    DefinitionNotFound(WorkflowDefinitionId),
    #[error("entity {0} was not found")]
    EntityNotFound(EntityRef),
    #[error("workflow instance `{0}` was not found")]
    InstanceNotFound(WorkflowInstanceId),
    #[error("workflow instance `{instance_id}` kept changing; gave up after {attempts} attempts")]
    ConcurrentModification { instance_id: WorkflowInstanceId, attempts: u32 },
    #[error("entity directory failed: {0}")]
    EntityDirectory(#[from] CollaboratorError),
    #[error("workflow store failed: {0}")]
    Repository(#[from] RepositoryError),
}

impl ClassifiedError for ServiceError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Router(error) => error.kind(),
            Self::Workflow(error) => error.kind(),
            Self::DuplicateName { .. } => ErrorKind::DuplicateName,
            Self::DefinitionNotFound(_) => ErrorKind::DefinitionNotFound,
            Self::EntityNotFound(_) => ErrorKind::EntityNotFound,
            Self::InstanceNotFound(_) => ErrorKind::InstanceNotFound,
            Self::ConcurrentModification { .. } => ErrorKind::ConcurrentModification,
            Self::EntityDirectory(_) | Self::Repository(_) => ErrorKind::Persistence,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StartedInstance {
    pub instance: WorkflowInstance,
    /// False when an earlier start for the same definition and entity was
    /// returned instead of creating a new instance.
    pub created: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deactivation {
    /// The definition had no instances and is gone.
    Deleted,
    /// The definition has instances and was marked inactive.
    Deactivated,
}

pub struct WorkflowService {
    stores: Arc<dyn TenantStores>,
    entities: Arc<dyn EntityDirectory>,
    actions: Arc<dyn StageActionExecutor>,
    engine: WorkflowEngine,
}

impl WorkflowService {
    pub fn new(
        stores: Arc<dyn TenantStores>,
        entities: Arc<dyn EntityDirectory>,
        actions: Arc<dyn StageActionExecutor>,
    ) -> Self {
        Self { stores, entities, actions, engine: WorkflowEngine::new() }
    }

    async fn open(&self, tenant_id: &TenantId) -> Result<TenantStore, ServiceError> {
        Ok(self.stores.open(tenant_id).await?)
    }

    /// Converts a repository failure, letting the store owner see it first.
    async fn checked<T>(
        &self,
        tenant_id: &TenantId,
        result: Result<T, RepositoryError>,
    ) -> Result<T, ServiceError> {
        match result {
            Ok(value) => Ok(value),
            Err(error) => {
                self.stores.report_failure(tenant_id, &error).await;
                Err(ServiceError::Repository(error))
            }
        }
    }

    pub async fn create_definition(
        &self,
        tenant_id: &TenantId,
        new: NewWorkflowDefinition,
    ) -> Result<WorkflowDefinition, ServiceError> {
        ensure_valid_structure(&new.stages)?;
        let store = self.open(tenant_id).await?;

        let clash =
            self.checked(tenant_id, store.definitions.find_active_by_name(tenant_id, &new.name).await).await?;
        if clash.is_some() {
            return Err(ServiceError::DuplicateName { name: new.name });
        }

        let now = Utc::now();
        let definition = WorkflowDefinition {
            id: WorkflowDefinitionId(Uuid::new_v4().to_string()),
            tenant_id: tenant_id.clone(),
            name: new.name,
            description: new.description,
            workflow_type: new.workflow_type,
            stages: new.stages,
            rules: new.rules,
            status: DefinitionStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.save_definition(tenant_id, &store, definition.clone()).await?;

        info!(
            event_name = "workflow.definition.created",
            tenant_id = %tenant_id,
            definition_id = %definition.id,
            workflow_type = definition.workflow_type.as_str(),
            stage_count = definition.stages.len(),
            "workflow definition created"
        );
        Ok(definition)
    }

    pub async fn update_definition(
        &self,
        tenant_id: &TenantId,
        definition_id: &WorkflowDefinitionId,
        patch: DefinitionPatch,
    ) -> Result<WorkflowDefinition, ServiceError> {
        let store = self.open(tenant_id).await?;
        let current = self.load_definition(tenant_id, &store, definition_id).await?;

        let renamed = patch.renames(&current);
        let mut updated = current;
        patch.apply_to(&mut updated, Utc::now());
        ensure_valid_structure(&updated.stages)?;

        if renamed && updated.is_active() {
            let clash = self
                .checked(tenant_id, store.definitions.find_active_by_name(tenant_id, &updated.name).await)
                .await?;
            if clash.is_some_and(|other| other.id != updated.id) {
                return Err(ServiceError::DuplicateName { name: updated.name });
            }
        }
        self.save_definition(tenant_id, &store, updated.clone()).await?;

        info!(
            event_name = "workflow.definition.updated",
            tenant_id = %tenant_id,
            definition_id = %updated.id,
            renamed,
            "workflow definition updated"
        );
        Ok(updated)
    }

    /// Hard-deletes an unused definition; one with instances is only marked
    /// inactive so its history stays readable.
    pub async fn deactivate_definition(
        &self,
        tenant_id: &TenantId,
        definition_id: &WorkflowDefinitionId,
    ) -> Result<Deactivation, ServiceError> {
        let store = self.open(tenant_id).await?;
        let mut definition = self.load_definition(tenant_id, &store, definition_id).await?;

        let instances = self
            .checked(tenant_id, store.instances.count_for_definition(tenant_id, definition_id).await)
            .await?;
        if instances == 0 {
            match store.definitions.delete(tenant_id, definition_id).await {
                Ok(_) => {
                    info!(
                        event_name = "workflow.definition.deleted",
                        tenant_id = %tenant_id,
                        definition_id = %definition_id,
                        "unused workflow definition deleted"
                    );
                    return Ok(Deactivation::Deleted);
                }
                // an instance was started since the count
                Err(RepositoryError::Database(sqlx::Error::Database(db)))
                    if db.is_foreign_key_violation() => {}
                Err(error) => return self.checked(tenant_id, Err(error)).await,
            }
        }

        definition.status = DefinitionStatus::Inactive;
        definition.updated_at = Utc::now();
        self.save_definition(tenant_id, &store, definition).await?;

        info!(
            event_name = "workflow.definition.deactivated",
            tenant_id = %tenant_id,
            definition_id = %definition_id,
            instances,
            "workflow definition deactivated"
        );
        Ok(Deactivation::Deactivated)
    }

    pub async fn list_definitions(
        &self,
        tenant_id: &TenantId,
        include_inactive: bool,
    ) -> Result<Vec<WorkflowDefinition>, ServiceError> {
        let store = self.open(tenant_id).await?;
        self.checked(tenant_id, store.definitions.list(tenant_id, include_inactive).await).await
    }

    pub async fn get_definition(
        &self,
        tenant_id: &TenantId,
        definition_id: &WorkflowDefinitionId,
    ) -> Result<WorkflowDefinition, ServiceError> {
        let store = self.open(tenant_id).await?;
        self.load_definition(tenant_id, &store, definition_id).await
    }

    /// Starts `definition_id` for the request's entity. Retrying a start that
    /// already went through returns the existing instance with `created: false`.
    pub async fn start(
        &self,
        tenant_id: &TenantId,
        definition_id: &WorkflowDefinitionId,
        request: StartRequest,
    ) -> Result<StartedInstance, ServiceError> {
        let store = self.open(tenant_id).await?;
        let definition = self
            .checked(tenant_id, store.definitions.find_by_id(tenant_id, definition_id).await)
            .await?
            .filter(WorkflowDefinition::is_active)
            .ok_or_else(|| WorkflowError::WorkflowNotFound { definition_id: definition_id.clone() })?;

        if !self.entities.entity_exists(tenant_id, &request.entity).await? {
            return Err(ServiceError::EntityNotFound(request.entity));
        }

        let live = self
            .checked(tenant_id, store.instances.find_live(tenant_id, definition_id, &request.entity).await)
            .await?;
        if let Some(instance) = live {
            debug!(
                event_name = "workflow.instance.start_replayed",
                tenant_id = %tenant_id,
                instance_id = %instance.id,
                "start matched an existing instance"
            );
            return Ok(StartedInstance { instance, created: false });
        }

        let entity = request.entity.clone();
        let outcome = self.engine.start(
            &definition,
            WorkflowInstanceId(Uuid::new_v4().to_string()),
            request,
            Utc::now(),
        )?;

        match store.instances.insert(&outcome.instance).await {
            Ok(()) => {}
            Err(RepositoryError::Conflict(_)) => {
                let winner = self
                    .checked(tenant_id, store.instances.find_live(tenant_id, definition_id, &entity).await)
                    .await?;
                if let Some(instance) = winner {
                    return Ok(StartedInstance { instance, created: false });
                }
                return Err(ServiceError::ConcurrentModification {
                    instance_id: outcome.instance.id,
                    attempts: 1,
                });
            }
            Err(error) => return self.checked(tenant_id, Err(error)).await,
        }

        info!(
            event_name = "workflow.instance.started",
            tenant_id = %tenant_id,
            instance_id = %outcome.instance.id,
            definition_id = %definition.id,
            entity = %outcome.instance.entity,
            stage = %outcome.to,
            "workflow instance started"
        );
        self.dispatch_actions(&definition, &outcome).await;
        Ok(StartedInstance { instance: outcome.instance, created: true })
    }

    /// Moves the instance to `request.target_stage`. A lost version race
    /// reloads the instance and re-checks the transition against it.
    pub async fn advance(
        &self,
        tenant_id: &TenantId,
        instance_id: &WorkflowInstanceId,
        request: AdvanceRequest,
    ) -> Result<TransitionOutcome, ServiceError> {
        let store = self.open(tenant_id).await?;

        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let instance = self.load_instance(tenant_id, &store, instance_id).await?;
            let definition = self.load_definition(tenant_id, &store, &instance.definition_id).await?;
            let outcome =
                self.engine.advance(&definition, &instance, request.clone(), Utc::now())?;

            if !self.persist(tenant_id, &store, &outcome, instance.version, attempt).await? {
                continue;
            }

            info!(
                event_name = "workflow.instance.advanced",
                tenant_id = %tenant_id,
                instance_id = %instance_id,
                from = outcome.from.as_deref().unwrap_or(""),
                to = %outcome.to,
                status = outcome.instance.status.as_str(),
                attempt,
                "workflow instance advanced"
            );
            self.dispatch_actions(&definition, &outcome).await;
            return Ok(outcome);
        }

        Err(ServiceError::ConcurrentModification {
            instance_id: instance_id.clone(),
            attempts: MAX_APPEND_ATTEMPTS,
        })
    }

    pub async fn cancel(
        &self,
        tenant_id: &TenantId,
        instance_id: &WorkflowInstanceId,
        actor: &str,
        reason: Option<String>,
    ) -> Result<WorkflowInstance, ServiceError> {
        let store = self.open(tenant_id).await?;

        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let instance = self.load_instance(tenant_id, &store, instance_id).await?;
            let outcome = self.engine.cancel(&instance, actor, reason.clone(), Utc::now())?;

            if !self.persist(tenant_id, &store, &outcome, instance.version, attempt).await? {
                continue;
            }

            info!(
                event_name = "workflow.instance.cancelled",
                tenant_id = %tenant_id,
                instance_id = %instance_id,
                stage = %outcome.to,
                "workflow instance cancelled"
            );
            return Ok(outcome.instance);
        }

        Err(ServiceError::ConcurrentModification {
            instance_id: instance_id.clone(),
            attempts: MAX_APPEND_ATTEMPTS,
        })
    }

    pub async fn get_instance(
        &self,
        tenant_id: &TenantId,
        instance_id: &WorkflowInstanceId,
    ) -> Result<WorkflowInstance, ServiceError> {
        let store = self.open(tenant_id).await?;
        self.load_instance(tenant_id, &store, instance_id).await
    }

    pub async fn instances_for_entity(
        &self,
        tenant_id: &TenantId,
        entity: &EntityRef,
    ) -> Result<Vec<WorkflowInstance>, ServiceError> {
        let store = self.open(tenant_id).await?;
        self.checked(tenant_id, store.instances.list_for_entity(tenant_id, entity).await).await
    }

    /// Progress percentage of one instance; 0 for an unknown instance.
    pub async fn progress(
        &self,
        tenant_id: &TenantId,
        instance_id: &WorkflowInstanceId,
    ) -> Result<u8, ServiceError> {
        let store = self.open(tenant_id).await?;
        let Some(instance) =
            self.checked(tenant_id, store.instances.find_by_id(tenant_id, instance_id).await).await?
        else {
            return Ok(0);
        };

        let tracked = self.track(tenant_id, &store, vec![instance]).await?;
        Ok(derivation::workflow_progress(tracked.first()))
    }

    pub async fn entity_status(
        &self,
        tenant_id: &TenantId,
        entity: &EntitySnapshot,
    ) -> Result<EntityStatus, ServiceError> {
        let store = self.open(tenant_id).await?;
        let instances = self
            .checked(tenant_id, store.instances.list_for_entity(tenant_id, &entity.entity).await)
            .await?;
        let tracked = self.track(tenant_id, &store, instances).await?;
        Ok(derivation::entity_status(entity, &tracked))
    }

    /// Status of every entity from one batched instance fetch and one batched
    /// definition fetch, independent of how many entities are asked for.
    pub async fn bulk_status(
        &self,
        tenant_id: &TenantId,
        entities: &[EntitySnapshot],
    ) -> Result<Vec<EntityStatus>, ServiceError> {
        let store = self.open(tenant_id).await?;
        if entities.is_empty() {
            return Ok(Vec::new());
        }

        let refs: Vec<EntityRef> = entities.iter().map(|entity| entity.entity.clone()).collect();
        let instances =
            self.checked(tenant_id, store.instances.list_for_entities(tenant_id, &refs).await).await?;
        let tracked = self.track(tenant_id, &store, instances).await?;
        Ok(derivation::bulk_status(entities, tracked))
    }

    async fn load_definition(
        &self,
        tenant_id: &TenantId,
        store: &TenantStore,
        definition_id: &WorkflowDefinitionId,
    ) -> Result<WorkflowDefinition, ServiceError> {
        self.checked(tenant_id, store.definitions.find_by_id(tenant_id, definition_id).await)
            .await?
            .ok_or_else(|| ServiceError::DefinitionNotFound(definition_id.clone()))
    }

    async fn load_instance(
        &self,
        tenant_id: &TenantId,
        store: &TenantStore,
        instance_id: &WorkflowInstanceId,
    ) -> Result<WorkflowInstance, ServiceError> {
        self.checked(tenant_id, store.instances.find_by_id(tenant_id, instance_id).await)
            .await?
            .ok_or_else(|| ServiceError::InstanceNotFound(instance_id.clone()))
    }

    async fn save_definition(
        &self,
        tenant_id: &TenantId,
        store: &TenantStore,
        definition: WorkflowDefinition,
    ) -> Result<(), ServiceError> {
        let name = definition.name.clone();
        match store.definitions.save(definition).await {
            Ok(()) => Ok(()),
            Err(RepositoryError::Conflict(_)) => Err(ServiceError::DuplicateName { name }),
            Err(error) => self.checked(tenant_id, Err(error)).await,
        }
    }

    /// Returns false when another writer got there first.
    async fn persist(
        &self,
        tenant_id: &TenantId,
        store: &TenantStore,
        outcome: &TransitionOutcome,
        expected_version: u32,
        attempt: u32,
    ) -> Result<bool, ServiceError> {
        match store.instances.append_transition(&outcome.instance, expected_version).await {
            Ok(()) => Ok(true),
            Err(RepositoryError::VersionConflict { .. }) => {
                debug!(
                    event_name = "workflow.instance.version_conflict",
                    tenant_id = %tenant_id,
                    instance_id = %outcome.instance.id,
                    expected_version,
                    attempt,
                    "instance changed underneath transition; retrying"
                );
                Ok(false)
            }
            Err(error) => self.checked(tenant_id, Err(error)).await,
        }
    }

    async fn track(
        &self,
        tenant_id: &TenantId,
        store: &TenantStore,
        instances: Vec<WorkflowInstance>,
    ) -> Result<Vec<TrackedWorkflow>, ServiceError> {
        let ids: Vec<WorkflowDefinitionId> = instances
            .iter()
            .map(|instance| instance.definition_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let definitions: HashMap<WorkflowDefinitionId, Arc<WorkflowDefinition>> = self
            .checked(tenant_id, store.definitions.list_by_ids(tenant_id, &ids).await)
            .await?
            .into_iter()
            .map(|definition| (definition.id.clone(), Arc::new(definition)))
            .collect();

        Ok(instances
            .into_iter()
            .filter_map(|instance| {
                let definition = definitions.get(&instance.definition_id).cloned()?;
                Some(TrackedWorkflow::new(instance, definition))
            })
            .collect())
    }

    /// Hands the entered stage's actions to the executor once the transition
    /// is stored. Delivery failures are logged and never undo the transition.
    async fn dispatch_actions(&self, definition: &WorkflowDefinition, outcome: &TransitionOutcome) {
        if outcome.actions.is_empty() {
            return;
        }
        let Some(stage) = definition.stage(&outcome.to) else {
            return;
        };

        if let Err(error) = self.actions.execute_stage_actions(stage, &outcome.instance).await {
            warn!(
                event_name = "workflow.actions.failed",
                tenant_id = %outcome.instance.tenant_id,
                instance_id = %outcome.instance.id,
                stage = %stage.id,
                error = %error,
                "stage actions failed"
            );
        }
    }
}
