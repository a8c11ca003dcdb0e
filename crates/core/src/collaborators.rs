use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::instance::{EntityRef, WorkflowInstance, WorkflowInstanceId};
use crate::domain::tenant::TenantId;
use crate::domain::workflow::{Stage, StageAction};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CollaboratorError(pub String);

/// Answers whether a business entity exists in a tenant's data.
#[async_trait]
pub trait EntityDirectory: Send + Sync {
    async fn entity_exists(
        &self,
        tenant_id: &TenantId,
        entity: &EntityRef,
    ) -> Result<bool, CollaboratorError>;
}

/// Delivers the notifications, webhooks, emails and assignments a stage
/// declares. The workflow engine hands stages over after the transition is
/// durable; it never delivers anything itself.
#[async_trait]
pub trait StageActionExecutor: Send + Sync {
    async fn execute_stage_actions(
        &self,
        stage: &Stage,
        instance: &WorkflowInstance,
    ) -> Result<(), CollaboratorError>;
}

#[derive(Clone, Default)]
pub struct InMemoryEntityDirectory {
    entities: Arc<Mutex<HashSet<(TenantId, EntityRef)>>>,
}

impl InMemoryEntityDirectory {
    pub fn insert(&self, tenant_id: TenantId, entity: EntityRef) {
        match self.entities.lock() {
            Ok(mut entities) => entities.insert((tenant_id, entity)),
            Err(poisoned) => poisoned.into_inner().insert((tenant_id, entity)),
        };
    }
}

#[async_trait]
impl EntityDirectory for InMemoryEntityDirectory {
    async fn entity_exists(
        &self,
        tenant_id: &TenantId,
        entity: &EntityRef,
    ) -> Result<bool, CollaboratorError> {
        let key = (tenant_id.clone(), entity.clone());
        let exists = match self.entities.lock() {
            Ok(entities) => entities.contains(&key),
            Err(poisoned) => poisoned.into_inner().contains(&key),
        };
        Ok(exists)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopActionExecutor;

#[async_trait]
impl StageActionExecutor for NoopActionExecutor {
    async fn execute_stage_actions(
        &self,
        _stage: &Stage,
        _instance: &WorkflowInstance,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutedStageActions {
    pub instance_id: WorkflowInstanceId,
    pub stage_id: String,
    pub actions: Vec<StageAction>,
}

/// Records every dispatch instead of delivering it.
#[derive(Clone, Default)]
pub struct RecordingActionExecutor {
    executed: Arc<Mutex<Vec<ExecutedStageActions>>>,
}

impl RecordingActionExecutor {
    pub fn executed(&self) -> Vec<ExecutedStageActions> {
        match self.executed.lock() {
            Ok(executed) => executed.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl StageActionExecutor for RecordingActionExecutor {
    async fn execute_stage_actions(
        &self,
        stage: &Stage,
        instance: &WorkflowInstance,
    ) -> Result<(), CollaboratorError> {
        let record = ExecutedStageActions {
            instance_id: instance.id.clone(),
            stage_id: stage.id.clone(),
            actions: stage.actions.clone(),
        };
        match self.executed.lock() {
            Ok(mut executed) => executed.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
        Ok(())
    }
}
