use std::collections::HashMap;

use tokio::sync::RwLock;

use tenantflow_core::domain::instance::{EntityRef, WorkflowInstance, WorkflowInstanceId};
use tenantflow_core::domain::tenant::TenantId;
use tenantflow_core::domain::workflow::{WorkflowDefinition, WorkflowDefinitionId};

use super::{RepositoryError, WorkflowDefinitionRepository, WorkflowInstanceRepository};

type Key = (TenantId, String);

#[derive(Default)]
pub struct InMemoryWorkflowDefinitionRepository {
    definitions: RwLock<HashMap<Key, WorkflowDefinition>>,
}

#[async_trait::async_trait]
impl WorkflowDefinitionRepository for InMemoryWorkflowDefinitionRepository {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &WorkflowDefinitionId,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let definitions = self.definitions.read().await;
        Ok(definitions.get(&(tenant_id.clone(), id.0.clone())).cloned())
    }

    async fn find_active_by_name(
        &self,
        tenant_id: &TenantId,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let definitions = self.definitions.read().await;
        Ok(definitions
            .values()
            .find(|def| &def.tenant_id == tenant_id && def.name == name && def.is_active())
            .cloned())
    }

    async fn list(
        &self,
        tenant_id: &TenantId,
        include_inactive: bool,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let definitions = self.definitions.read().await;
        let mut listed: Vec<WorkflowDefinition> = definitions
            .values()
            .filter(|def| &def.tenant_id == tenant_id && (include_inactive || def.is_active()))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.name.cmp(&b.name).then(a.created_at.cmp(&b.created_at)));
        Ok(listed)
    }

    async fn list_by_ids(
        &self,
        tenant_id: &TenantId,
        ids: &[WorkflowDefinitionId],
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let definitions = self.definitions.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| definitions.get(&(tenant_id.clone(), id.0.clone())).cloned())
            .collect())
    }

    async fn save(&self, definition: WorkflowDefinition) -> Result<(), RepositoryError> {
        let mut definitions = self.definitions.write().await;
        let clash = definition.is_active()
            && definitions.values().any(|existing| {
                existing.tenant_id == definition.tenant_id
                    && existing.id != definition.id
                    && existing.name == definition.name
                    && existing.is_active()
            });
        if clash {
            return Err(RepositoryError::Conflict(format!(
                "active definition `{}`",
                definition.name
            )));
        }

        definitions.insert((definition.tenant_id.clone(), definition.id.0.clone()), definition);
        Ok(())
    }

    async fn delete(
        &self,
        tenant_id: &TenantId,
        id: &WorkflowDefinitionId,
    ) -> Result<bool, RepositoryError> {
        let mut definitions = self.definitions.write().await;
        Ok(definitions.remove(&(tenant_id.clone(), id.0.clone())).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryWorkflowInstanceRepository {
    instances: RwLock<HashMap<Key, WorkflowInstance>>,
}

fn is_live_match(
    instance: &WorkflowInstance,
    tenant_id: &TenantId,
    definition_id: &WorkflowDefinitionId,
    entity: &EntityRef,
) -> bool {
    &instance.tenant_id == tenant_id
        && &instance.definition_id == definition_id
        && &instance.entity == entity
        && instance.status != tenantflow_core::domain::instance::InstanceStatus::Cancelled
}

#[async_trait::async_trait]
impl WorkflowInstanceRepository for InMemoryWorkflowInstanceRepository {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &WorkflowInstanceId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let instances = self.instances.read().await;
        Ok(instances.get(&(tenant_id.clone(), id.0.clone())).cloned())
    }

    async fn find_live(
        &self,
        tenant_id: &TenantId,
        definition_id: &WorkflowDefinitionId,
        entity: &EntityRef,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .find(|instance| is_live_match(instance, tenant_id, definition_id, entity))
            .cloned())
    }

    async fn list_for_entity(
        &self,
        tenant_id: &TenantId,
        entity: &EntityRef,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        self.list_for_entities(tenant_id, std::slice::from_ref(entity)).await
    }

    async fn list_for_entities(
        &self,
        tenant_id: &TenantId,
        entities: &[EntityRef],
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let instances = self.instances.read().await;
        let mut listed: Vec<WorkflowInstance> = instances
            .values()
            .filter(|instance| {
                &instance.tenant_id == tenant_id && entities.contains(&instance.entity)
            })
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.0.cmp(&b.id.0)));
        Ok(listed)
    }

    async fn count_for_definition(
        &self,
        tenant_id: &TenantId,
        definition_id: &WorkflowDefinitionId,
    ) -> Result<u64, RepositoryError> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| &i.tenant_id == tenant_id && &i.definition_id == definition_id)
            .count() as u64)
    }

    async fn insert(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let mut instances = self.instances.write().await;
        let clash = instances.values().any(|existing| {
            is_live_match(existing, &instance.tenant_id, &instance.definition_id, &instance.entity)
        });
        if clash {
            return Err(RepositoryError::Conflict(format!(
                "live instance of `{}` for {}",
                instance.definition_id, instance.entity
            )));
        }

        instances.insert((instance.tenant_id.clone(), instance.id.0.clone()), instance.clone());
        Ok(())
    }

    async fn append_transition(
        &self,
        instance: &WorkflowInstance,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let mut instances = self.instances.write().await;
        let key = (instance.tenant_id.clone(), instance.id.0.clone());
        match instances.get_mut(&key) {
            Some(stored) if stored.version == expected_version => {
                *stored = instance.clone();
                Ok(())
            }
            _ => Err(RepositoryError::VersionConflict {
                instance_id: instance.id.clone(),
                expected: expected_version,
            }),
        }
    }
}
