use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use tenantflow_core::domain::tenant::TenantId;

use crate::registry::TenantRegistry;
use crate::repositories::{
    InMemoryWorkflowDefinitionRepository, InMemoryWorkflowInstanceRepository, RepositoryError,
    SqlWorkflowDefinitionRepository, SqlWorkflowInstanceRepository, WorkflowDefinitionRepository,
    WorkflowInstanceRepository,
};
use crate::router::{ConnectionRouter, RouterError};

/// Workflow repositories bound to one tenant's data.
#[derive(Clone)]
pub struct TenantStore {
    pub definitions: Arc<dyn WorkflowDefinitionRepository>,
    pub instances: Arc<dyn WorkflowInstanceRepository>,
}

/// Hands out a tenant's store after checking the tenant may be served.
#[async_trait]
pub trait TenantStores: Send + Sync {
    async fn open(&self, tenant_id: &TenantId) -> Result<TenantStore, RouterError>;

    /// Feeds a failed repository call back to whatever owns the connection.
    async fn report_failure(&self, _tenant_id: &TenantId, _error: &RepositoryError) {}
}

/// SQL repositories on top of the router's per-tenant pools.
pub struct RoutedTenantStores {
    router: Arc<ConnectionRouter>,
}

impl RoutedTenantStores {
    pub fn new(router: Arc<ConnectionRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl TenantStores for RoutedTenantStores {
    async fn open(&self, tenant_id: &TenantId) -> Result<TenantStore, RouterError> {
        let handle = self.router.resolve(tenant_id).await?;
        let pool = handle.pool().clone();
        Ok(TenantStore {
            definitions: Arc::new(SqlWorkflowDefinitionRepository::new(pool.clone())),
            instances: Arc::new(SqlWorkflowInstanceRepository::new(pool)),
        })
    }

    async fn report_failure(&self, tenant_id: &TenantId, error: &RepositoryError) {
        if let RepositoryError::Database(error) = error {
            self.router.report_failure(tenant_id, error).await;
        }
    }
}

/// Process-local stores, one pair of in-memory repositories per tenant.
pub struct InMemoryTenantStores {
    registry: Arc<dyn TenantRegistry>,
    stores: RwLock<HashMap<TenantId, TenantStore>>,
}

impl InMemoryTenantStores {
    pub fn new(registry: Arc<dyn TenantRegistry>) -> Self {
        Self { registry, stores: RwLock::new(HashMap::new()) }
    }
}

#[async_trait]
impl TenantStores for InMemoryTenantStores {
    async fn open(&self, tenant_id: &TenantId) -> Result<TenantStore, RouterError> {
        let tenant = self
            .registry
            .find(tenant_id)
            .await?
            .ok_or_else(|| RouterError::TenantNotFound(tenant_id.clone()))?;
        if !tenant.is_active() {
            return Err(RouterError::TenantInactive { tenant_id: tenant.id, status: tenant.status });
        }

        let mut stores = self.stores.write().await;
        let store = stores.entry(tenant.id).or_insert_with(|| TenantStore {
            definitions: Arc::new(InMemoryWorkflowDefinitionRepository::default()),
            instances: Arc::new(InMemoryWorkflowInstanceRepository::default()),
        });
        Ok(store.clone())
    }
}
