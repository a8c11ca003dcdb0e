//! Tenant-to-store routing. Handles are built lazily, at most once per tenant
//! and descriptor, and shared by every caller until evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};

use tenantflow_core::config::RouterConfig;
use tenantflow_core::domain::tenant::{Tenant, TenantId, TenantStatus};
use tenantflow_core::errors::{ClassifiedError, ErrorKind};

use crate::registry::TenantRegistry;
use crate::repositories::RepositoryError;
use crate::{connect_with_settings, migrations, DbPool};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("tenant `{0}` is not registered")]
    TenantNotFound(TenantId),
    #[error("tenant `{tenant_id}` is {}", .status.as_str())]
    TenantInactive { tenant_id: TenantId, status: TenantStatus },
    #[error("could not connect to the store of tenant `{tenant_id}`: {message}")]
    Connection { tenant_id: TenantId, message: String },
    #[error("timed out after {timeout_ms}ms acquiring a handle for tenant `{tenant_id}`")]
    Timeout { tenant_id: TenantId, timeout_ms: u64 },
    #[error("tenant registry unavailable: {0}")]
    Registry(#[from] RepositoryError),
}

impl ClassifiedError for RouterError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::TenantNotFound(_) => ErrorKind::TenantNotFound,
            Self::TenantInactive { .. } => ErrorKind::TenantInactive,
            Self::Connection { .. } => ErrorKind::ConnectionError,
            Self::Timeout { .. } => ErrorKind::ConnectionTimeout,
            Self::Registry(_) => ErrorKind::Persistence,
        }
    }
}

/// Errors worth another connect attempt.
pub fn is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // SQLITE_BUSY
        sqlx::Error::Database(db) => db.code().as_deref() == Some("5"),
        _ => false,
    }
}

/// Errors that say the handle itself is unhealthy rather than the query.
pub fn is_connection_fault(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

/// Opens the pool behind a tenant handle.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, tenant: &Tenant) -> Result<DbPool, sqlx::Error>;
}

pub struct SqliteConnector {
    acquire_timeout_secs: u64,
    max_connections: u32,
    migrate_on_connect: bool,
}

impl SqliteConnector {
    pub fn new(settings: &RouterConfig) -> Self {
        Self {
            acquire_timeout_secs: settings.acquire_timeout_secs,
            max_connections: settings.tenant_max_connections,
            migrate_on_connect: settings.migrate_on_connect,
        }
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    async fn connect(&self, tenant: &Tenant) -> Result<DbPool, sqlx::Error> {
        let max_connections = tenant.descriptor.max_connections.min(self.max_connections);
        let pool = connect_with_settings(
            tenant.descriptor.url.expose_secret(),
            max_connections,
            self.acquire_timeout_secs,
        )
        .await?;

        if self.migrate_on_connect {
            if let Err(error) = migrations::run_tenant(&pool).await {
                pool.close().await;
                return Err(sqlx::Error::Migrate(Box::new(error)));
            }
        }

        Ok(pool)
    }
}

/// A live pool bound to one tenant.
#[derive(Debug)]
pub struct TenantHandle {
    tenant_id: TenantId,
    pool: DbPool,
    fingerprint: String,
}

impl TenantHandle {
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

struct HandleSlot {
    fingerprint: String,
    handle: OnceCell<Arc<TenantHandle>>,
    failures: AtomicU32,
}

impl HandleSlot {
    fn new(fingerprint: String) -> Self {
        Self { fingerprint, handle: OnceCell::new(), failures: AtomicU32::new(0) }
    }
}

pub struct ConnectionRouter {
    registry: Arc<dyn TenantRegistry>,
    connector: Arc<dyn Connector>,
    settings: RouterConfig,
    slots: RwLock<HashMap<TenantId, Arc<HandleSlot>>>,
}

impl ConnectionRouter {
    pub fn new(
        registry: Arc<dyn TenantRegistry>,
        connector: Arc<dyn Connector>,
        settings: RouterConfig,
    ) -> Self {
        Self { registry, connector, settings, slots: RwLock::new(HashMap::new()) }
    }

    pub fn with_sqlite(registry: Arc<dyn TenantRegistry>, settings: RouterConfig) -> Self {
        let connector = Arc::new(SqliteConnector::new(&settings));
        Self::new(registry, connector, settings)
    }

    /// Returns the tenant's shared handle, creating it on first use. The whole
    /// lookup is bounded by the configured acquire timeout.
    pub async fn resolve(&self, tenant_id: &TenantId) -> Result<Arc<TenantHandle>, RouterError> {
        let timeout = self.settings.acquire_timeout();
        match tokio::time::timeout(timeout, self.resolve_unbounded(tenant_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    event_name = "router.resolve.timeout",
                    tenant_id = %tenant_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "tenant handle acquisition timed out"
                );
                Err(RouterError::Timeout {
                    tenant_id: tenant_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn resolve_unbounded(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Arc<TenantHandle>, RouterError> {
        let tenant = self
            .registry
            .find(tenant_id)
            .await?
            .ok_or_else(|| RouterError::TenantNotFound(tenant_id.clone()))?;

        if !tenant.is_active() {
            self.evict(tenant_id, "tenant_inactive").await;
            return Err(RouterError::TenantInactive {
                tenant_id: tenant.id.clone(),
                status: tenant.status,
            });
        }

        let fingerprint = tenant.descriptor.fingerprint();
        let slot = self.slot_for(&tenant.id, &fingerprint).await;
        let handle = slot.handle.get_or_try_init(|| self.open_handle(&tenant, &fingerprint)).await?;
        Ok(Arc::clone(handle))
    }

    async fn slot_for(&self, tenant_id: &TenantId, fingerprint: &str) -> Arc<HandleSlot> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(tenant_id) {
                if slot.fingerprint == fingerprint {
                    return Arc::clone(slot);
                }
            }
        }

        let mut slots = self.slots.write().await;
        let replaced = match slots.get(tenant_id) {
            Some(slot) if slot.fingerprint == fingerprint => return Arc::clone(slot),
            Some(slot) => slot.handle.initialized(),
            None => false,
        };
        let slot = Arc::new(HandleSlot::new(fingerprint.to_string()));
        slots.insert(tenant_id.clone(), Arc::clone(&slot));

        if replaced {
            info!(
                event_name = "router.handle.evicted",
                tenant_id = %tenant_id,
                reason = "descriptor_changed",
                "tenant handle evicted"
            );
        }
        slot
    }

    async fn open_handle(
        &self,
        tenant: &Tenant,
        fingerprint: &str,
    ) -> Result<Arc<TenantHandle>, RouterError> {
        let pool = self.connect_with_retry(tenant).await?;
        info!(
            event_name = "router.handle.created",
            tenant_id = %tenant.id,
            max_connections = tenant.descriptor.max_connections,
            "tenant handle created"
        );

        Ok(Arc::new(TenantHandle {
            tenant_id: tenant.id.clone(),
            pool,
            fingerprint: fingerprint.to_string(),
        }))
    }

    async fn connect_with_retry(&self, tenant: &Tenant) -> Result<DbPool, RouterError> {
        let max_attempts = self.settings.max_connect_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.connector.connect(tenant).await {
                Ok(pool) => return Ok(pool),
                Err(error) if is_transient(&error) && attempt < max_attempts => {
                    let delay = self.settings.retry_delay(attempt);
                    warn!(
                        event_name = "router.connect.retry",
                        tenant_id = %tenant.id,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient connect failure"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(error) => {
                    warn!(
                        event_name = "router.connect.failed",
                        tenant_id = %tenant.id,
                        attempt,
                        error = %error,
                        "tenant connect failed"
                    );
                    return Err(RouterError::Connection {
                        tenant_id: tenant.id.clone(),
                        message: error.to_string(),
                    });
                }
            }
        }
    }

    /// Drops the cached handle, if any. The next `resolve` rebuilds it.
    pub async fn invalidate(&self, tenant_id: &TenantId) -> bool {
        self.evict(tenant_id, "invalidated").await
    }

    async fn evict(&self, tenant_id: &TenantId, reason: &'static str) -> bool {
        let removed = self.slots.write().await.remove(tenant_id);
        let evicted = removed.is_some_and(|slot| slot.handle.initialized());
        if evicted {
            info!(
                event_name = "router.handle.evicted",
                tenant_id = %tenant_id,
                reason,
                "tenant handle evicted"
            );
        }
        evicted
    }

    /// Records an error seen on the tenant's handle. Connection faults count
    /// towards eviction; a closed pool is evicted at once. Returns whether the
    /// handle was evicted.
    pub async fn report_failure(&self, tenant_id: &TenantId, error: &sqlx::Error) -> bool {
        if !is_connection_fault(error) {
            return false;
        }

        let Some(slot) = self.slots.read().await.get(tenant_id).cloned() else {
            return false;
        };
        let failures = slot.failures.fetch_add(1, Ordering::SeqCst) + 1;
        let closed = matches!(error, sqlx::Error::PoolClosed);
        if !closed && failures < self.settings.failure_eviction_threshold {
            return false;
        }

        let mut slots = self.slots.write().await;
        if !slots.get(tenant_id).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
            return false;
        }
        slots.remove(tenant_id);
        drop(slots);

        warn!(
            event_name = "router.handle.evicted",
            tenant_id = %tenant_id,
            reason = "connection_failures",
            failures,
            error = %error,
            "tenant handle evicted"
        );
        true
    }

    pub async fn report_success(&self, tenant_id: &TenantId) {
        if let Some(slot) = self.slots.read().await.get(tenant_id) {
            slot.failures.store(0, Ordering::SeqCst);
        }
    }

    /// Tenants that currently hold a live handle, sorted by id.
    pub async fn cached_tenants(&self) -> Vec<TenantId> {
        let slots = self.slots.read().await;
        let mut cached: Vec<TenantId> = slots
            .iter()
            .filter(|(_, slot)| slot.handle.initialized())
            .map(|(tenant_id, _)| tenant_id.clone())
            .collect();
        cached.sort();
        cached
    }
}
