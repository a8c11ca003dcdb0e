//! The global tenant directory. Every router lookup starts here.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::ExposeSecret;
use sqlx::Row;
use tokio::sync::RwLock;

use tenantflow_core::domain::tenant::{
    ConnectionDescriptor, Tenant, TenantFeatures, TenantId, TenantStatus,
};

use crate::repositories::{decode_json, encode_json, parse_timestamp, RepositoryError};
use crate::DbPool;

#[async_trait]
pub trait TenantRegistry: Send + Sync {
    /// Adds a new tenant; an existing id yields `Conflict`.
    async fn register(&self, tenant: Tenant) -> Result<(), RepositoryError>;

    async fn find(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError>;

    async fn list(&self) -> Result<Vec<Tenant>, RepositoryError>;

    /// Returns the updated tenant, or `None` when the id is unknown.
    async fn set_status(
        &self,
        id: &TenantId,
        status: TenantStatus,
    ) -> Result<Option<Tenant>, RepositoryError>;

    async fn update_descriptor(
        &self,
        id: &TenantId,
        descriptor: ConnectionDescriptor,
    ) -> Result<Option<Tenant>, RepositoryError>;

    async fn features(&self, id: &TenantId) -> Result<Option<TenantFeatures>, RepositoryError> {
        Ok(self.find(id).await?.map(|tenant| tenant.features))
    }
}

pub struct SqlTenantRegistry {
    pool: DbPool,
}

impl SqlTenantRegistry {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_tenant(row: &sqlx::sqlite::SqliteRow) -> Result<Tenant, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let name: String = row.try_get("name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let connection_url: String =
        row.try_get("connection_url").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let max_connections: i64 =
        row.try_get("max_connections").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let status: String = row.try_get("status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let features_json: String =
        row.try_get("features_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let max_connections = u32::try_from(max_connections).map_err(|_| {
        RepositoryError::Decode(format!("max_connections out of range: {max_connections}"))
    })?;
    let status = TenantStatus::parse(&status)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown tenant status `{status}`")))?;

    Ok(Tenant {
        id: TenantId(id),
        name,
        descriptor: ConnectionDescriptor::new(connection_url, max_connections),
        status,
        features: decode_json("features_json", &features_json)?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

const TENANT_COLUMNS: &str = "id, name, connection_url, max_connections, status, features_json,
     created_at, updated_at";

#[async_trait]
impl TenantRegistry for SqlTenantRegistry {
    async fn register(&self, tenant: Tenant) -> Result<(), RepositoryError> {
        let features_json = encode_json("features", &tenant.features)?;

        sqlx::query(
            "INSERT INTO tenants (id, name, connection_url, max_connections, status,
                                  features_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&tenant.id.0)
        .bind(&tenant.name)
        .bind(tenant.descriptor.url.expose_secret())
        .bind(i64::from(tenant.descriptor.max_connections))
        .bind(tenant.status.as_str())
        .bind(features_json)
        .bind(tenant.created_at.to_rfc3339())
        .bind(tenant.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|error| RepositoryError::from_write(error, format!("tenant `{}`", tenant.id)))?;

        Ok(())
    }

    async fn find(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_tenant).transpose()
    }

    async fn list(&self) -> Result<Vec<Tenant>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {TENANT_COLUMNS} FROM tenants ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_tenant).collect()
    }

    async fn set_status(
        &self,
        id: &TenantId,
        status: TenantStatus,
    ) -> Result<Option<Tenant>, RepositoryError> {
        let result = sqlx::query("UPDATE tenants SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.find(id).await
    }

    async fn update_descriptor(
        &self,
        id: &TenantId,
        descriptor: ConnectionDescriptor,
    ) -> Result<Option<Tenant>, RepositoryError> {
        let result = sqlx::query(
            "UPDATE tenants SET connection_url = ?, max_connections = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(descriptor.url.expose_secret())
        .bind(i64::from(descriptor.max_connections))
        .bind(Utc::now().to_rfc3339())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.find(id).await
    }
}

#[derive(Default)]
pub struct InMemoryTenantRegistry {
    tenants: RwLock<HashMap<TenantId, Tenant>>,
}

#[async_trait]
impl TenantRegistry for InMemoryTenantRegistry {
    async fn register(&self, tenant: Tenant) -> Result<(), RepositoryError> {
        let mut tenants = self.tenants.write().await;
        if tenants.contains_key(&tenant.id) {
            return Err(RepositoryError::Conflict(format!("tenant `{}`", tenant.id)));
        }
        tenants.insert(tenant.id.clone(), tenant);
        Ok(())
    }

    async fn find(&self, id: &TenantId) -> Result<Option<Tenant>, RepositoryError> {
        let tenants = self.tenants.read().await;
        Ok(tenants.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Tenant>, RepositoryError> {
        let tenants = self.tenants.read().await;
        let mut listed: Vec<Tenant> = tenants.values().cloned().collect();
        listed.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(listed)
    }

    async fn set_status(
        &self,
        id: &TenantId,
        status: TenantStatus,
    ) -> Result<Option<Tenant>, RepositoryError> {
        let mut tenants = self.tenants.write().await;
        Ok(tenants.get_mut(id).map(|tenant| {
            tenant.status = status;
            tenant.updated_at = Utc::now();
            tenant.clone()
        }))
    }

    async fn update_descriptor(
        &self,
        id: &TenantId,
        descriptor: ConnectionDescriptor,
    ) -> Result<Option<Tenant>, RepositoryError> {
        let mut tenants = self.tenants.write().await;
        Ok(tenants.get_mut(id).map(|tenant| {
            tenant.descriptor = descriptor;
            tenant.updated_at = Utc::now();
            tenant.clone()
        }))
    }
}
