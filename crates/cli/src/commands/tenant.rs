//! Tenant onboarding and lifecycle commands against the registry.

use chrono::SecondsFormat;
use secrecy::ExposeSecret;
use serde::Serialize;
use tenantflow_core::config::{is_sqlite_url, LoadOptions};
use tenantflow_core::{ConnectionDescriptor, Tenant, TenantId, TenantStatus};
use tenantflow_db::{connect_with_settings, migrations, SqlTenantRegistry, TenantRegistry};
use tracing::info;

use crate::commands::{
    build_runtime, connect_registry, load_config, CommandResult, Failure, EXIT_CONFIG,
    EXIT_CONNECTIVITY, EXIT_MIGRATION, EXIT_NOT_FOUND,
};

#[derive(Debug, Clone)]
pub struct NewTenant {
    pub id: String,
    pub name: String,
    pub url: String,
    pub max_connections: u32,
}

/// Registry view of a tenant. The connection URL stays out of it.
#[derive(Debug, Serialize)]
struct TenantSummary {
    id: String,
    name: String,
    status: &'static str,
    max_connections: u32,
    fingerprint: String,
    created_at: String,
    updated_at: String,
}

impl From<&Tenant> for TenantSummary {
    fn from(tenant: &Tenant) -> Self {
        Self {
            id: tenant.id.to_string(),
            name: tenant.name.clone(),
            status: tenant.status.as_str(),
            max_connections: tenant.descriptor.max_connections,
            fingerprint: tenant.descriptor.fingerprint(),
            created_at: tenant.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            updated_at: tenant.updated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

pub fn add(options: LoadOptions, new: NewTenant) -> CommandResult {
    const COMMAND: &str = "tenant add";

    if new.id.trim().is_empty() {
        return CommandResult::failure(COMMAND, "invalid_input", "tenant id must not be empty", EXIT_CONFIG);
    }
    if !is_sqlite_url(&new.url) {
        return CommandResult::failure(
            COMMAND,
            "invalid_input",
            "tenant url must be a sqlite URL (`sqlite://...`)",
            EXIT_CONFIG,
        );
    }
    if new.max_connections == 0 {
        return CommandResult::failure(
            COMMAND,
            "invalid_input",
            "max connections must be greater than zero",
            EXIT_CONFIG,
        );
    }

    with_registry(COMMAND, options, |registry| async move {
        let tenant = Tenant::new(
            new.id.trim(),
            new.name,
            ConnectionDescriptor::new(new.url, new.max_connections),
        );
        let summary = TenantSummary::from(&tenant);
        registry.register(tenant).await?;
        info!(
            event_name = "registry.tenant.registered",
            tenant_id = %summary.id,
            "tenant registered"
        );
        Ok(CommandResult::success_with_data(
            COMMAND,
            format!("registered tenant `{}`", summary.id),
            serde_json::to_value(&summary).ok(),
        ))
    })
}

pub fn list(options: LoadOptions) -> CommandResult {
    const COMMAND: &str = "tenant list";

    with_registry(COMMAND, options, |registry| async move {
        let tenants = registry.list().await?;
        let summaries: Vec<TenantSummary> = tenants.iter().map(TenantSummary::from).collect();
        Ok(CommandResult::success_with_data(
            COMMAND,
            format!("{} tenant(s) registered", summaries.len()),
            serde_json::to_value(&summaries).ok(),
        ))
    })
}

/// Running services observe the new status on their next resolve, since the
/// router consults the registry every time.
pub fn set_status(options: LoadOptions, id: String, status: TenantStatus) -> CommandResult {
    const COMMAND: &str = "tenant set-status";

    with_registry(COMMAND, options, |registry| async move {
        let tenant_id = TenantId::from(id.as_str());
        let Some(tenant) = registry.set_status(&tenant_id, status).await? else {
            return Err(not_found(&tenant_id));
        };
        info!(
            event_name = "registry.tenant.status_changed",
            tenant_id = %tenant_id,
            status = status.as_str(),
            "tenant status changed"
        );
        Ok(CommandResult::success_with_data(
            COMMAND,
            format!("tenant `{tenant_id}` is now {}", status.as_str()),
            serde_json::to_value(TenantSummary::from(&tenant)).ok(),
        ))
    })
}

/// Applies pending tenant-schema migrations to one tenant's database,
/// whatever the tenant's status.
pub fn migrate(options: LoadOptions, id: String) -> CommandResult {
    const COMMAND: &str = "tenant migrate";

    with_registry(COMMAND, options, |registry| async move {
        let tenant_id = TenantId::from(id.as_str());
        let Some(tenant) = registry.find(&tenant_id).await? else {
            return Err(not_found(&tenant_id));
        };

        let pool = connect_with_settings(
            tenant.descriptor.url.expose_secret(),
            tenant.descriptor.max_connections,
            30,
        )
        .await
        .map_err(|error| {
            Failure::new(
                "db_connectivity",
                format!("failed to connect to tenant `{tenant_id}`: {error}"),
                EXIT_CONNECTIVITY,
            )
        })?;
        let applied = migrations::run_tenant(&pool)
            .await
            .map_err(|error| Failure::new("migration", error.to_string(), EXIT_MIGRATION));
        pool.close().await;
        applied?;

        Ok(CommandResult::success(
            COMMAND,
            format!("applied pending migrations for tenant `{tenant_id}`"),
        ))
    })
}

fn not_found(tenant_id: &TenantId) -> Failure {
    Failure::new("not_found", format!("tenant `{tenant_id}` is not registered"), EXIT_NOT_FOUND)
}

fn with_registry<F, Fut>(command: &str, options: LoadOptions, body: F) -> CommandResult
where
    F: FnOnce(SqlTenantRegistry) -> Fut,
    Fut: std::future::Future<Output = Result<CommandResult, Failure>>,
{
    let config = match load_config(command, options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime(command) {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_registry(&config).await?;
        let outcome = body(SqlTenantRegistry::new(pool.clone())).await;
        pool.close().await;
        outcome
    });

    result.unwrap_or_else(|failure| failure.render(command))
}
