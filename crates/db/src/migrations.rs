use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

/// Schema of the global tenant registry.
pub static REGISTRY_MIGRATOR: Migrator = sqlx::migrate!("../../migrations/registry");

/// Schema applied to every tenant's own database.
pub static TENANT_MIGRATOR: Migrator = sqlx::migrate!("../../migrations/tenant");

pub async fn run_registry(pool: &DbPool) -> Result<(), MigrateError> {
    REGISTRY_MIGRATOR.run(pool).await
}

pub async fn run_tenant(pool: &DbPool) -> Result<(), MigrateError> {
    TENANT_MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::{run_registry, run_tenant, REGISTRY_MIGRATOR, TENANT_MIGRATOR};
    use crate::connect_with_settings;

    const REGISTRY_OBJECTS: &[&str] = &["tenants", "idx_tenants_status", "trg_tenants_no_delete"];

    const TENANT_OBJECTS: &[&str] = &[
        "workflow_definition",
        "workflow_instance",
        "workflow_stage_history",
        "idx_workflow_definition_active_name",
        "idx_workflow_definition_tenant",
        "idx_workflow_instance_natural_key",
        "idx_workflow_instance_entity",
        "idx_workflow_instance_definition",
        "trg_workflow_stage_history_no_update",
        "trg_workflow_stage_history_no_delete",
    ];

    #[tokio::test]
    async fn registry_migration_creates_tenant_table() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_registry(&pool).await.expect("run registry migrations");

        let signature = schema_signature(&pool, REGISTRY_OBJECTS).await;
        assert_eq!(signature.len(), REGISTRY_OBJECTS.len());
    }

    #[tokio::test]
    async fn tenant_migrations_up_down_up_preserves_schema_signature() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_tenant(&pool).await.expect("run tenant migrations");

        let initial_signature = schema_signature(&pool, TENANT_OBJECTS).await;
        assert_eq!(
            initial_signature.len(),
            TENANT_OBJECTS.len(),
            "initial migration pass should create all managed schema objects",
        );

        TENANT_MIGRATOR.undo(&pool, 0).await.expect("undo migrations");
        assert!(
            schema_signature(&pool, TENANT_OBJECTS).await.is_empty(),
            "managed schema objects should be removed after full undo",
        );

        run_tenant(&pool).await.expect("re-run migrations");
        assert_eq!(schema_signature(&pool, TENANT_OBJECTS).await, initial_signature);
    }

    #[tokio::test]
    async fn registry_migration_is_reversible() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_registry(&pool).await.expect("run registry migrations");
        REGISTRY_MIGRATOR.undo(&pool, 0).await.expect("undo migrations");

        assert!(schema_signature(&pool, REGISTRY_OBJECTS).await.is_empty());
    }

    async fn schema_signature(
        pool: &sqlx::SqlitePool,
        managed: &[&str],
    ) -> Vec<(String, String, String)> {
        let mut signature: Vec<(String, String, String)> = sqlx::query(
            "SELECT type, name, IFNULL(sql, '') AS sql
             FROM sqlite_master
             WHERE type IN ('table', 'index', 'trigger')",
        )
        .fetch_all(pool)
        .await
        .expect("load schema objects")
        .into_iter()
        .filter_map(|row| {
            let name = row.get::<String, _>("name");
            if managed.contains(&name.as_str()) {
                Some((row.get::<String, _>("type"), name, row.get::<String, _>("sql")))
            } else {
                None
            }
        })
        .collect();
        signature.sort();
        signature
    }
}
