use sqlx::{QueryBuilder, Row, Sqlite};

use tenantflow_core::domain::tenant::TenantId;
use tenantflow_core::domain::workflow::{
    DefinitionStatus, Stage, WorkflowDefinition, WorkflowDefinitionId, WorkflowRules, WorkflowType,
};

use super::{
    decode_json, encode_json, parse_timestamp, RepositoryError, WorkflowDefinitionRepository,
    BIND_CHUNK,
};
use crate::DbPool;

const DEFINITION_COLUMNS: &str = "id, tenant_id, name, description, workflow_type, stages_json,
     rules_json, status, created_at, updated_at";

pub struct SqlWorkflowDefinitionRepository {
    pool: DbPool,
}

impl SqlWorkflowDefinitionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_definition(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowDefinition, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tenant_id: String =
        row.try_get("tenant_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let name: String = row.try_get("name").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let description: Option<String> =
        row.try_get("description").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let workflow_type: String =
        row.try_get("workflow_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let stages_json: String =
        row.try_get("stages_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let rules_json: String =
        row.try_get("rules_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let status: String = row.try_get("status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let created_at: String =
        row.try_get("created_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let stages: Vec<Stage> = decode_json("stages_json", &stages_json)?;
    let rules: WorkflowRules = decode_json("rules_json", &rules_json)?;
    let status = DefinitionStatus::parse(&status)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown definition status `{status}`")))?;

    Ok(WorkflowDefinition {
        id: WorkflowDefinitionId(id),
        tenant_id: TenantId(tenant_id),
        name,
        description,
        workflow_type: WorkflowType::from(workflow_type),
        stages,
        rules,
        status,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

#[async_trait::async_trait]
impl WorkflowDefinitionRepository for SqlWorkflowDefinitionRepository {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &WorkflowDefinitionId,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM workflow_definition WHERE tenant_id = ? AND id = ?"
        ))
        .bind(&tenant_id.0)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_definition).transpose()
    }

    async fn find_active_by_name(
        &self,
        tenant_id: &TenantId,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM workflow_definition
             WHERE tenant_id = ? AND name = ? AND status = 'active'"
        ))
        .bind(&tenant_id.0)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_definition).transpose()
    }

    async fn list(
        &self,
        tenant_id: &TenantId,
        include_inactive: bool,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = if include_inactive {
            sqlx::query(&format!(
                "SELECT {DEFINITION_COLUMNS} FROM workflow_definition
                 WHERE tenant_id = ? ORDER BY name ASC, created_at ASC"
            ))
            .bind(&tenant_id.0)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {DEFINITION_COLUMNS} FROM workflow_definition
                 WHERE tenant_id = ? AND status = 'active' ORDER BY name ASC"
            ))
            .bind(&tenant_id.0)
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter().map(row_to_definition).collect()
    }

    async fn list_by_ids(
        &self,
        tenant_id: &TenantId,
        ids: &[WorkflowDefinitionId],
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut definitions = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(BIND_CHUNK) {
            let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
                "SELECT {DEFINITION_COLUMNS} FROM workflow_definition WHERE tenant_id = "
            ));
            builder.push_bind(&tenant_id.0);
            builder.push(" AND id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(&id.0);
            }
            separated.push_unseparated(")");

            for row in builder.build().fetch_all(&self.pool).await?.iter() {
                definitions.push(row_to_definition(row)?);
            }
        }
        Ok(definitions)
    }

    async fn save(&self, definition: WorkflowDefinition) -> Result<(), RepositoryError> {
        let stages_json = encode_json("stages", &definition.stages)?;
        let rules_json = encode_json("rules", &definition.rules)?;

        sqlx::query(
            "INSERT INTO workflow_definition (id, tenant_id, name, description, workflow_type,
                                              stages_json, rules_json, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 description = excluded.description,
                 workflow_type = excluded.workflow_type,
                 stages_json = excluded.stages_json,
                 rules_json = excluded.rules_json,
                 status = excluded.status,
                 updated_at = excluded.updated_at
             WHERE workflow_definition.tenant_id = excluded.tenant_id",
        )
        .bind(&definition.id.0)
        .bind(&definition.tenant_id.0)
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(definition.workflow_type.as_str())
        .bind(stages_json)
        .bind(rules_json)
        .bind(definition.status.as_str())
        .bind(definition.created_at.to_rfc3339())
        .bind(definition.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|error| {
            RepositoryError::from_write(error, format!("active definition `{}`", definition.name))
        })?;

        Ok(())
    }

    async fn delete(
        &self,
        tenant_id: &TenantId,
        id: &WorkflowDefinitionId,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_definition WHERE tenant_id = ? AND id = ?")
            .bind(&tenant_id.0)
            .bind(&id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use tenantflow_core::domain::tenant::TenantId;
    use tenantflow_core::domain::workflow::{
        DefinitionStatus, Stage, StageAction, StageKind, WorkflowDefinition, WorkflowDefinitionId,
        WorkflowRules, WorkflowType,
    };

    use super::SqlWorkflowDefinitionRepository;
    use crate::repositories::{RepositoryError, WorkflowDefinitionRepository, BIND_CHUNK};
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_tenant(&pool).await.expect("migrations");
        pool
    }

    fn definition(id: &str, tenant: &str, name: &str) -> WorkflowDefinition {
        let now = Utc::now();
        WorkflowDefinition {
            id: WorkflowDefinitionId(id.to_string()),
            tenant_id: TenantId(tenant.to_string()),
            name: name.to_string(),
            description: Some("vehicle fitting".to_string()),
            workflow_type: WorkflowType::Installation,
            stages: vec![
                Stage::new("order_confirmed", "Order confirmed", StageKind::Start)
                    .then(["delivered"])
                    .with_action(StageAction::Notify {
                        recipients: vec!["ops".to_string()],
                        template: "order-confirmed".to_string(),
                    }),
                Stage::new("delivered", "Delivered", StageKind::End),
            ],
            rules: WorkflowRules { allow_skip_stages: true, allow_backward: false },
            status: DefinitionStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn save_and_find_round_trip_keeps_stages_and_rules() {
        let repo = SqlWorkflowDefinitionRepository::new(setup().await);
        let def = definition("WF-1", "demo", "installation");

        repo.save(def.clone()).await.expect("save");
        let found = repo
            .find_by_id(&def.tenant_id, &def.id)
            .await
            .expect("find")
            .expect("definition should exist");

        assert_eq!(found.stages, def.stages);
        assert_eq!(found.rules, def.rules);
        assert_eq!(found.workflow_type, WorkflowType::Installation);
    }

    #[tokio::test]
    async fn definitions_are_invisible_to_other_tenants() {
        let repo = SqlWorkflowDefinitionRepository::new(setup().await);
        let def = definition("WF-1", "demo", "installation");
        repo.save(def.clone()).await.expect("save");

        let other = TenantId("acme".to_string());
        assert!(repo.find_by_id(&other, &def.id).await.expect("find").is_none());
        assert!(repo.list(&other, true).await.expect("list").is_empty());
        assert!(!repo.delete(&other, &def.id).await.expect("delete"));
    }

    #[tokio::test]
    async fn active_name_clash_is_a_conflict_but_inactive_names_are_reusable() {
        let repo = SqlWorkflowDefinitionRepository::new(setup().await);
        let mut first = definition("WF-1", "demo", "installation");
        repo.save(first.clone()).await.expect("save first");

        let clash = repo.save(definition("WF-2", "demo", "installation")).await;
        assert!(matches!(clash, Err(RepositoryError::Conflict(_))));

        first.status = DefinitionStatus::Inactive;
        repo.save(first).await.expect("deactivate first");
        repo.save(definition("WF-2", "demo", "installation")).await.expect("reuse name");

        let active = repo.list(&TenantId("demo".to_string()), false).await.expect("list active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id.0, "WF-2");
        let all = repo.list(&TenantId("demo".to_string()), true).await.expect("list all");
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn list_by_ids_fetches_only_requested_definitions() {
        let repo = SqlWorkflowDefinitionRepository::new(setup().await);
        for (id, name) in [("WF-1", "installation"), ("WF-2", "payment"), ("WF-3", "service")] {
            repo.save(definition(id, "demo", name)).await.expect("save");
        }

        let tenant = TenantId("demo".to_string());
        let ids = [WorkflowDefinitionId("WF-1".to_string()), WorkflowDefinitionId("WF-3".to_string())];
        let mut found: Vec<String> = repo
            .list_by_ids(&tenant, &ids)
            .await
            .expect("list by ids")
            .into_iter()
            .map(|def| def.id.0)
            .collect();
        found.sort();

        assert_eq!(found, vec!["WF-1".to_string(), "WF-3".to_string()]);
        assert!(repo.list_by_ids(&tenant, &[]).await.expect("empty").is_empty());
    }

    #[tokio::test]
    async fn list_by_ids_spans_more_ids_than_one_statement_binds() {
        let repo = SqlWorkflowDefinitionRepository::new(setup().await);
        let stored = BIND_CHUNK + 25;
        for n in 0..stored {
            repo.save(definition(&format!("WF-{n:04}"), "demo", &format!("flow-{n:04}")))
                .await
                .expect("save");
        }

        let mut ids: Vec<WorkflowDefinitionId> =
            (0..stored).map(|n| WorkflowDefinitionId(format!("WF-{n:04}"))).collect();
        ids.push(WorkflowDefinitionId("WF-missing".to_string()));

        let found = repo
            .list_by_ids(&TenantId("demo".to_string()), &ids)
            .await
            .expect("list by ids across chunks");
        assert_eq!(found.len(), stored);
        assert!(found.iter().any(|def| def.id.0 == "WF-0000"));
        assert!(found.iter().any(|def| def.id.0 == format!("WF-{:04}", stored - 1)));
    }
}
