use std::collections::HashMap;

use sqlx::{QueryBuilder, Row, Sqlite};

use tenantflow_core::domain::instance::{
    EntityRef, InstanceStatus, StageHistoryEntry, WorkflowInstance, WorkflowInstanceId,
};
use tenantflow_core::domain::payload::Payload;
use tenantflow_core::domain::tenant::TenantId;
use tenantflow_core::domain::workflow::WorkflowDefinitionId;

use super::{
    decode_json, encode_json, parse_timestamp, RepositoryError, WorkflowInstanceRepository,
    BIND_CHUNK,
};
use crate::DbPool;

const INSTANCE_COLUMNS: &str = "id, tenant_id, definition_id, entity_type, entity_id,
     current_stage, status, assignee, data_json, version, started_at, updated_at, completed_at";

pub struct SqlWorkflowInstanceRepository {
    pool: DbPool,
}

impl SqlWorkflowInstanceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_history(
        &self,
        instance_ids: &[String],
    ) -> Result<HashMap<String, Vec<StageHistoryEntry>>, RepositoryError> {
        let mut grouped: HashMap<String, Vec<StageHistoryEntry>> = HashMap::new();
        for chunk in instance_ids.chunks(BIND_CHUNK) {
            let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(
                "SELECT instance_id, sequence, stage_id, actor, occurred_at, notes, metadata_json
                 FROM workflow_stage_history WHERE instance_id IN (",
            );
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(id);
            }
            separated.push_unseparated(") ORDER BY instance_id ASC, sequence ASC");

            let rows = builder.build().fetch_all(&self.pool).await?;
            for row in &rows {
                let instance_id: String =
                    row.try_get("instance_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
                grouped.entry(instance_id).or_default().push(row_to_history_entry(row)?);
            }
        }
        Ok(grouped)
    }

    async fn attach_history(
        &self,
        rows: Vec<sqlx::sqlite::SqliteRow>,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut instances = rows.iter().map(row_to_instance).collect::<Result<Vec<_>, _>>()?;
        let ids: Vec<String> = instances.iter().map(|instance| instance.id.0.clone()).collect();
        let mut history = self.load_history(&ids).await?;
        for instance in &mut instances {
            instance.history = history.remove(&instance.id.0).unwrap_or_default();
        }
        Ok(instances)
    }
}

fn row_to_instance(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowInstance, RepositoryError> {
    let id: String = row.try_get("id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let tenant_id: String =
        row.try_get("tenant_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let definition_id: String =
        row.try_get("definition_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let entity_type: String =
        row.try_get("entity_type").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let entity_id: String =
        row.try_get("entity_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let current_stage: String =
        row.try_get("current_stage").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let status: String = row.try_get("status").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let assignee: Option<String> =
        row.try_get("assignee").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let data_json: String =
        row.try_get("data_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let version: i64 = row.try_get("version").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let started_at: String =
        row.try_get("started_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let updated_at: String =
        row.try_get("updated_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let completed_at: Option<String> =
        row.try_get("completed_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    let status = InstanceStatus::parse(&status)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown instance status `{status}`")))?;
    let version = u32::try_from(version)
        .map_err(|_| RepositoryError::Decode(format!("version out of range: {version}")))?;
    let data: Payload = decode_json("data_json", &data_json)?;

    Ok(WorkflowInstance {
        id: WorkflowInstanceId(id),
        tenant_id: TenantId(tenant_id),
        definition_id: WorkflowDefinitionId(definition_id),
        entity: EntityRef::new(entity_type, entity_id),
        current_stage,
        status,
        history: Vec::new(),
        assignee,
        data,
        version,
        started_at: parse_timestamp("started_at", &started_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
        completed_at: completed_at
            .as_deref()
            .map(|raw| parse_timestamp("completed_at", raw))
            .transpose()?,
    })
}

fn row_to_history_entry(row: &sqlx::sqlite::SqliteRow) -> Result<StageHistoryEntry, RepositoryError> {
    let stage_id: String =
        row.try_get("stage_id").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let actor: String = row.try_get("actor").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let occurred_at: String =
        row.try_get("occurred_at").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let notes: Option<String> =
        row.try_get("notes").map_err(|e| RepositoryError::Decode(e.to_string()))?;
    let metadata_json: String =
        row.try_get("metadata_json").map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(StageHistoryEntry {
        stage_id,
        actor,
        occurred_at: parse_timestamp("occurred_at", &occurred_at)?,
        notes,
        metadata: decode_json("metadata_json", &metadata_json)?,
    })
}

async fn insert_history(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    instance: &WorkflowInstance,
    from_index: usize,
) -> Result<(), RepositoryError> {
    for (index, entry) in instance.history.iter().enumerate().skip(from_index) {
        let metadata_json = encode_json("metadata", &entry.metadata)?;
        sqlx::query(
            "INSERT INTO workflow_stage_history (instance_id, sequence, stage_id, actor,
                                                 occurred_at, notes, metadata_json)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&instance.id.0)
        .bind((index + 1) as i64)
        .bind(&entry.stage_id)
        .bind(&entry.actor)
        .bind(entry.occurred_at.to_rfc3339())
        .bind(&entry.notes)
        .bind(metadata_json)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl WorkflowInstanceRepository for SqlWorkflowInstanceRepository {
    async fn find_by_id(
        &self,
        tenant_id: &TenantId,
        id: &WorkflowInstanceId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instance WHERE tenant_id = ? AND id = ?"
        ))
        .bind(&tenant_id.0)
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.attach_history(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn find_live(
        &self,
        tenant_id: &TenantId,
        definition_id: &WorkflowDefinitionId,
        entity: &EntityRef,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instance
             WHERE tenant_id = ? AND definition_id = ? AND entity_type = ? AND entity_id = ?
               AND status != 'cancelled'"
        ))
        .bind(&tenant_id.0)
        .bind(&definition_id.0)
        .bind(&entity.entity_type)
        .bind(&entity.entity_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.attach_history(vec![row]).await?.pop()),
            None => Ok(None),
        }
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
        let mut rows = Vec::new();
        for chunk in entities.chunks(BIND_CHUNK) {
            let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
                "SELECT {INSTANCE_COLUMNS} FROM workflow_instance WHERE tenant_id = "
            ));
            builder.push_bind(&tenant_id.0);
            builder.push(" AND (");
            let mut separated = builder.separated(" OR ");
            for entity in chunk {
                separated.push("(entity_type = ");
                separated.push_bind_unseparated(&entity.entity_type);
                separated.push_unseparated(" AND entity_id = ");
                separated.push_bind_unseparated(&entity.entity_id);
                separated.push_unseparated(")");
            }
            separated.push_unseparated(") ORDER BY started_at ASC, id ASC");

            rows.extend(builder.build().fetch_all(&self.pool).await?);
        }

        self.attach_history(rows).await
    }

    async fn count_for_definition(
        &self,
        tenant_id: &TenantId,
        definition_id: &WorkflowDefinitionId,
    ) -> Result<u64, RepositoryError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM workflow_instance WHERE tenant_id = ? AND definition_id = ?",
        )
        .bind(&tenant_id.0)
        .bind(&definition_id.0)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("count").map_err(|e| RepositoryError::Decode(e.to_string()))?;

        Ok(count.max(0) as u64)
    }

    async fn insert(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        let data_json = encode_json("data", &instance.data)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO workflow_instance (id, tenant_id, definition_id, entity_type, entity_id,
                                            current_stage, status, assignee, data_json, version,
                                            started_at, updated_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&instance.id.0)
        .bind(&instance.tenant_id.0)
        .bind(&instance.definition_id.0)
        .bind(&instance.entity.entity_type)
        .bind(&instance.entity.entity_id)
        .bind(&instance.current_stage)
        .bind(instance.status.as_str())
        .bind(&instance.assignee)
        .bind(data_json)
        .bind(i64::from(instance.version))
        .bind(instance.started_at.to_rfc3339())
        .bind(instance.updated_at.to_rfc3339())
        .bind(instance.completed_at.map(|dt| dt.to_rfc3339()))
        .execute(&mut *tx)
        .await
        .map_err(|error| {
            RepositoryError::from_write(
                error,
                format!("live instance of `{}` for {}", instance.definition_id, instance.entity),
            )
        })?;

        insert_history(&mut tx, instance, 0).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_transition(
        &self,
        instance: &WorkflowInstance,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let data_json = encode_json("data", &instance.data)?;
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE workflow_instance
             SET current_stage = ?, status = ?, assignee = ?, data_json = ?, version = ?,
                 updated_at = ?, completed_at = ?
             WHERE tenant_id = ? AND id = ? AND version = ?",
        )
        .bind(&instance.current_stage)
        .bind(instance.status.as_str())
        .bind(&instance.assignee)
        .bind(data_json)
        .bind(i64::from(instance.version))
        .bind(instance.updated_at.to_rfc3339())
        .bind(instance.completed_at.map(|dt| dt.to_rfc3339()))
        .bind(&instance.tenant_id.0)
        .bind(&instance.id.0)
        .bind(i64::from(expected_version))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RepositoryError::VersionConflict {
                instance_id: instance.id.clone(),
                expected: expected_version,
            });
        }

        insert_history(&mut tx, instance, expected_version as usize).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use tenantflow_core::domain::instance::{EntityRef, InstanceStatus, WorkflowInstanceId};
    use tenantflow_core::domain::payload::payload;
    use tenantflow_core::domain::tenant::TenantId;
    use tenantflow_core::domain::workflow::{
        DefinitionStatus, Stage, StageKind, WorkflowDefinition, WorkflowDefinitionId,
        WorkflowRules, WorkflowType,
    };
    use tenantflow_core::flows::{AdvanceRequest, StartRequest, WorkflowEngine};

    use super::SqlWorkflowInstanceRepository;
    use crate::repositories::{
        RepositoryError, SqlWorkflowDefinitionRepository, WorkflowDefinitionRepository,
        WorkflowInstanceRepository,
    };
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup() -> (DbPool, WorkflowDefinition) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_tenant(&pool).await.expect("migrations");

        let now = Utc::now();
        let definition = WorkflowDefinition {
            id: WorkflowDefinitionId("WF-1".to_string()),
            tenant_id: TenantId("demo".to_string()),
            name: "installation".to_string(),
            description: None,
            workflow_type: WorkflowType::Installation,
            stages: vec![
                Stage::new("order_confirmed", "Order confirmed", StageKind::Start)
                    .then(["start_installation"]),
                Stage::new("start_installation", "Installing", StageKind::Task).then(["delivered"]),
                Stage::new("delivered", "Delivered", StageKind::End),
            ],
            rules: WorkflowRules::default(),
            status: DefinitionStatus::Active,
            created_at: now,
            updated_at: now,
        };
        SqlWorkflowDefinitionRepository::new(pool.clone())
            .save(definition.clone())
            .await
            .expect("save definition");
        (pool, definition)
    }

    fn start(definition: &WorkflowDefinition, id: &str, entity_id: &str) -> tenantflow_core::WorkflowInstance {
        WorkflowEngine::new()
            .start(
                definition,
                WorkflowInstanceId(id.to_string()),
                StartRequest::new(EntityRef::new("vehicle", entity_id), "ops"),
                Utc::now(),
            )
            .expect("start")
            .instance
    }

    #[tokio::test]
    async fn insert_and_find_round_trip_preserves_history() {
        let (pool, definition) = setup().await;
        let repo = SqlWorkflowInstanceRepository::new(pool);
        let instance = start(&definition, "WI-1", "V1");

        repo.insert(&instance).await.expect("insert");
        let found = repo
            .find_by_id(&instance.tenant_id, &instance.id)
            .await
            .expect("find")
            .expect("instance should exist");

        assert_eq!(found.history.len(), 1);
        assert_eq!(found.current_stage, "order_confirmed");
        assert_eq!(found.version, 1);
        assert!(found.is_consistent());
    }

    #[tokio::test]
    async fn second_live_instance_for_same_entity_is_a_conflict() {
        let (pool, definition) = setup().await;
        let repo = SqlWorkflowInstanceRepository::new(pool);
        repo.insert(&start(&definition, "WI-1", "V1")).await.expect("insert first");

        let duplicate = repo.insert(&start(&definition, "WI-2", "V1")).await;
        assert!(matches!(duplicate, Err(RepositoryError::Conflict(_))));

        repo.insert(&start(&definition, "WI-3", "V2")).await.expect("other entity is fine");
    }

    #[tokio::test]
    async fn stale_version_is_rejected_without_touching_history() {
        let (pool, definition) = setup().await;
        let repo = SqlWorkflowInstanceRepository::new(pool);
        let instance = start(&definition, "WI-1", "V1");
        repo.insert(&instance).await.expect("insert");

        let engine = WorkflowEngine::new();
        let advanced = engine
            .advance(
                &definition,
                &instance,
                AdvanceRequest::new("start_installation", "tech")
                    .with_data(payload([("crew", "north")])),
                Utc::now(),
            )
            .expect("advance")
            .instance;
        repo.append_transition(&advanced, 1).await.expect("first append");

        let stale = repo.append_transition(&advanced, 1).await;
        assert!(matches!(stale, Err(RepositoryError::VersionConflict { expected: 1, .. })));

        let stored = repo
            .find_by_id(&instance.tenant_id, &instance.id)
            .await
            .expect("find")
            .expect("instance should exist");
        assert_eq!(stored.version, 2);
        assert_eq!(stored.history.len(), 2);
        assert_eq!(stored.current_stage, "start_installation");
        assert!(stored.is_consistent());
    }

    #[tokio::test]
    async fn bulk_listing_groups_history_per_instance() {
        let (pool, definition) = setup().await;
        let repo = SqlWorkflowInstanceRepository::new(pool);
        let engine = WorkflowEngine::new();

        let first = start(&definition, "WI-1", "V1");
        repo.insert(&first).await.expect("insert first");
        let done = engine
            .advance(&definition, &first, AdvanceRequest::new("start_installation", "tech"), Utc::now())
            .expect("advance")
            .instance;
        repo.append_transition(&done, 1).await.expect("append");
        repo.insert(&start(&definition, "WI-2", "V2")).await.expect("insert second");
        repo.insert(&start(&definition, "WI-3", "V3")).await.expect("insert third");

        let tenant = TenantId("demo".to_string());
        let found = repo
            .list_for_entities(
                &tenant,
                &[EntityRef::new("vehicle", "V1"), EntityRef::new("vehicle", "V2")],
            )
            .await
            .expect("bulk list");

        assert_eq!(found.len(), 2);
        let v1 = found.iter().find(|i| i.entity.entity_id == "V1").expect("V1 instance");
        assert_eq!(v1.history.len(), 2);
        assert_eq!(v1.status, InstanceStatus::InProgress);
        assert!(repo.list_for_entities(&tenant, &[]).await.expect("empty").is_empty());
        assert_eq!(
            repo.count_for_definition(&tenant, &definition.id).await.expect("count"),
            3
        );
    }

    #[tokio::test]
    async fn history_rows_cannot_be_rewritten() {
        let (pool, definition) = setup().await;
        let repo = SqlWorkflowInstanceRepository::new(pool.clone());
        repo.insert(&start(&definition, "WI-1", "V1")).await.expect("insert");

        let update = sqlx::query("UPDATE workflow_stage_history SET actor = 'mallory'")
            .execute(&pool)
            .await;
        let delete = sqlx::query("DELETE FROM workflow_stage_history").execute(&pool).await;

        assert!(update.is_err());
        assert!(delete.is_err());
    }
}
