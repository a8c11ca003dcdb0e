#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use tenantflow_core::config::RouterConfig;
use tenantflow_core::{
    ConnectionDescriptor, EntityRef, InMemoryEntityDirectory, NewWorkflowDefinition,
    RecordingActionExecutor, Stage, StageAction, StageKind, Tenant, TenantId, WorkflowRules,
    WorkflowType,
};
use tenantflow_db::{
    connect_with_settings, migrations, ConnectionRouter, Connector, DbPool, RoutedTenantStores,
    SqlTenantRegistry, SqliteConnector, TenantRegistry, WorkflowService,
};

pub struct Harness {
    pub dir: TempDir,
    pub registry: Arc<SqlTenantRegistry>,
    pub router: Arc<ConnectionRouter>,
    pub connector: Arc<CountingConnector>,
    pub entities: InMemoryEntityDirectory,
    pub actions: RecordingActionExecutor,
    pub service: WorkflowService,
}

/// Wraps the real connector and counts how many pools it opened.
pub struct CountingConnector {
    inner: SqliteConnector,
    opened: AtomicUsize,
}

impl CountingConnector {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect(&self, tenant: &Tenant) -> Result<DbPool, sqlx::Error> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(tenant).await
    }
}

pub fn sqlite_url(path: &Path) -> String {
    format!("sqlite://{}?mode=rwc", path.display())
}

pub async fn harness() -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let registry_pool = connect_with_settings(&sqlite_url(&dir.path().join("registry.db")), 2, 5)
        .await
        .expect("connect registry");
    migrations::run_registry(&registry_pool).await.expect("registry migrations");
    let registry = Arc::new(SqlTenantRegistry::new(registry_pool));

    for tenant in ["demo", "acme"] {
        let url = sqlite_url(&dir.path().join(format!("{tenant}.db")));
        registry
            .register(Tenant::new(tenant, tenant.to_uppercase(), ConnectionDescriptor::new(url, 4)))
            .await
            .expect("register tenant");
    }

    let settings = RouterConfig { retry_base_delay_ms: 5, ..RouterConfig::default() };
    let connector = Arc::new(CountingConnector {
        inner: SqliteConnector::new(&settings),
        opened: AtomicUsize::new(0),
    });
    let router = Arc::new(ConnectionRouter::new(registry.clone(), connector.clone(), settings));

    let entities = InMemoryEntityDirectory::default();
    for id in ["V1", "V2", "V3"] {
        entities.insert(TenantId::from("demo"), EntityRef::new("vehicle", id));
    }
    entities.insert(TenantId::from("acme"), EntityRef::new("vehicle", "A1"));
    let actions = RecordingActionExecutor::default();

    let service = WorkflowService::new(
        Arc::new(RoutedTenantStores::new(router.clone())),
        Arc::new(entities.clone()),
        Arc::new(actions.clone()),
    );

    Harness { dir, registry, router, connector, entities, actions, service }
}

pub fn demo() -> TenantId {
    TenantId::from("demo")
}

pub fn vehicle(id: &str) -> EntityRef {
    EntityRef::new("vehicle", id)
}

pub fn installation_definition(name: &str, rules: WorkflowRules) -> NewWorkflowDefinition {
    NewWorkflowDefinition {
        name: name.to_string(),
        description: Some("Vehicle tracker installation".to_string()),
        workflow_type: WorkflowType::Installation,
        stages: vec![
            Stage::new("order_confirmed", "Order confirmed", StageKind::Start)
                .then(["start_installation"])
                .with_action(StageAction::Notify {
                    recipients: vec!["operations".to_string()],
                    template: "order_confirmed".to_string(),
                }),
            Stage::new("start_installation", "Installation started", StageKind::Task)
                .then(["quality_checked"])
                .assigned_to_role("technician"),
            Stage::new("quality_checked", "Quality checked", StageKind::Decision)
                .then(["delivered"]),
            Stage::new("delivered", "Delivered", StageKind::End).with_action(StageAction::Email {
                to: vec!["customer@example.com".to_string()],
                subject: "Your vehicle is ready".to_string(),
            }),
        ],
        rules,
    }
}

pub fn payment_definition(name: &str) -> NewWorkflowDefinition {
    NewWorkflowDefinition {
        name: name.to_string(),
        description: None,
        workflow_type: WorkflowType::Payment,
        stages: vec![
            Stage::new("invoiced", "Invoiced", StageKind::Start).then(["paid"]),
            Stage::new("paid", "Paid", StageKind::End),
        ],
        rules: WorkflowRules::default(),
    }
}

/// A start stage fanning out to `spokes` task stages that all link to each
/// other, so any spoke can follow any other.
pub fn hub_definition(name: &str, spokes: usize) -> NewWorkflowDefinition {
    let spoke_ids: Vec<String> = (1..=spokes).map(|n| format!("spoke_{n}")).collect();
    let mut stages = vec![Stage::new("hub", "Hub", StageKind::Start).then(spoke_ids.clone())];
    for id in &spoke_ids {
        let others = spoke_ids.iter().filter(|other| *other != id).cloned();
        stages.push(Stage::new(id.clone(), id.clone(), StageKind::Task).then(others).then(["done"]));
    }
    stages.push(Stage::new("done", "Done", StageKind::End));

    NewWorkflowDefinition {
        name: name.to_string(),
        description: None,
        workflow_type: WorkflowType::Custom("dispatch".to_string()),
        stages,
        rules: WorkflowRules::default(),
    }
}
