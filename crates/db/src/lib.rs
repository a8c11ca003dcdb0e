pub mod connection;
pub mod migrations;
pub mod registry;
pub mod repositories;
pub mod router;
pub mod service;
pub mod stores;

pub use connection::{connect_with_settings, ping, DbPool};
pub use registry::{InMemoryTenantRegistry, SqlTenantRegistry, TenantRegistry};
pub use repositories::RepositoryError;
pub use router::{ConnectionRouter, Connector, RouterError, SqliteConnector, TenantHandle};
pub use service::{Deactivation, ServiceError, StartedInstance, WorkflowService};
pub use stores::{InMemoryTenantStores, RoutedTenantStores, TenantStore, TenantStores};
