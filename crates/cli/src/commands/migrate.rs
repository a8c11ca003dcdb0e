use tenantflow_core::config::LoadOptions;
use tenantflow_db::migrations;

use crate::commands::{build_runtime, connect_registry, load_config, CommandResult, Failure, EXIT_MIGRATION};

/// Applies pending registry migrations. Tenant databases are migrated per
/// tenant with `tenant migrate`, or by the router when it first connects.
pub fn run(options: LoadOptions) -> CommandResult {
    let config = match load_config("migrate", options) {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime("migrate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_registry(&config).await?;
        let applied = migrations::run_registry(&pool).await.map_err(|error| {
            Failure::new("migration", error.to_string(), EXIT_MIGRATION)
        });
        pool.close().await;
        applied
    });

    match result {
        Ok(()) => CommandResult::success("migrate", "applied pending registry migrations"),
        Err(failure) => failure.render("migrate"),
    }
}
