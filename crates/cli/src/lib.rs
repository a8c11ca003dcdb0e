pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tenantflow_core::config::{ConfigOverrides, LoadOptions};
use tenantflow_core::TenantStatus;

#[derive(Debug, Parser)]
#[command(
    name = "tenantflow",
    about = "Tenantflow operator CLI",
    long_about = "Operate the tenant registry, onboard tenants, migrate tenant databases, and check routing readiness.",
    after_help = "Examples:\n  tenantflow migrate\n  tenantflow tenant add demo --name Demo --url sqlite://demo.db?mode=rwc\n  tenantflow doctor --json"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    #[arg(long, global = true, help = "Path to a tenantflow.toml config file")]
    pub config: Option<PathBuf>,
    #[arg(long, global = true, help = "Override the tenant registry URL")]
    pub registry_url: Option<String>,
    #[arg(long, global = true, help = "Override the log level")]
    pub log_level: Option<String>,
}

impl GlobalArgs {
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            config_path: self.config.clone(),
            require_file: self.config.is_some(),
            overrides: ConfigOverrides {
                registry_url: self.registry_url.clone(),
                log_level: self.log_level.clone(),
                ..ConfigOverrides::default()
            },
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending tenant registry migrations")]
    Migrate,
    #[command(subcommand, about = "Onboard tenants and manage their lifecycle")]
    Tenant(TenantCommand),
    #[command(about = "Inspect effective configuration values with source attribution and redaction")]
    Config,
    #[command(about = "Validate config and resolve every active tenant through the router")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

#[derive(Debug, Subcommand)]
enum TenantCommand {
    #[command(about = "Register a new tenant")]
    Add {
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long, help = "SQLite URL of the tenant's own database")]
        url: String,
        #[arg(long, default_value_t = 5)]
        max_connections: u32,
    },
    #[command(about = "List registered tenants")]
    List,
    #[command(about = "Activate, deactivate or suspend a tenant")]
    SetStatus { id: String, status: StatusArg },
    #[command(about = "Apply pending migrations to one tenant's database")]
    Migrate { id: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatusArg {
    Active,
    Inactive,
    Suspended,
}

impl From<StatusArg> for TenantStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Active => TenantStatus::Active,
            StatusArg::Inactive => TenantStatus::Inactive,
            StatusArg::Suspended => TenantStatus::Suspended,
        }
    }
}

pub fn run() -> ExitCode {
    execute(Cli::parse())
}

pub fn execute(cli: Cli) -> ExitCode {
    let options = cli.global.load_options();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(options),
        Command::Tenant(TenantCommand::Add { id, name, url, max_connections }) => {
            commands::tenant::add(
                options,
                commands::tenant::NewTenant { id, name, url, max_connections },
            )
        }
        Command::Tenant(TenantCommand::List) => commands::tenant::list(options),
        Command::Tenant(TenantCommand::SetStatus { id, status }) => {
            commands::tenant::set_status(options, id, status.into())
        }
        Command::Tenant(TenantCommand::Migrate { id }) => commands::tenant::migrate(options, id),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(options) }
        }
        Command::Doctor { json } => commands::doctor::run(options, json),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
