use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub registry: RegistryConfig,
    pub router: RouterConfig,
    pub logging: LoggingConfig,
}

/// The global store holding tenant records.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    pub url: SecretString,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterConfig {
    pub acquire_timeout_secs: u64,
    pub max_connect_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_backoff_multiplier: u32,
    pub tenant_max_connections: u32,
    pub failure_eviction_threshold: u32,
    pub migrate_on_connect: bool,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub registry_url: Option<String>,
    pub log_level: Option<String>,
    pub acquire_timeout_secs: Option<u64>,
    pub migrate_on_connect: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: 10,
            max_connect_attempts: 3,
            retry_base_delay_ms: 100,
            retry_backoff_multiplier: 2,
            tenant_max_connections: 5,
            failure_eviction_threshold: 3,
            migrate_on_connect: true,
        }
    }
}

impl RouterConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Delay before connect attempt `attempt + 1`, growing geometrically.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.retry_backoff_multiplier).saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig {
                url: secret_value("sqlite://tenantflow-registry.db?mode=rwc".to_string()),
                max_connections: 5,
                timeout_secs: 30,
            },
            router: RouterConfig::default(),
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("tenantflow.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(registry) = patch.registry {
            if let Some(url) = registry.url {
                self.registry.url = secret_value(url);
            }
            if let Some(max_connections) = registry.max_connections {
                self.registry.max_connections = max_connections;
            }
            if let Some(timeout_secs) = registry.timeout_secs {
                self.registry.timeout_secs = timeout_secs;
            }
        }

        if let Some(router) = patch.router {
            if let Some(acquire_timeout_secs) = router.acquire_timeout_secs {
                self.router.acquire_timeout_secs = acquire_timeout_secs;
            }
            if let Some(max_connect_attempts) = router.max_connect_attempts {
                self.router.max_connect_attempts = max_connect_attempts;
            }
            if let Some(retry_base_delay_ms) = router.retry_base_delay_ms {
                self.router.retry_base_delay_ms = retry_base_delay_ms;
            }
            if let Some(retry_backoff_multiplier) = router.retry_backoff_multiplier {
                self.router.retry_backoff_multiplier = retry_backoff_multiplier;
            }
            if let Some(tenant_max_connections) = router.tenant_max_connections {
                self.router.tenant_max_connections = tenant_max_connections;
            }
            if let Some(failure_eviction_threshold) = router.failure_eviction_threshold {
                self.router.failure_eviction_threshold = failure_eviction_threshold;
            }
            if let Some(migrate_on_connect) = router.migrate_on_connect {
                self.router.migrate_on_connect = migrate_on_connect;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("TENANTFLOW_REGISTRY_URL") {
            self.registry.url = secret_value(value);
        }
        if let Some(value) = read_env("TENANTFLOW_REGISTRY_MAX_CONNECTIONS") {
            self.registry.max_connections =
                parse_u32("TENANTFLOW_REGISTRY_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TENANTFLOW_REGISTRY_TIMEOUT_SECS") {
            self.registry.timeout_secs = parse_u64("TENANTFLOW_REGISTRY_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("TENANTFLOW_ROUTER_ACQUIRE_TIMEOUT_SECS") {
            self.router.acquire_timeout_secs =
                parse_u64("TENANTFLOW_ROUTER_ACQUIRE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("TENANTFLOW_ROUTER_MAX_CONNECT_ATTEMPTS") {
            self.router.max_connect_attempts =
                parse_u32("TENANTFLOW_ROUTER_MAX_CONNECT_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("TENANTFLOW_ROUTER_RETRY_BASE_DELAY_MS") {
            self.router.retry_base_delay_ms =
                parse_u64("TENANTFLOW_ROUTER_RETRY_BASE_DELAY_MS", &value)?;
        }
        if let Some(value) = read_env("TENANTFLOW_ROUTER_TENANT_MAX_CONNECTIONS") {
            self.router.tenant_max_connections =
                parse_u32("TENANTFLOW_ROUTER_TENANT_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("TENANTFLOW_ROUTER_MIGRATE_ON_CONNECT") {
            self.router.migrate_on_connect =
                parse_bool("TENANTFLOW_ROUTER_MIGRATE_ON_CONNECT", &value)?;
        }

        let log_level =
            read_env("TENANTFLOW_LOGGING_LEVEL").or_else(|| read_env("TENANTFLOW_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("TENANTFLOW_LOGGING_FORMAT").or_else(|| read_env("TENANTFLOW_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(registry_url) = overrides.registry_url {
            self.registry.url = secret_value(registry_url);
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(acquire_timeout_secs) = overrides.acquire_timeout_secs {
            self.router.acquire_timeout_secs = acquire_timeout_secs;
        }
        if let Some(migrate_on_connect) = overrides.migrate_on_connect {
            self.router.migrate_on_connect = migrate_on_connect;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_registry(&self.registry)?;
        validate_router(&self.router)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

/// Tenant and registry stores are SQLite databases addressed by URL.
pub fn is_sqlite_url(url: &str) -> bool {
    let url = url.trim();
    url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:"
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("tenantflow.toml"), PathBuf::from("config/tenantflow.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_registry(registry: &RegistryConfig) -> Result<(), ConfigError> {
    if !is_sqlite_url(registry.url.expose_secret()) {
        return Err(ConfigError::Validation(
            "registry.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if registry.max_connections == 0 {
        return Err(ConfigError::Validation(
            "registry.max_connections must be greater than zero".to_string(),
        ));
    }

    if registry.timeout_secs == 0 || registry.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "registry.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_router(router: &RouterConfig) -> Result<(), ConfigError> {
    if router.acquire_timeout_secs == 0 || router.acquire_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "router.acquire_timeout_secs must be in range 1..=300".to_string(),
        ));
    }
    if router.max_connect_attempts == 0 || router.max_connect_attempts > 10 {
        return Err(ConfigError::Validation(
            "router.max_connect_attempts must be in range 1..=10".to_string(),
        ));
    }
    if router.retry_backoff_multiplier == 0 {
        return Err(ConfigError::Validation(
            "router.retry_backoff_multiplier must be greater than zero".to_string(),
        ));
    }
    if router.tenant_max_connections == 0 {
        return Err(ConfigError::Validation(
            "router.tenant_max_connections must be greater than zero".to_string(),
        ));
    }
    if router.failure_eviction_threshold == 0 {
        return Err(ConfigError::Validation(
            "router.failure_eviction_threshold must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    registry: Option<RegistryPatch>,
    router: Option<RouterPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct RegistryPatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RouterPatch {
    acquire_timeout_secs: Option<u64>,
    max_connect_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_backoff_multiplier: Option<u32>,
    tenant_max_connections: Option<u32>,
    failure_eviction_threshold: Option<u32>,
    migrate_on_connect: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
