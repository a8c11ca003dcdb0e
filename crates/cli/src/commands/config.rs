use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::ExposeSecret;
use tenantflow_core::config::{AppConfig, LoadOptions};
use toml::Value;

/// Renders every effective setting with where it came from. The registry
/// URL is reduced to its scheme.
pub fn run(options: LoadOptions) -> String {
    let config_file_path = detect_config_path(options.config_path.as_deref());
    let overrides = options.overrides.clone();
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_doc = load_config_file_doc(config_file_path.as_deref());
    let router = &config.router;

    let fields: Vec<(&str, String, Option<&str>, bool)> = vec![
        (
            "registry.url",
            redact_url(config.registry.url.expose_secret()),
            Some("TENANTFLOW_REGISTRY_URL"),
            overrides.registry_url.is_some(),
        ),
        (
            "registry.max_connections",
            config.registry.max_connections.to_string(),
            Some("TENANTFLOW_REGISTRY_MAX_CONNECTIONS"),
            false,
        ),
        (
            "registry.timeout_secs",
            config.registry.timeout_secs.to_string(),
            Some("TENANTFLOW_REGISTRY_TIMEOUT_SECS"),
            false,
        ),
        (
            "router.acquire_timeout_secs",
            router.acquire_timeout_secs.to_string(),
            Some("TENANTFLOW_ROUTER_ACQUIRE_TIMEOUT_SECS"),
            overrides.acquire_timeout_secs.is_some(),
        ),
        (
            "router.max_connect_attempts",
            router.max_connect_attempts.to_string(),
            Some("TENANTFLOW_ROUTER_MAX_CONNECT_ATTEMPTS"),
            false,
        ),
        (
            "router.retry_base_delay_ms",
            router.retry_base_delay_ms.to_string(),
            Some("TENANTFLOW_ROUTER_RETRY_BASE_DELAY_MS"),
            false,
        ),
        ("router.retry_backoff_multiplier", router.retry_backoff_multiplier.to_string(), None, false),
        (
            "router.tenant_max_connections",
            router.tenant_max_connections.to_string(),
            Some("TENANTFLOW_ROUTER_TENANT_MAX_CONNECTIONS"),
            false,
        ),
        (
            "router.failure_eviction_threshold",
            router.failure_eviction_threshold.to_string(),
            None,
            false,
        ),
        (
            "router.migrate_on_connect",
            router.migrate_on_connect.to_string(),
            Some("TENANTFLOW_ROUTER_MIGRATE_ON_CONNECT"),
            overrides.migrate_on_connect.is_some(),
        ),
        (
            "logging.level",
            config.logging.level.clone(),
            Some("TENANTFLOW_LOGGING_LEVEL"),
            overrides.log_level.is_some(),
        ),
        (
            "logging.format",
            format!("{:?}", config.logging.format).to_ascii_lowercase(),
            Some("TENANTFLOW_LOGGING_FORMAT"),
            false,
        ),
    ];

    let mut lines = vec![
        "effective config (source precedence: flag > env > file > default):".to_string(),
    ];
    for (key, value, env_key, overridden) in fields {
        let source = if overridden {
            "flag".to_string()
        } else {
            field_source(key, env_key, config_file_doc.as_ref(), config_file_path.as_deref())
        };
        lines.push(render_line(key, &value, source));
    }

    lines.join("\n")
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }

    ["tenantflow.toml", "config/tenantflow.toml"].into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_key: Option<&str>,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_key {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_url(url: &str) -> String {
    match url.trim().split_once(':') {
        Some((scheme, _)) if !scheme.is_empty() => format!("{scheme}:<redacted>"),
        _ => "<redacted>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::redact_url;

    #[test]
    fn registry_url_keeps_only_its_scheme() {
        assert_eq!(redact_url("sqlite:///var/lib/tenantflow/registry.db"), "sqlite:<redacted>");
        assert_eq!(redact_url(":memory:"), "<redacted>");
    }
}
