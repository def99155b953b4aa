//! Runtime settings, template resolution and named resources.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::broker::ConnectionConfig;
use crate::error::{RabbitRpcError, Result};
use crate::error_handler::ErrorHandler;
use crate::serializer::{AllowListStrategy, Format, PoolConfig, Serializer, SerializerBuilder, SharedSerializer};

pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RECOVERY_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_RECONCILE_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;

/// Settings file looked up in the working directory, without extension
pub const SETTINGS_FILE: &str = "rabbit-rpc";
/// Environment variable prefix, e.g. `RABBIT_RPC_CONNECTION__URL`
pub const ENV_PREFIX: &str = "RABBIT_RPC";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub connection: ConnectionConfig,
    pub service_name: String,
    pub enable_server: bool,
    pub enable_client: bool,
    pub reply_timeout_ms: u64,
    /// `"min[-max]"` used when a contract declares no concurrency
    pub default_concurrency: String,
    pub allowed_patterns: Vec<String>,
    pub allow_list_strategy: AllowListStrategy,
    pub codec: Format,
    pub serializer_acquire_timeout_ms: u64,
    pub recovery_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    pub idle_timeout_ms: u64,
    /// Values for `${key}` templates
    pub properties: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            service_name: "rabbit-rpc".to_string(),
            enable_server: true,
            enable_client: true,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            default_concurrency: "1".to_string(),
            allowed_patterns: Vec::new(),
            allow_list_strategy: AllowListStrategy::default(),
            codec: Format::default(),
            serializer_acquire_timeout_ms: 5_000,
            recovery_interval_ms: DEFAULT_RECOVERY_INTERVAL_MS,
            reconcile_interval_ms: DEFAULT_RECONCILE_INTERVAL_MS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            properties: HashMap::new(),
        }
    }
}

impl Settings {
    /// Defaults, then `rabbit-rpc.toml` if present, then `RABBIT_RPC_*`
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder().add_source(
            Config::try_from(&Settings::default()).map_err(RabbitRpcError::config_error)?,
        );

        if std::path::Path::new(&format!("{}.toml", SETTINGS_FILE)).exists() {
            builder = builder.add_source(File::with_name(SETTINGS_FILE));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("allowed_patterns"),
        );

        builder
            .build()
            .and_then(|config| config.try_deserialize::<Settings>())
            .map_err(RabbitRpcError::config_error)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// A serializer builder carrying the configured codec, strategy,
    /// patterns and acquire timeout
    pub fn serializer_builder(&self, name: impl Into<String>) -> SerializerBuilder {
        Serializer::builder(name)
            .format(self.codec)
            .strategy(self.allow_list_strategy)
            .allow_all(self.allowed_patterns.iter().cloned())
            .pool(PoolConfig::default().with_acquire_timeout(Duration::from_millis(
                self.serializer_acquire_timeout_ms,
            )))
    }
}

/// Resolves `${key}` / `${key:default}` templates, then `@name` references.
///
/// Keys are looked up in the properties first, then in the environment
/// (as written, then upper-cased with `.` and `-` turned into `_`).
#[derive(Debug, Clone, Default)]
pub struct ValueResolver {
    properties: HashMap<String, String>,
}

impl ValueResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            properties: settings.properties.clone(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    fn lookup(&self, key: &str) -> Option<String> {
        if let Some(value) = self.properties.get(key) {
            return Some(value.clone());
        }
        std::env::var(key).ok().or_else(|| {
            let env_key: String = key
                .chars()
                .map(|c| match c {
                    '.' | '-' => '_',
                    c => c.to_ascii_uppercase(),
                })
                .collect();
            std::env::var(env_key).ok()
        })
    }

    /// Substitute every `${..}` in `template`
    pub fn resolve(&self, template: &str) -> Result<String> {
        let mut resolved = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${") {
            resolved.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                RabbitRpcError::config_error(format!("unterminated placeholder in '{}'", template))
            })?;

            let expression = &after[..end];
            let (key, default) = match expression.split_once(':') {
                Some((key, default)) => (key.trim(), Some(default)),
                None => (expression.trim(), None),
            };
            let value = self
                .lookup(key)
                .or_else(|| default.map(str::to_string))
                .ok_or_else(|| {
                    RabbitRpcError::config_error(format!("no value for '{}' in '{}'", key, template))
                })?;

            resolved.push_str(&value);
            rest = &after[end + 1..];
        }
        resolved.push_str(rest);
        Ok(resolved)
    }

    /// Resolve an optional resource reference to a registry name.
    /// `@name` and a bare `name` both refer to `name`; blank means none.
    pub fn resource_ref(&self, reference: Option<&str>) -> Result<Option<String>> {
        let Some(reference) = reference else {
            return Ok(None);
        };
        let resolved = self.resolve(reference)?;
        let name = resolved.trim();
        let name = name.strip_prefix('@').unwrap_or(name).trim();
        Ok((!name.is_empty()).then(|| name.to_string()))
    }
}

/// Named executors, serializers and error handlers contracts may reference
#[derive(Default, Clone)]
pub struct ResourceRegistry {
    executors: HashMap<String, Handle>,
    serializers: HashMap<String, SharedSerializer>,
    error_handlers: HashMap<String, Arc<dyn ErrorHandler>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executor(mut self, name: impl Into<String>, handle: Handle) -> Self {
        self.executors.insert(name.into(), handle);
        self
    }

    pub fn serializer(mut self, name: impl Into<String>, serializer: Serializer) -> Self {
        self.serializers.insert(name.into(), Arc::new(serializer));
        self
    }

    pub fn error_handler(mut self, name: impl Into<String>, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handlers.insert(name.into(), handler);
        self
    }

    pub fn get_executor(&self, name: &str) -> Result<Handle> {
        self.executors
            .get(name)
            .cloned()
            .ok_or_else(|| missing("executor", name))
    }

    pub fn get_serializer(&self, name: &str) -> Result<SharedSerializer> {
        self.serializers
            .get(name)
            .cloned()
            .ok_or_else(|| missing("serializer", name))
    }

    pub fn get_error_handler(&self, name: &str) -> Result<Arc<dyn ErrorHandler>> {
        self.error_handlers
            .get(name)
            .cloned()
            .ok_or_else(|| missing("error handler", name))
    }
}

fn missing(kind: &str, name: &str) -> RabbitRpcError {
    RabbitRpcError::config_error(format!("no {} named '{}' is registered", kind, name))
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("executors", &self.executors.keys().collect::<Vec<_>>())
            .field("serializers", &self.serializers.keys().collect::<Vec<_>>())
            .field("error_handlers", &self.error_handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_use_properties_then_defaults() {
        let mut resolver = ValueResolver::new();
        resolver.set("svc.exchange", "orders");

        assert_eq!(resolver.resolve("${svc.exchange}-x").unwrap(), "orders-x");
        assert_eq!(resolver.resolve("${svc.missing:fallback}").unwrap(), "fallback");
        assert_eq!(resolver.resolve("plain").unwrap(), "plain");
        assert!(resolver.resolve("${svc.missing}").is_err());
        assert!(resolver.resolve("${svc.exchange").is_err());
    }

    #[test]
    fn templates_fall_back_to_the_environment() {
        std::env::set_var("RABBIT_RPC_TEST_QUEUE", "from-env");
        let resolver = ValueResolver::new();
        assert_eq!(resolver.resolve("${rabbit-rpc.test.queue}").unwrap(), "from-env");
    }

    #[test]
    fn resource_references_resolve_once() {
        let mut resolver = ValueResolver::new();
        resolver.set("pool", "@workers");

        assert_eq!(resolver.resource_ref(Some("${pool}")).unwrap().as_deref(), Some("workers"));
        assert_eq!(resolver.resource_ref(Some("@compact")).unwrap().as_deref(), Some("compact"));
        assert_eq!(resolver.resource_ref(Some("  ")).unwrap(), None);
        assert_eq!(resolver.resource_ref(None).unwrap(), None);
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.reply_timeout(), Duration::from_secs(5));
        assert_eq!(settings.recovery_interval(), Duration::from_secs(10));
        assert_eq!(settings.default_concurrency, "1");
        assert!(settings.enable_server && settings.enable_client);
    }

    #[test]
    fn unknown_resources_are_config_errors() {
        let registry = ResourceRegistry::new();
        assert!(matches!(registry.get_serializer("nope"), Err(RabbitRpcError::Config(_))));
        assert!(registry.get_error_handler("nope").is_err());
    }
}
