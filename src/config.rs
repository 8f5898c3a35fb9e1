//! 守护进程配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__POOLS__GLOBAL=64`）。

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::continuation::ContinuationConfig;
use crate::core::ledger::LedgerConfig;
use crate::core::supervisor::DeadlineLayers;
use crate::gateway::{HubConfig, RuntimeConfig};
use crate::provider::{BreakerConfig, CapabilityRegistry, ProviderSpec};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub auth: AuthSection,
    pub pools: PoolsSection,
    pub timeouts: TimeoutsSection,
    pub coalescing: CoalescingSection,
    pub breaker: BreakerSection,
    pub routing: RoutingSection,
    pub continuation: ContinuationSection,
    pub audit: AuditSection,
    pub providers: Vec<ProviderSpec>,
}

/// [server] 段：监听地址、连接上限与各类时限（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_addr: String,
    pub max_connections: usize,
    pub heartbeat_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// 拆除会话时等待请求任务退出的时限
    pub teardown_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9470".to_string(),
            max_connections: 256,
            heartbeat_interval_secs: 15,
            idle_timeout_secs: 300,
            handshake_timeout_secs: 10,
            teardown_timeout_secs: 5,
            sweep_interval_secs: 30,
        }
    }
}

/// [auth] 段：握手令牌
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    pub tokens: Vec<String>,
}

/// [pools] 段：三级并发上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolsSection {
    pub global: usize,
    pub per_session: usize,
    pub per_provider: usize,
    /// 0 = 不排队，拿不到槽位立即返回 capacity_exceeded
    pub admission_timeout_ms: u64,
}

impl Default for PoolsSection {
    fn default() -> Self {
        Self {
            global: 32,
            per_session: 8,
            per_provider: 16,
            admission_timeout_ms: 0,
        }
    }
}

/// [timeouts] 段：未给出的层按工具执行期限推导
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsSection {
    pub tool_execution_secs: u64,
    pub provider_call_secs: Option<u64>,
    pub watchdog_secs: Option<u64>,
    pub client_secs: Option<u64>,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            tool_execution_secs: 60,
            provider_call_secs: None,
            watchdog_secs: None,
            client_secs: None,
        }
    }
}

impl TimeoutsSection {
    pub fn layers(&self) -> DeadlineLayers {
        let mut layers = DeadlineLayers::from_tool_timeout(Duration::from_secs(self.tool_execution_secs));
        if let Some(secs) = self.provider_call_secs {
            layers.provider_call = Duration::from_secs(secs);
        }
        if let Some(secs) = self.watchdog_secs {
            layers.watchdog = Duration::from_secs(secs);
        }
        if let Some(secs) = self.client_secs {
            layers.client = Duration::from_secs(secs);
        }
        layers
    }
}

/// [coalescing] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoalescingSection {
    pub enabled: bool,
    pub result_ttl_secs: u64,
    /// 不参与合并的工具名
    pub opt_out: Vec<String>,
}

impl Default for CoalescingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            result_ttl_secs: 30,
            opt_out: Vec::new(),
        }
    }
}

/// [breaker] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

/// [routing] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    /// 空表示按 [[providers]] 声明顺序
    pub fallback_order: Vec<String>,
    pub max_fallback_depth: usize,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            fallback_order: Vec::new(),
            max_fallback_depth: 2,
        }
    }
}

/// [continuation] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContinuationSection {
    pub idle_ttl_secs: u64,
    pub tombstone_secs: u64,
    /// 设置后（且启用 async-sqlite）使用 SQLite 后端
    pub sqlite_path: Option<PathBuf>,
}

impl Default for ContinuationSection {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 3 * 3600,
            tombstone_secs: 3600,
            sqlite_path: None,
        }
    }
}

/// [audit] 段：sink = "tracing" | "file"
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    pub sink: String,
    /// sink = "file" 时的 JSON Lines 文件
    pub path: Option<PathBuf>,
    /// 写文件队列容量；满了丢弃
    pub queue_capacity: usize,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            sink: "tracing".to_string(),
            path: None,
            queue_capacity: 1024,
        }
    }
}

impl AppConfig {
    /// 启动前校验；错误消息指出具体字段
    pub fn validate(&self) -> Result<(), ConfigError> {
        let capacities = [
            ("pools.global", self.pools.global),
            ("pools.per_session", self.pools.per_session),
            ("pools.per_provider", self.pools.per_provider),
            ("server.max_connections", self.server.max_connections),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.server.heartbeat_interval_secs == 0 || self.server.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.heartbeat_interval_secs and server.sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid("breaker.failure_threshold must be positive".to_string()));
        }

        self.timeouts
            .layers()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("timeouts: {}", e)))?;

        if self.providers.is_empty() {
            return Err(ConfigError::Invalid("at least one [[providers]] entry is required".to_string()));
        }
        let mut ids = HashSet::new();
        for provider in &self.providers {
            if !ids.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate provider id '{}'", provider.id)));
            }
            if provider.pool_capacity == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "providers.{}.pool_capacity must be positive",
                    provider.id
                )));
            }
        }
        for id in &self.routing.fallback_order {
            if !ids.contains(id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "routing.fallback_order names unknown provider '{}'",
                    id
                )));
            }
        }

        match self.audit.sink.as_str() {
            "tracing" => {}
            "file" if self.audit.path.is_some() => {}
            "file" => return Err(ConfigError::Invalid("audit.sink = \"file\" requires audit.path".to_string())),
            other => return Err(ConfigError::Invalid(format!("unknown audit.sink '{}'", other))),
        }
        Ok(())
    }

    pub fn capability_registry(&self) -> CapabilityRegistry {
        CapabilityRegistry::new(self.providers.clone())
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            layers: self.timeouts.layers(),
            ledger: LedgerConfig {
                global_capacity: self.pools.global,
                session_capacity: self.pools.per_session,
                provider_capacity: self.pools.per_provider,
                admission_timeout: Duration::from_millis(self.pools.admission_timeout_ms),
                ..LedgerConfig::default()
            },
            breaker: BreakerConfig {
                failure_threshold: self.breaker.failure_threshold,
                cooldown: Duration::from_secs(self.breaker.cooldown_secs),
            },
            continuation: ContinuationConfig {
                idle_ttl: Duration::from_secs(self.continuation.idle_ttl_secs),
                tombstone: Duration::from_secs(self.continuation.tombstone_secs),
            },
            coalescing_enabled: self.coalescing.enabled,
            result_ttl: Duration::from_secs(self.coalescing.result_ttl_secs),
            coalesce_opt_out: self.coalescing.opt_out.iter().cloned().collect(),
            fallback_order: self.routing.fallback_order.clone(),
            max_fallback_depth: self.routing.max_fallback_depth,
            teardown_timeout: Duration::from_secs(self.server.teardown_timeout_secs),
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            bind_addr: self.server.bind_addr.clone(),
            max_connections: self.server.max_connections,
            heartbeat_interval: Duration::from_secs(self.server.heartbeat_interval_secs),
            idle_timeout: Duration::from_secs(self.server.idle_timeout_secs),
            handshake_timeout: Duration::from_secs(self.server.handshake_timeout_secs),
            sweep_interval: Duration::from_secs(self.server.sweep_interval_secs),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 则追加该文件（必须存在，可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键；HIVE__AUTH__TOKENS 以逗号分隔）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let default_names = ["config/default", "../config/default", "default"];
    let default_source = default_names
        .into_iter()
        .find(|name| std::path::Path::new(&format!("{}.toml", name)).exists());
    build_config(default_source, config_path)
}

/// 只读取指定文件（不查找默认配置），环境变量仍然生效
pub fn load_config_file(config_path: PathBuf) -> Result<AppConfig, ConfigError> {
    build_config(None, Some(config_path))
}

fn build_config(
    default_source: Option<&str>,
    config_path: Option<PathBuf>,
) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(name) = default_source {
        builder = builder.add_source(config::File::with_name(name).required(false));
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("auth.tokens"),
    );

    let c = builder.build()?;
    Ok(c.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ModelSpec;
    use std::io::Write;

    fn valid() -> AppConfig {
        AppConfig {
            providers: vec![
                ProviderSpec::new("alpha").with_model(ModelSpec::new("alpha-pro")),
                ProviderSpec::new("beta").with_model(ModelSpec::new("beta-lite")),
            ],
            ..AppConfig::default()
        }
    }

    #[test]
    fn test_defaults_validate_with_providers() {
        let config = valid();
        config.validate().unwrap();
        let runtime = config.runtime_config();
        assert_eq!(runtime.ledger.global_capacity, 32);
        assert_eq!(runtime.layers.client, Duration::from_secs(120));
        assert!(runtime.coalescing_enabled);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let mut config = valid();
        config.pools.per_session = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("pools.per_session"), "{}", err);
    }

    #[test]
    fn test_rejects_non_increasing_layers() {
        let mut config = valid();
        config.timeouts.watchdog_secs = Some(30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_fallback_provider() {
        let mut config = valid();
        config.routing.fallback_order = vec!["beta".into(), "gamma".into()];
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("gamma"), "{}", err);
    }

    #[test]
    fn test_rejects_missing_providers() {
        assert!(AppConfig::default().validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[pools]
global = 4

[timeouts]
tool_execution_secs = 10
provider_call_secs = 5

[routing]
fallback_order = ["beta"]

[[providers]]
id = "alpha"
models = [{{ name = "alpha-pro", capabilities = ["search"] }}]

[[providers]]
id = "beta"
pool_capacity = 2
models = [{{ name = "beta-lite" }}]
"#
        )
        .unwrap();

        let config = load_config_file(file.path().to_path_buf()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.pools.global, 4);
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[1].pool_capacity, Some(2));
        let layers = config.timeouts.layers();
        assert_eq!(layers.provider_call, Duration::from_secs(5));
        assert_eq!(layers.watchdog, Duration::from_secs(15));

        let registry = config.capability_registry();
        let (provider, model) = registry.resolve_model("alpha-pro").unwrap();
        assert_eq!(provider.id, "alpha");
        assert!(model.supports("search"));
    }
}
