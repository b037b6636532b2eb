//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::observability::ObservabilityConfig;
use crate::retry::RetryPolicy;

/// 事实源创建的重试配置
///
/// 以毫秒表示，便于在 TOML 和环境变量中书写；通过 `policy()` 转换为 `RetryPolicy`。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceRetryConfig {
    /// 最大重试次数（不含首次创建），0 表示失败后等待下一次访问再重建
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for SourceRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl SourceRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

/// 规则引擎配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RulesEngineConfig {
    /// 引擎实例名，用于日志和指标标签
    pub instance_name: String,
    /// 演练模式：照常跟踪状态迁移，但不调用动作处理器
    pub dry_run: bool,
    /// 事实流创建后在该时长内未产出值时，发布 JSON null 作为默认值
    pub fact_default_delay_ms: Option<u64>,
    /// 条件树最大嵌套深度，超过时启用规则集直接失败
    pub max_condition_depth: usize,
    /// 引擎事件广播通道容量
    pub event_buffer: usize,
    /// 在 `RuleEvaluated` 事件中附带逐节点评估追踪
    pub trace_evaluations: bool,
    pub source_retry: SourceRetryConfig,
}

impl Default for RulesEngineConfig {
    fn default() -> Self {
        Self {
            instance_name: "RulesEngine".to_string(),
            dry_run: false,
            fact_default_delay_ms: None,
            max_condition_depth: 32,
            event_buffer: 256,
            trace_evaluations: false,
            source_retry: SourceRetryConfig::default(),
        }
    }
}

impl RulesEngineConfig {
    /// 事实默认值延迟
    pub fn fact_default_delay(&self) -> Option<Duration> {
        self.fact_default_delay_ms.map(Duration::from_millis)
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    #[serde(default)]
    pub engine: RulesEngineConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. 环境变量（RULES 前缀，双下划线分隔，如 RULES__ENGINE__DRY_RUN -> engine.dry_run）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        // .env 文件可选
        let _ = dotenvy::dotenv();

        let env = std::env::var("RULES_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Self::load_from(service_name, &env, Path::new(&config_dir))
    }

    /// 从指定目录加载配置（测试和嵌入式宿主使用）
    pub fn load_from(service_name: &str, env: &str, config_dir: &Path) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env)?
            .set_default("observability.service_name", service_name)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            .add_source(
                Environment::with_prefix("RULES")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
