//! 日志订阅器初始化

use anyhow::Result;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use super::ObservabilityConfig;

/// Tracing 资源守卫
///
/// 记录本次初始化是否真正安装了全局订阅器。
pub struct TracingGuard {
    installed: bool,
}

impl TracingGuard {
    pub fn installed(&self) -> bool {
        self.installed
    }
}

/// 初始化 tracing
///
/// 全局订阅器已存在时（例如测试中重复初始化）不视为错误，只返回未安装的守卫。
pub fn init(config: &ObservabilityConfig) -> Result<TracingGuard> {
    // 构建环境过滤器
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // 构建日志层
    let fmt_layer = if config.json_logs {
        fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_ansi(true)
            .boxed()
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok();

    Ok(TracingGuard { installed })
}
