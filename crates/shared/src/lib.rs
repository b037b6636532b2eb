//! 共享库
//!
//! 规则引擎与宿主应用共用的配置加载、可观测性初始化和重试策略。

pub mod config;
pub mod observability;
pub mod retry;
