//! 规则引擎错误类型
//!
//! 评估期间的错误（事实缺失、操作符问题、动作处理器缺失、事实源失败）在引擎内部
//! 就地恢复：对应叶子节点的结论变为 unknown，或跳过单个动作；只有宿主注册时的
//! 编程错误（非法规则集）会在启用作用域时直接返回。

use crate::operators::Arity;
use std::any::Any;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    // ==================== 事实错误 ====================
    #[error("事实未注册: {0}")]
    FactNotFound(String),

    #[error("事实源创建失败: {fact} - {message}")]
    FactSource { fact: String, message: String },

    // ==================== 操作符错误 ====================
    #[error("操作符未注册: {0}")]
    OperatorNotFound(String),

    #[error("操作符 {operator} 为 {expected} 操作符，但条件提供了 {provided} 个操作数")]
    OperatorArity {
        operator: String,
        expected: Arity,
        provided: usize,
    },

    #[error("类型不匹配: 期望 {expected}, 实际 {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("无效的操作数: {0}")]
    InvalidOperand(String),

    #[error("操作符 {operator} 执行时 panic: {message}")]
    OperatorPanicked { operator: String, message: String },

    // ==================== 动作错误 ====================
    #[error("动作处理器未注册: {0}")]
    ActionHandlerNotFound(String),

    #[error("动作执行失败: {handler} - {message}")]
    ActionFailed { handler: String, message: String },

    // ==================== 注册错误 ====================
    #[error("无效的规则集 {ruleset_id}: {reason}")]
    InvalidRuleset { ruleset_id: String, reason: String },

    #[error("作用域未启用: {0}")]
    ScopeNotEnabled(String),

    #[error("规则引擎已关闭")]
    EngineShutdown,

    #[error("JSON 序列化错误: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, RuleError>;

impl From<serde_json::Error> for RuleError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl RuleError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::FactNotFound(_) => "FACT_NOT_FOUND",
            Self::FactSource { .. } => "FACT_SOURCE_ERROR",
            Self::OperatorNotFound(_) => "OPERATOR_NOT_FOUND",
            Self::OperatorArity { .. } => "OPERATOR_ARITY_ERROR",
            Self::TypeMismatch { .. } => "TYPE_MISMATCH",
            Self::InvalidOperand(_) => "INVALID_OPERAND",
            Self::OperatorPanicked { .. } => "OPERATOR_PANICKED",
            Self::ActionHandlerNotFound(_) => "ACTION_HANDLER_NOT_FOUND",
            Self::ActionFailed { .. } => "ACTION_FAILED",
            Self::InvalidRuleset { .. } => "INVALID_RULESET",
            Self::ScopeNotEnabled(_) => "SCOPE_NOT_ENABLED",
            Self::EngineShutdown => "ENGINE_SHUTDOWN",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// 是否为评估期间可就地恢复的错误
    ///
    /// 可恢复错误只影响单个叶子节点或单个动作，不会中断同一轮中其他规则的评估。
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::FactNotFound(_)
                | Self::FactSource { .. }
                | Self::OperatorNotFound(_)
                | Self::OperatorArity { .. }
                | Self::TypeMismatch { .. }
                | Self::InvalidOperand(_)
                | Self::OperatorPanicked { .. }
                | Self::ActionHandlerNotFound(_)
                | Self::ActionFailed { .. }
        )
    }

    pub(crate) fn invalid_ruleset(ruleset_id: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRuleset {
            ruleset_id: ruleset_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// 提取 panic 负载中的文本
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
