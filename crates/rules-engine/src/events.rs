//! 引擎事件
//!
//! 作用域生命周期、规则评估和状态迁移通过 broadcast 通道发布，供调试工具等可选订阅者观察。
//! 没有订阅者时发布是空操作，不影响评估语义。

use crate::activation::{ActivationState, RecordKey};
use crate::actions::ActionFailure;
use crate::error::RuleError;
use crate::models::{Scope, Verdict};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// 作用域已启用
    ScopeEnabled {
        scope: Scope,
        ruleset_ids: Vec<String>,
        rule_count: usize,
    },
    /// 作用域已停用，`reverted` 为被撤销动作的规则数
    ScopeDisabled { scope: Scope, reverted: usize },
    /// 一次规则评估
    RuleEvaluated {
        key: RecordKey,
        verdict: Verdict,
        dependent_facts: BTreeSet<String>,
        errors: Vec<RuleError>,
        /// 逐节点评估追踪，仅在开启 `trace_evaluations` 时非空
        trace: Vec<String>,
    },
    /// 激活状态迁移
    Transition {
        key: RecordKey,
        from: ActivationState,
        to: ActivationState,
    },
    /// 单个动作执行失败或缺少处理器
    ActionFailed { key: RecordKey, failure: ActionFailure },
    /// 某次事实变化的处理过程 panic，分发任务继续处理后续变化
    DispatchFailed { fact: String, message: String },
}

impl EngineEvent {
    /// 事件所属作用域，分发失败不属于任何作用域
    pub fn scope(&self) -> Option<&Scope> {
        match self {
            Self::ScopeEnabled { scope, .. } | Self::ScopeDisabled { scope, .. } => Some(scope),
            Self::RuleEvaluated { key, .. }
            | Self::Transition { key, .. }
            | Self::ActionFailed { key, .. } => Some(&key.scope),
            Self::DispatchFailed { .. } => None,
        }
    }
}
