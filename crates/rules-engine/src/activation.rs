//! 规则激活状态机
//!
//! 每个 (作用域, 规则集, 规则) 对应一条激活记录：
//! `Uninitialized -> {Matched, Unmatched}`，之后在 `Matched <-> Unmatched` 间迁移。
//! unknown 结论不改变状态，相同结论不重复迁移。

use crate::compiler::CompiledRule;
use crate::models::{Scope, Verdict};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// 激活状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    Uninitialized,
    Matched,
    Unmatched,
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Matched => write!(f, "matched"),
            Self::Unmatched => write!(f, "unmatched"),
        }
    }
}

/// 激活记录的键
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RecordKey {
    pub scope: Scope,
    pub ruleset_id: String,
    pub rule_id: String,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.scope, self.ruleset_id, self.rule_id)
    }
}

/// 激活记录
#[derive(Debug, Clone)]
pub struct ActivationRecord {
    pub key: RecordKey,
    pub rule: CompiledRule,
    state: ActivationState,
    /// 最近一次评估得到的依赖事实
    dependent_facts: BTreeSet<String>,
}

impl ActivationRecord {
    pub fn new(key: RecordKey, rule: CompiledRule) -> Self {
        let dependent_facts = rule.static_facts.clone();
        Self {
            key,
            rule,
            state: ActivationState::Uninitialized,
            dependent_facts,
        }
    }

    pub fn state(&self) -> ActivationState {
        self.state
    }

    pub fn is_matched(&self) -> bool {
        self.state == ActivationState::Matched
    }

    pub fn dependent_facts(&self) -> &BTreeSet<String> {
        &self.dependent_facts
    }

    /// 替换依赖集，返回 (新增, 移除) 的事实
    pub fn replace_dependencies(
        &mut self,
        facts: BTreeSet<String>,
    ) -> (Vec<String>, Vec<String>) {
        let added = facts.difference(&self.dependent_facts).cloned().collect();
        let removed = self.dependent_facts.difference(&facts).cloned().collect();
        self.dependent_facts = facts;
        (added, removed)
    }

    /// 应用一次评估结论，发生迁移时返回 (from, to)
    pub fn apply_verdict(
        &mut self,
        verdict: Verdict,
    ) -> Option<(ActivationState, ActivationState)> {
        let next = match verdict {
            Verdict::Unknown => return None,
            Verdict::Matched => ActivationState::Matched,
            Verdict::Unmatched => ActivationState::Unmatched,
        };

        if next == self.state {
            return None;
        }

        let from = std::mem::replace(&mut self.state, next);
        Some((from, next))
    }
}
