//! 条件评估器
//!
//! 递归下降求出三态结论，同时收集本次评估依赖的全部事实。
//! 逻辑组在结论确定后短路，但剩余子节点仍会参与依赖收集，
//! 这样未被求值分支中的事实发生变化时同样会触发下一次评估。

use crate::error::{RuleError, panic_message};
use crate::fact::{FactLookup, FactState};
use crate::models::{
    Combinator, ConditionGroup, ConditionNode, EvaluationResult, Leaf, Verdict, value_at_path,
};
use crate::operators::{OperatorContext, OperatorSnapshot};
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

/// 条件评估器
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator {
    /// 是否记录详细评估追踪
    trace_enabled: bool,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self {
            trace_enabled: false,
        }
    }

    /// 启用评估追踪
    pub fn with_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    /// 评估条件树
    ///
    /// 评估期间的错误不会向上传播：出错的叶子结论为 unknown，错误记录在结果中。
    pub fn evaluate<F>(
        &self,
        node: &ConditionNode,
        facts: &F,
        operators: &OperatorSnapshot,
    ) -> EvaluationResult
    where
        F: FactLookup + ?Sized,
    {
        let start = Instant::now();
        let mut result = EvaluationResult::new(Verdict::Unknown);

        let verdict = self.evaluate_node(node, facts, operators, &mut result, "root");
        result.verdict = verdict;
        result.evaluation_time_us = start.elapsed().as_micros() as u64;

        result
    }

    fn evaluate_node<F>(
        &self,
        node: &ConditionNode,
        facts: &F,
        operators: &OperatorSnapshot,
        result: &mut EvaluationResult,
        path: &str,
    ) -> Verdict
    where
        F: FactLookup + ?Sized,
    {
        match node {
            ConditionNode::Leaf(leaf) => self.evaluate_leaf(leaf, facts, operators, result, path),
            ConditionNode::Group(group) => {
                self.evaluate_group(group, facts, operators, result, path)
            }
            ConditionNode::Not { condition } => {
                let verdict = self
                    .evaluate_node(condition, facts, operators, result, &format!("{}.not", path))
                    .negate();
                self.trace(result, || format!("{}: NOT => {}", path, verdict));
                verdict
            }
        }
    }

    fn evaluate_leaf<F>(
        &self,
        leaf: &Leaf,
        facts: &F,
        operators: &OperatorSnapshot,
        result: &mut EvaluationResult,
        path: &str,
    ) -> Verdict
    where
        F: FactLookup + ?Sized,
    {
        result.dependent_facts.insert(leaf.fact.clone());

        let Some(operator) = operators.resolve(&leaf.operator) else {
            return self.fail(result, path, RuleError::OperatorNotFound(leaf.operator.clone()));
        };

        // 隐式依赖先于取值加入依赖集，保证未产出值时也会被订阅
        result
            .dependent_facts
            .extend(operator.implicit_facts().iter().cloned());

        let mut context = OperatorContext::new();
        for implicit in operator.implicit_facts() {
            match facts.lookup(implicit) {
                FactState::Value(value) => context.insert(implicit.clone(), value),
                FactState::Unset => {
                    self.trace(result, || format!("{}: 隐式事实 {} 尚未产出", path, implicit));
                    return Verdict::Unknown;
                }
                FactState::NotRegistered => {
                    return self.fail(result, path, RuleError::FactNotFound(implicit.clone()));
                }
            }
        }

        let fact_value = match facts.lookup(&leaf.fact) {
            FactState::Value(value) => value,
            FactState::Unset => {
                self.trace(result, || format!("{}: 事实 {} 尚未产出 => unknown", path, leaf.fact));
                return Verdict::Unknown;
            }
            FactState::NotRegistered => {
                return self.fail(result, path, RuleError::FactNotFound(leaf.fact.clone()));
            }
        };

        let value = match leaf.path.as_deref() {
            Some(sub_path) => value_at_path(&fact_value, sub_path)
                .cloned()
                .unwrap_or(Value::Null),
            None => fact_value,
        };

        let operand = leaf.operand.as_ref().filter(|operand| !operand.is_null());
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            operator.evaluate(&value, operand, &context)
        }))
        .unwrap_or_else(|payload| {
            Err(RuleError::OperatorPanicked {
                operator: leaf.operator.clone(),
                message: panic_message(payload.as_ref()),
            })
        });
        match outcome {
            Ok(matched) => {
                let verdict = Verdict::from_bool(matched);
                self.trace(result, || {
                    format!(
                        "{}: {} {} {} => {}",
                        path,
                        leaf.fact,
                        leaf.operator,
                        operand.map(Value::to_string).unwrap_or_default(),
                        verdict
                    )
                });
                verdict
            }
            Err(err) => self.fail(result, path, err),
        }
    }

    /// 评估逻辑组
    fn evaluate_group<F>(
        &self,
        group: &ConditionGroup,
        facts: &F,
        operators: &OperatorSnapshot,
        result: &mut EvaluationResult,
        path: &str,
    ) -> Verdict
    where
        F: FactLookup + ?Sized,
    {
        self.trace(result, || {
            format!(
                "{}: 开始评估 {} 组 (共 {} 个子节点)",
                path,
                group.combinator,
                group.children.len()
            )
        });

        // AND 遇到 unmatched、OR 遇到 matched 即可确定结论
        let decisive = match group.combinator {
            Combinator::And => Verdict::Unmatched,
            Combinator::Or => Verdict::Matched,
        };

        let mut saw_unknown = false;
        for (i, child) in group.children.iter().enumerate() {
            let child_path = format!("{}.children[{}]", path, i);
            let verdict = self.evaluate_node(child, facts, operators, result, &child_path);

            if verdict == decisive {
                self.trace(result, || {
                    format!("{}: {} 短路 - 子节点 {} 为 {}", path, group.combinator, i, verdict)
                });
                for rest in &group.children[i + 1..] {
                    collect_dependencies(rest, operators, result);
                }
                return decisive;
            }
            if verdict == Verdict::Unknown {
                saw_unknown = true;
            }
        }

        if saw_unknown {
            Verdict::Unknown
        } else {
            decisive.negate()
        }
    }

    fn fail(&self, result: &mut EvaluationResult, path: &str, error: RuleError) -> Verdict {
        self.trace(result, || format!("{}: 错误 {} => unknown", path, error));
        result.errors.push(error);
        Verdict::Unknown
    }

    fn trace(&self, result: &mut EvaluationResult, message: impl FnOnce() -> String) {
        if self.trace_enabled {
            result.evaluation_trace.push(message());
        }
    }
}

/// 只收集依赖，不求值
fn collect_dependencies(
    node: &ConditionNode,
    operators: &OperatorSnapshot,
    result: &mut EvaluationResult,
) {
    match node {
        ConditionNode::Leaf(leaf) => {
            result.dependent_facts.insert(leaf.fact.clone());
            if let Some(operator) = operators.resolve(&leaf.operator) {
                result
                    .dependent_facts
                    .extend(operator.implicit_facts().iter().cloned());
            }
        }
        ConditionNode::Group(group) => {
            for child in &group.children {
                collect_dependencies(child, operators, result);
            }
        }
        ConditionNode::Not { condition } => collect_dependencies(condition, operators, result),
    }
}
