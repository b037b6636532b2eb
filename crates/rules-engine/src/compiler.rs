//! 规则集编译器
//!
//! 在启用作用域时校验规则集结构并预提取每条规则静态引用的事实。
//! 结构错误属于宿主的编程错误，在此直接失败，不会留到评估期变成 unknown。
//! 操作符是否存在不在此校验：操作符可能晚于规则集注册。

use crate::error::{Result, RuleError};
use crate::models::{ConditionNode, Leaf, Rule, Ruleset, ValidityRange};
use crate::operators::CURRENT_TIME_FACT;
use crate::operators::helpers::parse_datetime;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

/// 解析后的规则集有效期，两端均含
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl Validity {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| from <= now) && self.to.is_none_or(|to| now <= to)
    }
}

/// 编译后的规则
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: Arc<Rule>,
    /// 条件树直接引用的事实（不含操作符隐式依赖）；带有效期的规则另含当前时间事实
    pub static_facts: BTreeSet<String>,
    pub validity: Option<Validity>,
}

impl CompiledRule {
    pub fn id(&self) -> &str {
        &self.rule.id
    }

    pub fn root(&self) -> &ConditionNode {
        &self.rule.root_condition
    }
}

/// 编译后的规则集
#[derive(Debug, Clone)]
pub struct CompiledRuleset {
    pub id: String,
    pub rules: Vec<CompiledRule>,
}

impl CompiledRuleset {
    /// 全部规则静态引用的事实并集
    pub fn static_facts(&self) -> BTreeSet<String> {
        self.rules
            .iter()
            .flat_map(|rule| rule.static_facts.iter().cloned())
            .collect()
    }
}

/// 规则集编译器
pub struct RulesetCompiler {
    max_depth: usize,
}

impl Default for RulesetCompiler {
    fn default() -> Self {
        Self::new(32)
    }
}

impl RulesetCompiler {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// 编译规则集
    pub fn compile(&self, ruleset: Ruleset) -> Result<CompiledRuleset> {
        if ruleset.id.trim().is_empty() {
            return Err(RuleError::invalid_ruleset(&ruleset.id, "规则集 ID 不能为空"));
        }

        let validity = ruleset
            .validity_range
            .as_ref()
            .map(|range| parse_validity(&ruleset.id, range))
            .transpose()?;

        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(ruleset.rules.len());

        for rule in ruleset.rules {
            self.validate_rule(&ruleset.id, &rule)?;
            if !seen.insert(rule.id.clone()) {
                return Err(RuleError::invalid_ruleset(
                    &ruleset.id,
                    format!("规则 ID 重复: {}", rule.id),
                ));
            }

            let mut static_facts = rule.root_condition.referenced_facts();
            if validity.is_some() {
                static_facts.insert(CURRENT_TIME_FACT.to_string());
            }
            rules.push(CompiledRule {
                rule: Arc::new(rule),
                static_facts,
                validity,
            });
        }

        Ok(CompiledRuleset {
            id: ruleset.id,
            rules,
        })
    }

    fn validate_rule(&self, ruleset_id: &str, rule: &Rule) -> Result<()> {
        if rule.id.trim().is_empty() {
            return Err(RuleError::invalid_ruleset(ruleset_id, "规则 ID 不能为空"));
        }

        let depth = rule.root_condition.depth();
        if depth > self.max_depth {
            return Err(RuleError::invalid_ruleset(
                ruleset_id,
                format!(
                    "规则 {} 的条件树深度 {} 超过上限 {}",
                    rule.id, depth, self.max_depth
                ),
            ));
        }

        self.validate_node(ruleset_id, &rule.root_condition, &rule.id)?;

        for (i, action) in rule.actions.iter().enumerate() {
            if action.handler_name.trim().is_empty() {
                return Err(RuleError::invalid_ruleset(
                    ruleset_id,
                    format!("规则 {} 的动作 {} 缺少处理器名称", rule.id, i),
                ));
            }
        }

        Ok(())
    }

    fn validate_node(&self, ruleset_id: &str, node: &ConditionNode, path: &str) -> Result<()> {
        match node {
            ConditionNode::Leaf(leaf) => self.validate_leaf(ruleset_id, leaf, path),
            ConditionNode::Group(group) => {
                if group.children.is_empty() {
                    return Err(RuleError::invalid_ruleset(
                        ruleset_id,
                        format!("逻辑组 '{}' 不能为空", path),
                    ));
                }
                for (i, child) in group.children.iter().enumerate() {
                    let child_path = format!("{}.children[{}]", path, i);
                    self.validate_node(ruleset_id, child, &child_path)?;
                }
                Ok(())
            }
            ConditionNode::Not { condition } => {
                self.validate_node(ruleset_id, condition, &format!("{}.not", path))
            }
        }
    }

    fn validate_leaf(&self, ruleset_id: &str, leaf: &Leaf, path: &str) -> Result<()> {
        if leaf.fact.trim().is_empty() {
            return Err(RuleError::invalid_ruleset(
                ruleset_id,
                format!("条件 '{}' 的事实名不能为空", path),
            ));
        }
        if leaf.operator.trim().is_empty() {
            return Err(RuleError::invalid_ruleset(
                ruleset_id,
                format!("条件 '{}' 的操作符不能为空", path),
            ));
        }
        Ok(())
    }
}

fn parse_validity(ruleset_id: &str, range: &ValidityRange) -> Result<Validity> {
    let endpoint = |value: Option<&serde_json::Value>, label: &str| {
        value
            .filter(|v| !v.is_null())
            .map(parse_datetime)
            .transpose()
            .map_err(|err| {
                RuleError::invalid_ruleset(ruleset_id, format!("有效期 {} 无法解析: {}", label, err))
            })
    };
    let validity = Validity {
        from: endpoint(range.from.as_ref(), "from")?,
        to: endpoint(range.to.as_ref(), "to")?,
    };
    match (validity.from, validity.to) {
        (Some(from), Some(to)) if from > to => Err(RuleError::invalid_ruleset(
            ruleset_id,
            format!("有效期起点 {} 晚于终点 {}", from, to),
        )),
        _ => Ok(validity),
    }
}
