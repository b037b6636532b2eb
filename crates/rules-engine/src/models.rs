//! 规则引擎领域模型

use crate::error::{Result, RuleError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// 规则集
///
/// 规则集一旦加载即不可变；更新规则集意味着整体替换后重新启用作用域。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ruleset {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// 有效期，期外的规则一律按 unmatched 处理
    #[serde(
        default,
        rename = "validityRange",
        skip_serializing_if = "Option::is_none"
    )]
    pub validity_range: Option<ValidityRange>,
}

impl Ruleset {
    pub fn new(id: impl Into<String>, rules: Vec<Rule>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            rules,
            validity_range: None,
        }
    }

    pub fn with_validity_range(mut self, from: Option<Value>, to: Option<Value>) -> Self {
        self.validity_range = Some(ValidityRange { from, to });
        self
    }

    /// 从 JSON 文档解析规则集
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// 规则集有效期
///
/// 端点为 RFC 3339 字符串、`YYYY-MM-DD` 日期或毫秒时间戳，缺省的端点不设限，两端均含。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidityRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Value>,
}

/// 规则定义：条件树加上匹配时要应用的动作列表
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub root_condition: ConditionNode,
    #[serde(default)]
    pub actions: Vec<ActionRef>,
}

impl Rule {
    pub fn new(id: impl Into<String>, root_condition: ConditionNode) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            root_condition,
            actions: Vec::new(),
        }
    }

    pub fn with_action(mut self, action: ActionRef) -> Self {
        self.actions.push(action);
        self
    }
}

/// 动作引用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRef {
    pub handler_name: String,
    #[serde(default)]
    pub parameters: Value,
}

impl ActionRef {
    pub fn new(handler_name: impl Into<String>, parameters: Value) -> Self {
        Self {
            handler_name: handler_name.into(),
            parameters,
        }
    }
}

/// 条件节点（叶子、逻辑组或取反）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionNode {
    Leaf(Leaf),
    Group(ConditionGroup),
    Not { condition: Box<ConditionNode> },
}

impl ConditionNode {
    pub fn leaf(fact: impl Into<String>, operator: impl Into<String>) -> Self {
        Self::Leaf(Leaf::new(fact, operator))
    }

    pub fn binary(
        fact: impl Into<String>,
        operator: impl Into<String>,
        operand: impl Into<Value>,
    ) -> Self {
        Self::Leaf(Leaf::new(fact, operator).with_operand(operand))
    }

    pub fn and(children: Vec<ConditionNode>) -> Self {
        Self::Group(ConditionGroup::new(Combinator::And, children))
    }

    pub fn or(children: Vec<ConditionNode>) -> Self {
        Self::Group(ConditionGroup::new(Combinator::Or, children))
    }

    pub fn negate(condition: ConditionNode) -> Self {
        Self::Not {
            condition: Box::new(condition),
        }
    }

    /// 条件树深度（单个叶子为 1）
    pub fn depth(&self) -> usize {
        match self {
            Self::Leaf(_) => 1,
            Self::Group(group) => 1 + group.children.iter().map(Self::depth).max().unwrap_or(0),
            Self::Not { condition } => 1 + condition.depth(),
        }
    }

    /// 条件树中直接引用的所有事实名
    pub fn referenced_facts(&self) -> BTreeSet<String> {
        let mut facts = BTreeSet::new();
        self.collect_facts(&mut facts);
        facts
    }

    fn collect_facts(&self, facts: &mut BTreeSet<String>) {
        match self {
            Self::Leaf(leaf) => {
                facts.insert(leaf.fact.clone());
            }
            Self::Group(group) => group.children.iter().for_each(|c| c.collect_facts(facts)),
            Self::Not { condition } => condition.collect_facts(facts),
        }
    }
}

/// 条件叶子：`operator(fact[path], operand?)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leaf {
    pub fact: String,
    pub operator: String,
    #[serde(default, alias = "value", skip_serializing_if = "Option::is_none")]
    pub operand: Option<Value>,
    /// 点号分隔的子路径，如 "cart.items.0.price"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Leaf {
    pub fn new(fact: impl Into<String>, operator: impl Into<String>) -> Self {
        Self {
            fact: fact.into(),
            operator: operator.into(),
            operand: None,
            path: None,
        }
    }

    pub fn with_operand(mut self, operand: impl Into<Value>) -> Self {
        self.operand = Some(operand.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// 实际提供的操作数个数（事实值本身算一个，JSON null 操作数视为未提供）
    pub fn provided_operands(&self) -> usize {
        match &self.operand {
            Some(Value::Null) | None => 1,
            Some(_) => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub combinator: Combinator,
    pub children: Vec<ConditionNode>,
}

impl ConditionGroup {
    pub fn new(combinator: Combinator, children: Vec<ConditionNode>) -> Self {
        Self {
            combinator,
            children,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Combinator {
    And,
    Or,
}

impl fmt::Display for Combinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
        }
    }
}

/// 作用域标识
///
/// 由调用方提供的不透明标识（例如某个界面区域实例 id），生命周期完全由调用方控制。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 生成带前缀的唯一作用域
    pub fn unique(prefix: &str) -> Self {
        Self(format!("{}-{}", prefix, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Scope {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Scope {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 三态评估结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Matched,
    Unmatched,
    /// 依赖事实尚未产出值或评估出错，不能等同于 Unmatched
    Unknown,
}

impl Verdict {
    pub fn from_bool(value: bool) -> Self {
        if value { Self::Matched } else { Self::Unmatched }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    pub fn negate(self) -> Self {
        match self {
            Self::Matched => Self::Unmatched,
            Self::Unmatched => Self::Matched,
            Self::Unknown => Self::Unknown,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Matched => write!(f, "matched"),
            Self::Unmatched => write!(f, "unmatched"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// 条件评估结果
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    pub verdict: Verdict,
    /// 本次评估读取过的全部事实（含操作符隐式依赖）
    pub dependent_facts: BTreeSet<String>,
    /// 就地恢复的错误，对应叶子结论为 unknown
    #[serde(skip)]
    pub errors: Vec<RuleError>,
    pub evaluation_trace: Vec<String>,
    pub evaluation_time_us: u64,
}

impl EvaluationResult {
    pub fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            dependent_facts: BTreeSet::new(),
            errors: Vec::new(),
            evaluation_trace: Vec::new(),
            evaluation_time_us: 0,
        }
    }
}

/// 按点号路径读取 JSON 子值，数字段作为数组下标
pub fn value_at_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.').filter(|p| !p.is_empty()) {
        match current {
            Value::Object(map) => current = map.get(part)?,
            Value::Array(arr) => {
                let index: usize = part.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}
