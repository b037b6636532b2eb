//! 操作符与操作符注册表
//!
//! 操作符按名称注册，同名后注册者覆盖先注册者，便于宿主扩展或替换内置操作符。
//! 注册表通过 `ArcSwap` 发布不可变快照，每一轮评估开始时取一次快照，
//! 评估过程中的并发注册不会影响正在进行的评估。

mod array;
mod basic;
mod date;
pub(crate) mod helpers;
mod number;

use crate::error::{Result, RuleError};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

pub use array::array_operators;
pub use basic::basic_operators;
pub use date::{CURRENT_TIME_FACT, date_operators};
pub use number::number_operators;

/// 操作符元数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arity {
    /// 只接收事实值
    Unary,
    /// 接收事实值和一个操作数
    Binary,
}

impl Arity {
    /// 期望的操作数个数（事实值本身算一个）
    pub fn operand_count(&self) -> usize {
        match self {
            Self::Unary => 1,
            Self::Binary => 2,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unary => write!(f, "unary"),
            Self::Binary => write!(f, "binary"),
        }
    }
}

/// 操作符执行上下文，携带操作符声明的隐式事实的当前值
#[derive(Debug, Clone, Default)]
pub struct OperatorContext {
    implicit_facts: BTreeMap<String, Value>,
}

impl OperatorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fact(mut self, name: impl Into<String>, value: Value) -> Self {
        self.implicit_facts.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.implicit_facts.insert(name.into(), value);
    }

    pub fn fact(&self, name: &str) -> Option<&Value> {
        self.implicit_facts.get(name)
    }
}

pub type OperatorFn =
    Arc<dyn Fn(&Value, Option<&Value>, &OperatorContext) -> Result<bool> + Send + Sync>;

/// 操作数校验函数
pub type OperandValidator = fn(&Value) -> bool;

/// 已注册的操作符
#[derive(Clone)]
pub struct Operator {
    name: String,
    arity: Arity,
    evaluator: OperatorFn,
    validate_lhs: Option<OperandValidator>,
    validate_rhs: Option<OperandValidator>,
    implicit_facts: Vec<String>,
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("implicit_facts", &self.implicit_facts)
            .finish_non_exhaustive()
    }
}

impl Operator {
    pub fn new<F>(name: impl Into<String>, arity: Arity, evaluator: F) -> Self
    where
        F: Fn(&Value, Option<&Value>, &OperatorContext) -> Result<bool> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            arity,
            evaluator: Arc::new(evaluator),
            validate_lhs: None,
            validate_rhs: None,
            implicit_facts: Vec::new(),
        }
    }

    /// 一元操作符
    pub fn unary<F>(name: impl Into<String>, evaluator: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self::new(name, Arity::Unary, move |value, _, _| Ok(evaluator(value)))
    }

    /// 二元操作符
    pub fn binary<F>(name: impl Into<String>, evaluator: F) -> Self
    where
        F: Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        let operator_name = name.clone();
        Self::new(name, Arity::Binary, move |value, operand, _| {
            let operand = operand.ok_or_else(|| RuleError::OperatorArity {
                operator: operator_name.clone(),
                expected: Arity::Binary,
                provided: 1,
            })?;
            Ok(evaluator(value, operand))
        })
    }

    pub fn with_lhs_validator(mut self, validator: OperandValidator) -> Self {
        self.validate_lhs = Some(validator);
        self
    }

    pub fn with_rhs_validator(mut self, validator: OperandValidator) -> Self {
        self.validate_rhs = Some(validator);
        self
    }

    /// 声明操作符隐式读取的事实（例如当前时间）
    pub fn with_implicit_facts<I, S>(mut self, facts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.implicit_facts = facts.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    pub fn implicit_facts(&self) -> &[String] {
        &self.implicit_facts
    }

    /// 执行操作符
    ///
    /// 先检查元数，再执行左右操作数校验，校验失败返回 `TypeMismatch`。
    pub fn evaluate(
        &self,
        value: &Value,
        operand: Option<&Value>,
        context: &OperatorContext,
    ) -> Result<bool> {
        let provided = if operand.is_some() { 2 } else { 1 };
        if provided != self.arity.operand_count() {
            return Err(RuleError::OperatorArity {
                operator: self.name.clone(),
                expected: self.arity,
                provided,
            });
        }

        if self.validate_lhs.is_some_and(|validate| !validate(value)) {
            return Err(RuleError::TypeMismatch {
                expected: format!("{} 的有效左操作数", self.name),
                actual: helpers::type_name(value).to_string(),
            });
        }

        if let (Some(validate), Some(operand)) = (self.validate_rhs, operand) {
            if !validate(operand) {
                return Err(RuleError::TypeMismatch {
                    expected: format!("{} 的有效右操作数", self.name),
                    actual: helpers::type_name(operand).to_string(),
                });
            }
        }

        (self.evaluator)(value, operand, context)
    }
}

/// 全部内置操作符
pub fn default_operators() -> Vec<Operator> {
    let mut operators = basic_operators();
    operators.extend(number_operators());
    operators.extend(array_operators());
    operators.extend(date_operators());
    operators
}

/// 操作符注册表
pub struct OperatorRegistry {
    operators: ArcSwap<HashMap<String, Arc<Operator>>>,
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self {
            operators: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// 创建预置全部内置操作符的注册表
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.upsert_operators(default_operators());
        registry
    }

    /// 注册或覆盖操作符
    pub fn upsert_operators(&self, operators: Vec<Operator>) {
        if operators.is_empty() {
            return;
        }

        let operators: Vec<Arc<Operator>> = operators.into_iter().map(Arc::new).collect();
        self.operators.rcu(|current| {
            let mut next = HashMap::clone(current);
            for operator in &operators {
                if next
                    .insert(operator.name().to_string(), Arc::clone(operator))
                    .is_some()
                {
                    debug!(operator = %operator.name(), "覆盖已注册的操作符");
                }
            }
            next
        });

        info!(count = operators.len(), total = self.len(), "操作符已注册");
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<Operator>> {
        self.operators.load().get(name).cloned()
    }

    /// 当前注册表的不可变快照
    pub fn snapshot(&self) -> OperatorSnapshot {
        OperatorSnapshot {
            operators: self.operators.load_full(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operators.load().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.operators.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 某一时刻的操作符集合
#[derive(Clone)]
pub struct OperatorSnapshot {
    operators: Arc<HashMap<String, Arc<Operator>>>,
}

impl OperatorSnapshot {
    pub fn resolve(&self, name: &str) -> Option<&Arc<Operator>> {
        self.operators.get(name)
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}
