//! 响应式规则引擎
//!
//! 按作用域启用规则集，事实值变化时自动重新评估依赖它的规则，
//! 并在规则匹配/不再匹配时对称地应用或撤销动作处理器的副作用。
//!
//! ## 核心组件
//!
//! - [`FactStore`]: 惰性创建、单次打开、重放最新值的共享事实流
//! - [`OperatorRegistry`]: 按名称查找的操作符，内置常用比较、数组、日期操作符
//! - [`ConditionEvaluator`]: 三态（matched / unmatched / unknown）条件评估并收集依赖事实
//! - [`ActivationRecord`]: 每个 (作用域, 规则集, 规则) 的激活状态机
//! - [`ActionDispatcher`]: 按声明顺序应用、逆序撤销动作
//! - [`RulesEngine`]: 作用域启用/停用与事实变化分发
//!
//! ## 使用示例
//!
//! ```ignore
//! use rules_engine::{ActionRef, ConditionNode, Fact, Rule, Ruleset, RulesEngine};
//! use serde_json::json;
//!
//! let engine = RulesEngine::with_defaults();
//! engine.upsert_facts(vec![Fact::constant("isSummer", true)]).await?;
//! engine.register_action_handlers(vec![popup_handler])?;
//!
//! let ruleset = Ruleset::new(
//!     "campaign",
//!     vec![Rule::new("r1", ConditionNode::leaf("isSummer", "isTrue"))
//!         .with_action(ActionRef::new("popup", json!({"msg": "hi"})))],
//! );
//! engine.enable_ruleset_for("home-banner", ruleset).await?;
//! ```

pub mod actions;
pub mod activation;
pub mod compiler;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod fact;
pub mod models;
pub mod operators;
mod subscription;

pub use actions::{
    ActionDispatcher, ActionFailure, ActionHandler, ActionHandlerRegistry, ActionPhase,
    HandlerSnapshot,
};
pub use activation::{ActivationRecord, ActivationState, RecordKey};
pub use compiler::{CompiledRule, CompiledRuleset, RulesetCompiler, Validity};
pub use engine::{EngineStats, RulesEngine};
pub use error::{Result, RuleError};
pub use evaluator::ConditionEvaluator;
pub use events::EngineEvent;
pub use fact::{Fact, FactLookup, FactSource, FactState, FactStore, FactsProvider, SharedStream};
pub use models::{
    ActionRef, Combinator, ConditionGroup, ConditionNode, EvaluationResult, Leaf, Rule, Ruleset,
    Scope, ValidityRange, Verdict,
};
pub use operators::{
    Arity, Operator, OperatorContext, OperatorRegistry, OperatorSnapshot, default_operators,
};
