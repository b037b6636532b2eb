//! 动作处理器与分发器
//!
//! 处理器按能力名称（`name()`）路由，同名处理器可以注册多个实例（例如不同配置），
//! 注销时按实例身份移除，不会误删同名的其他实例。

use crate::error::{Result, RuleError, panic_message};
use crate::models::{ActionRef, Scope};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use rules_shared::observability::metrics::RULE_ACTION_INVOCATIONS_TOTAL;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 动作处理器
///
/// 规则迁移到 matched 时调用 `apply`，从 matched 迁移到 unmatched（或作用域停用）时调用 `revert`。
/// 实现应自身保证幂等：作用域可能被快速停用再启用。
///
/// `apply`/`revert` 在引擎的评估锁内执行，不能回调同一个引擎的启用、停用或注册接口。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// 处理器能力名称，对应规则中 `ActionRef::handler_name`
    fn name(&self) -> &str;

    /// 应用副作用
    async fn apply(&self, parameters: &Value, scope: &Scope) -> Result<()>;

    /// 撤销副作用
    async fn revert(&self, parameters: &Value, scope: &Scope) -> Result<()>;
}

fn same_instance(a: &Arc<dyn ActionHandler>, b: &Arc<dyn ActionHandler>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// 动作处理器注册表
#[derive(Default)]
pub struct ActionHandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn ActionHandler>>>,
}

impl ActionHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器，同一实例重复注册会被忽略
    pub fn register(&self, handlers: Vec<Arc<dyn ActionHandler>>) {
        let mut registered = self.handlers.write();
        for handler in handlers {
            if registered.iter().any(|h| same_instance(h, &handler)) {
                debug!(handler = handler.name(), "处理器实例已注册，忽略");
                continue;
            }
            debug!(handler = handler.name(), "注册动作处理器");
            registered.push(handler);
        }
        info!(handler_count = registered.len(), "动作处理器已注册");
    }

    /// 按实例身份注销处理器，返回实际移除的数量
    pub fn unregister(&self, handlers: &[Arc<dyn ActionHandler>]) -> usize {
        let mut registered = self.handlers.write();
        let before = registered.len();
        registered.retain(|h| !handlers.iter().any(|target| same_instance(h, target)));
        let removed = before - registered.len();
        info!(removed, handler_count = registered.len(), "动作处理器已注销");
        removed
    }

    /// 当前处理器列表的快照
    pub fn snapshot(&self) -> HandlerSnapshot {
        HandlerSnapshot {
            handlers: self.handlers.read().clone(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.read().iter().any(|h| h.name() == name)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}

/// 某一时刻的处理器集合
#[derive(Clone, Default)]
pub struct HandlerSnapshot {
    handlers: Vec<Arc<dyn ActionHandler>>,
}

impl HandlerSnapshot {
    /// 所有声明该能力名称的处理器，按注册顺序
    pub fn resolve<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Arc<dyn ActionHandler>> {
        self.handlers.iter().filter(move |h| h.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPhase {
    Apply,
    Revert,
}

impl ActionPhase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Revert => "revert",
        }
    }
}

/// 单个动作的失败信息
#[derive(Debug, Clone, PartialEq)]
pub struct ActionFailure {
    pub handler_name: String,
    pub phase: ActionPhase,
    pub error: RuleError,
}

/// 动作分发器
///
/// `apply` 按声明顺序执行，`revert` 按声明的逆序执行。单个动作失败或缺少处理器
/// 只记录下来，不影响同一次迁移中的其他动作。
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionDispatcher {
    dry_run: bool,
}

impl ActionDispatcher {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub async fn apply(
        &self,
        handlers: &HandlerSnapshot,
        actions: &[ActionRef],
        scope: &Scope,
        rule_id: &str,
    ) -> Vec<ActionFailure> {
        self.dispatch(handlers, actions.iter(), scope, rule_id, ActionPhase::Apply)
            .await
    }

    pub async fn revert(
        &self,
        handlers: &HandlerSnapshot,
        actions: &[ActionRef],
        scope: &Scope,
        rule_id: &str,
    ) -> Vec<ActionFailure> {
        self.dispatch(handlers, actions.iter().rev(), scope, rule_id, ActionPhase::Revert)
            .await
    }

    async fn dispatch<'a>(
        &self,
        handlers: &HandlerSnapshot,
        actions: impl Iterator<Item = &'a ActionRef>,
        scope: &Scope,
        rule_id: &str,
        phase: ActionPhase,
    ) -> Vec<ActionFailure> {
        let mut failures = Vec::new();

        for action in actions {
            if self.dry_run {
                info!(
                    scope = %scope,
                    rule_id,
                    handler = %action.handler_name,
                    phase = phase.as_str(),
                    "演练模式，跳过动作执行"
                );
                continue;
            }

            let mut found = false;
            for handler in handlers.resolve(&action.handler_name) {
                found = true;
                let invocation = async {
                    match phase {
                        ActionPhase::Apply => handler.apply(&action.parameters, scope).await,
                        ActionPhase::Revert => handler.revert(&action.parameters, scope).await,
                    }
                };
                // 处理器 panic 按失败处理，不中断后续动作
                let outcome = AssertUnwindSafe(invocation)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(RuleError::ActionFailed {
                            handler: action.handler_name.clone(),
                            message: format!("处理器 panic: {}", panic_message(payload.as_ref())),
                        })
                    });

                match outcome {
                    Ok(()) => {
                        metrics::counter!(
                            RULE_ACTION_INVOCATIONS_TOTAL,
                            "phase" => phase.as_str(),
                            "outcome" => "ok"
                        )
                        .increment(1);
                        debug!(
                            scope = %scope,
                            rule_id,
                            handler = %action.handler_name,
                            phase = phase.as_str(),
                            "动作执行成功"
                        );
                    }
                    Err(err) => {
                        metrics::counter!(
                            RULE_ACTION_INVOCATIONS_TOTAL,
                            "phase" => phase.as_str(),
                            "outcome" => "error"
                        )
                        .increment(1);
                        error!(
                            scope = %scope,
                            rule_id,
                            handler = %action.handler_name,
                            phase = phase.as_str(),
                            error = %err,
                            "动作执行失败"
                        );
                        let error = match err {
                            failed @ RuleError::ActionFailed { .. } => failed,
                            other => RuleError::ActionFailed {
                                handler: action.handler_name.clone(),
                                message: other.to_string(),
                            },
                        };
                        failures.push(ActionFailure {
                            handler_name: action.handler_name.clone(),
                            phase,
                            error,
                        });
                    }
                }
            }

            if !found {
                metrics::counter!(
                    RULE_ACTION_INVOCATIONS_TOTAL,
                    "phase" => phase.as_str(),
                    "outcome" => "missing"
                )
                .increment(1);
                warn!(
                    scope = %scope,
                    rule_id,
                    handler = %action.handler_name,
                    phase = phase.as_str(),
                    "未找到动作处理器，跳过该动作"
                );
                failures.push(ActionFailure {
                    handler_name: action.handler_name.clone(),
                    phase,
                    error: RuleError::ActionHandlerNotFound(action.handler_name.clone()),
                });
            }
        }

        failures
    }
}
