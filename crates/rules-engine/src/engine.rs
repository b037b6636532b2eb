//! 规则引擎
//!
//! 把事实存储、操作符注册表、条件评估器、激活状态机和动作分发器组装为一个显式构造的实例。
//!
//! 并发模型：
//! - 全部激活状态由一把 `tokio::sync::Mutex` 保护，启用/停用和每一轮事实变化处理
//!   都在持锁期间完成（包括等待动作处理器），同一引擎内的评估与副作用严格串行；
//! - 事实流的创建（打开事实源及其重试）在锁外的监听任务中进行，慢事实源不会阻塞
//!   其他作用域，停用作用域时进行中的创建随订阅一起取消；
//! - 事实变化经由转发任务进入同一条无界队列，由单个分发任务按到达顺序处理，
//!   一次变化引发的全部重新评估和动作分发完成后才处理下一次变化；
//! - 每轮处理开始时对操作符和处理器注册表取快照，注册表的并发修改只影响之后的评估；
//! - 一轮处理中的 panic 被分发任务捕获并以 [`EngineEvent::DispatchFailed`] 发布，后续变化照常处理。
//!
//! 动作处理器在评估锁内被调用，不能在 `apply`/`revert` 中回调同一个引擎。

use crate::actions::{
    ActionDispatcher, ActionFailure, ActionHandler, ActionHandlerRegistry, HandlerSnapshot,
};
use crate::activation::{ActivationRecord, ActivationState, RecordKey};
use crate::compiler::{CompiledRuleset, RulesetCompiler};
use crate::error::{Result, RuleError, panic_message};
use crate::evaluator::ConditionEvaluator;
use crate::events::EngineEvent;
use crate::fact::{Fact, FactStore, FactsProvider, SharedStream};
use crate::models::{ConditionNode, EvaluationResult, Rule, Ruleset, Scope, Verdict};
use crate::operators::helpers::parse_datetime;
use crate::operators::{CURRENT_TIME_FACT, Operator, OperatorRegistry};
use crate::subscription::{FactSubscriptions, spawn_watcher};
use rules_shared::config::RulesEngineConfig;
use rules_shared::observability::metrics::{
    RULE_EVALUATION_DURATION_SECONDS, RULE_EVALUATIONS_TOTAL, RULE_TRANSITIONS_TOTAL,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

/// 分发队列中的指令
pub(crate) enum Command {
    FactChanged(String),
    /// 处理到此处时通知等待方
    Flush(oneshot::Sender<()>),
}

struct EnabledScope {
    scope: Scope,
    ruleset_ids: Vec<String>,
    /// 按启用顺序排列的记录键
    keys: Vec<RecordKey>,
}

struct EngineState {
    records: BTreeMap<RecordKey, ActivationRecord>,
    scopes: Vec<EnabledScope>,
    subscriptions: FactSubscriptions,
    compiler: RulesetCompiler,
}

impl EngineState {
    fn new(max_condition_depth: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            scopes: Vec::new(),
            subscriptions: FactSubscriptions::default(),
            compiler: RulesetCompiler::new(max_condition_depth),
        }
    }

    fn scope_index(&self, scope: &Scope) -> Option<usize> {
        self.scopes.iter().position(|s| &s.scope == scope)
    }

    /// 最近一次评估依赖该事实的记录
    fn dependents(&self, fact: &str) -> Vec<RecordKey> {
        self.records
            .values()
            .filter(|record| record.dependent_facts().contains(fact))
            .map(|record| record.key.clone())
            .collect()
    }
}

/// 引擎运行统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub registered_facts: usize,
    pub live_fact_streams: usize,
    pub fact_subscriptions: usize,
    pub operators: usize,
    pub action_handlers: usize,
    pub enabled_scopes: usize,
    pub activation_records: usize,
    pub matched_records: usize,
}

struct Inner {
    config: RulesEngineConfig,
    facts: Arc<FactStore>,
    operators: OperatorRegistry,
    handlers: ActionHandlerRegistry,
    evaluator: ConditionEvaluator,
    dispatcher: ActionDispatcher,
    state: Mutex<EngineState>,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<EngineEvent>,
    shutdown: AtomicBool,
    dispatch_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.dispatch_task.get_mut().take() {
            task.abort();
        }
    }
}

impl Inner {
    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            Err(RuleError::EngineShutdown)
        } else {
            Ok(())
        }
    }

    fn publish(&self, event: EngineEvent) {
        // 没有订阅者时发送失败，忽略
        let _ = self.events.send(event);
    }

    async fn handle_fact_change(&self, fact: &str) {
        let mut state = self.state.lock().await;
        self.ensure_watching(&mut state, fact);

        let keys = state.dependents(fact);
        if keys.is_empty() {
            return;
        }

        debug!(fact, records = keys.len(), "事实变化，重新评估依赖规则");
        self.evaluate_records(&mut state, &keys).await;
    }

    /// 为已订阅的事实启动（或重启）监听任务
    ///
    /// 未注册的事实在注册时再启动，见 [`RulesEngine::upsert_facts`]。
    fn watch_fact(&self, state: &mut EngineState, fact: &str) {
        if !state.subscriptions.is_subscribed(fact) {
            return;
        }
        if !self.facts.contains(fact) {
            debug!(fact, "事实尚未注册，注册后再创建事实流");
            return;
        }
        let watcher = spawn_watcher(Arc::clone(&self.facts), fact.to_string(), self.commands.clone());
        state.subscriptions.watch(fact, watcher);
    }

    /// 监听任务已退出（创建失败）时重新启动，用于"下次访问时重试"
    fn ensure_watching(&self, state: &mut EngineState, fact: &str) {
        if !state.subscriptions.is_watching(fact) {
            self.watch_fact(state, fact);
        }
    }

    /// 有效期判断用的当前时间：优先取宿主注册的时间事实，否则取系统时钟
    fn current_time(&self) -> DateTime<Utc> {
        self.facts
            .fact_value(CURRENT_TIME_FACT)
            .and_then(|value| parse_datetime(&value).ok())
            .unwrap_or_else(Utc::now)
    }

    /// 重新评估一组记录，更新依赖订阅并分发状态迁移
    async fn evaluate_records(&self, state: &mut EngineState, keys: &[RecordKey]) {
        let operators = self.operators.snapshot();
        let handlers = self.handlers.snapshot();
        let mut new_facts = Vec::new();

        for key in keys {
            let Some(record) = state.records.get_mut(key) else {
                continue;
            };

            let mut result = self
                .evaluator
                .evaluate(record.rule.root(), self.facts.as_ref(), &operators);
            if let Some(validity) = record.rule.validity {
                result.dependent_facts.insert(CURRENT_TIME_FACT.to_string());
                let now = self.current_time();
                if !validity.contains(now) {
                    if self.config.trace_evaluations {
                        result
                            .evaluation_trace
                            .push(format!("{} 不在规则集有效期内 → unmatched", now));
                    }
                    result.verdict = Verdict::Unmatched;
                }
            }
            metrics::counter!(RULE_EVALUATIONS_TOTAL, "verdict" => result.verdict.to_string())
                .increment(1);
            metrics::histogram!(RULE_EVALUATION_DURATION_SECONDS)
                .record(result.evaluation_time_us as f64 / 1_000_000.0);

            let (added, removed) = record.replace_dependencies(result.dependent_facts.clone());
            let transition = record.apply_verdict(result.verdict);
            let rule = Arc::clone(&record.rule.rule);

            debug!(
                record = %key,
                verdict = %result.verdict,
                errors = result.errors.len(),
                "规则评估完成"
            );
            for err in &result.errors {
                debug!(record = %key, error = %err, "评估错误已就地恢复");
            }

            self.publish(EngineEvent::RuleEvaluated {
                key: key.clone(),
                verdict: result.verdict,
                dependent_facts: result.dependent_facts,
                errors: result.errors,
                trace: result.evaluation_trace,
            });

            for fact in &removed {
                state.subscriptions.release(fact);
            }
            for fact in added {
                if state.subscriptions.acquire(&fact) {
                    new_facts.push(fact);
                }
            }

            if let Some((from, to)) = transition {
                self.dispatch_transition(key, &rule, from, to, &handlers)
                    .await;
            }
        }

        for fact in new_facts {
            self.watch_fact(state, &fact);
        }
    }

    async fn dispatch_transition(
        &self,
        key: &RecordKey,
        rule: &Rule,
        from: ActivationState,
        to: ActivationState,
        handlers: &HandlerSnapshot,
    ) {
        metrics::counter!(RULE_TRANSITIONS_TOTAL, "to" => to.to_string()).increment(1);
        info!(record = %key, from = %from, to = %to, "规则状态迁移");
        self.publish(EngineEvent::Transition {
            key: key.clone(),
            from,
            to,
        });

        let failures = match to {
            ActivationState::Matched => {
                self.dispatcher
                    .apply(handlers, &rule.actions, &key.scope, &rule.id)
                    .await
            }
            // 从未匹配过的规则没有可撤销的副作用
            ActivationState::Unmatched if from == ActivationState::Matched => {
                self.dispatcher
                    .revert(handlers, &rule.actions, &key.scope, &rule.id)
                    .await
            }
            _ => Vec::new(),
        };
        self.report_failures(key, failures);
    }

    fn report_failures(&self, key: &RecordKey, failures: Vec<ActionFailure>) {
        for failure in failures {
            self.publish(EngineEvent::ActionFailed {
                key: key.clone(),
                failure,
            });
        }
    }

    async fn enable_locked(
        &self,
        state: &mut EngineState,
        scope: Scope,
        rulesets: Vec<Ruleset>,
    ) -> Result<()> {
        // 先完整编译，任何结构错误都不会影响已启用的作用域
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(rulesets.len());
        for ruleset in rulesets {
            if !seen.insert(ruleset.id.clone()) {
                return Err(RuleError::invalid_ruleset(
                    &ruleset.id,
                    "同一作用域内规则集 ID 重复",
                ));
            }
            compiled.push(state.compiler.compile(ruleset)?);
        }

        if state.scope_index(&scope).is_some() {
            info!(scope = %scope, "作用域已启用，先停用再重新启用");
            self.disable_locked(state, &scope).await;
        }

        let mut keys = Vec::new();
        for ruleset in &compiled {
            for rule in &ruleset.rules {
                let key = RecordKey {
                    scope: scope.clone(),
                    ruleset_id: ruleset.id.clone(),
                    rule_id: rule.id().to_string(),
                };
                let record = ActivationRecord::new(key.clone(), rule.clone());
                for fact in record.dependent_facts() {
                    state.subscriptions.acquire(fact);
                }
                state.records.insert(key.clone(), record);
                keys.push(key);
            }
        }

        let static_facts: BTreeSet<String> = compiled
            .iter()
            .flat_map(CompiledRuleset::static_facts)
            .collect();
        for fact in &static_facts {
            self.ensure_watching(state, fact);
        }

        let ruleset_ids: Vec<String> = compiled.iter().map(|r| r.id.clone()).collect();
        info!(
            scope = %scope,
            rulesets = ?ruleset_ids,
            rules = keys.len(),
            "作用域已启用"
        );
        self.publish(EngineEvent::ScopeEnabled {
            scope: scope.clone(),
            ruleset_ids: ruleset_ids.clone(),
            rule_count: keys.len(),
        });
        state.scopes.push(EnabledScope {
            scope,
            ruleset_ids,
            keys: keys.clone(),
        });

        self.evaluate_records(state, &keys).await;
        Ok(())
    }

    /// 停用作用域，返回撤销了动作的规则数；作用域未启用时返回 None
    async fn disable_locked(&self, state: &mut EngineState, scope: &Scope) -> Option<usize> {
        let index = state.scope_index(scope)?;
        let enabled = state.scopes.remove(index);
        let handlers = self.handlers.snapshot();
        let mut reverted = 0;

        for key in enabled.keys.iter().rev() {
            let Some(record) = state.records.remove(key) else {
                continue;
            };
            for fact in record.dependent_facts() {
                state.subscriptions.release(fact);
            }

            if record.is_matched() {
                reverted += 1;
                let rule = &record.rule.rule;
                let failures = self
                    .dispatcher
                    .revert(&handlers, &rule.actions, scope, &rule.id)
                    .await;
                self.report_failures(key, failures);
            }
        }

        info!(
            scope = %scope,
            rulesets = ?enabled.ruleset_ids,
            reverted,
            "作用域已停用"
        );
        self.publish(EngineEvent::ScopeDisabled {
            scope: scope.clone(),
            reverted,
        });
        Some(reverted)
    }
}

async fn run_dispatch_loop(inner: Weak<Inner>, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match command {
            Command::FactChanged(fact) => {
                let outcome = AssertUnwindSafe(inner.handle_fact_change(&fact))
                    .catch_unwind()
                    .await;
                if let Err(payload) = outcome {
                    let message = panic_message(payload.as_ref());
                    error!(fact = %fact, panic = %message, "事实变化处理 panic，继续处理后续变化");
                    inner.publish(EngineEvent::DispatchFailed { fact, message });
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("事实变化分发任务已退出");
}

/// 规则引擎
///
/// 克隆开销很小，所有克隆共享同一个实例。必须在 tokio 运行时内构造。
#[derive(Clone)]
pub struct RulesEngine {
    inner: Arc<Inner>,
}

impl RulesEngine {
    /// 创建引擎并注册内置操作符
    pub fn new(config: RulesEngineConfig) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_buffer.max(1));

        let inner = Arc::new(Inner {
            facts: Arc::new(FactStore::new(
                config.fact_default_delay(),
                config.source_retry.policy(),
            )),
            operators: OperatorRegistry::with_defaults(),
            handlers: ActionHandlerRegistry::new(),
            evaluator: if config.trace_evaluations {
                ConditionEvaluator::new().with_trace()
            } else {
                ConditionEvaluator::new()
            },
            dispatcher: ActionDispatcher::new(config.dry_run),
            state: Mutex::new(EngineState::new(config.max_condition_depth)),
            commands,
            events,
            shutdown: AtomicBool::new(false),
            dispatch_task: parking_lot::Mutex::new(None),
            config,
        });

        let task = tokio::spawn(run_dispatch_loop(Arc::downgrade(&inner), receiver));
        *inner.dispatch_task.lock() = Some(task);

        info!(
            instance = %inner.config.instance_name,
            dry_run = inner.config.dry_run,
            operators = inner.operators.len(),
            "规则引擎已创建"
        );
        Self { inner }
    }

    /// 使用默认配置创建
    pub fn with_defaults() -> Self {
        Self::new(RulesEngineConfig::default())
    }

    pub fn config(&self) -> &RulesEngineConfig {
        &self.inner.config
    }

    // ==================== 事实 ====================

    /// 注册或覆盖事实
    ///
    /// 已被引擎订阅的事实（包括启用时尚未注册的）立即在后台重新创建事实流，
    /// 依赖规则随后重新评估；未被订阅的事实保持惰性，首次被引用时才创建。
    #[instrument(skip(self, facts), fields(count = facts.len()))]
    pub async fn upsert_facts(&self, facts: Vec<Fact>) -> Result<()> {
        self.inner.ensure_running()?;

        let names: Vec<String> = facts.iter().map(|f| f.name().to_string()).collect();
        let overridden = self.inner.facts.upsert(facts);
        if !overridden.is_empty() {
            info!(facts = ?overridden, "已创建的事实被覆盖");
        }

        let mut state = self.inner.state.lock().await;
        for name in &names {
            if state.subscriptions.is_subscribed(name) {
                self.inner.watch_fact(&mut state, name);
                let _ = self.inner.commands.send(Command::FactChanged(name.clone()));
            }
        }
        Ok(())
    }

    /// 注册一个事实提供者的全部事实
    pub async fn register_facts_provider(&self, provider: &dyn FactsProvider) -> Result<()> {
        self.upsert_facts(provider.facts()).await
    }

    /// 获取或创建事实流
    pub async fn retrieve_or_create_fact_stream(&self, name: &str) -> Result<SharedStream> {
        self.inner.ensure_running()?;
        let stream = self.inner.facts.retrieve_or_create(name).await?;
        // 引擎对该事实的订阅可能此前创建失败，交给分发任务补挂
        let _ = self
            .inner
            .commands
            .send(Command::FactChanged(name.to_string()));
        Ok(stream)
    }

    /// 事实最新缓存值（不触发创建）
    pub fn fact_value(&self, name: &str) -> Option<Value> {
        self.inner.facts.fact_value(name)
    }

    pub fn registered_fact_names(&self) -> Vec<String> {
        self.inner.facts.names()
    }

    // ==================== 操作符 ====================

    /// 注册或覆盖操作符，对之后的评估生效
    pub fn upsert_operators(&self, operators: Vec<Operator>) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.operators.upsert_operators(operators);
        Ok(())
    }

    pub fn operator_names(&self) -> Vec<String> {
        self.inner.operators.names()
    }

    // ==================== 动作处理器 ====================

    pub fn register_action_handlers(&self, handlers: Vec<Arc<dyn ActionHandler>>) -> Result<()> {
        self.inner.ensure_running()?;
        self.inner.handlers.register(handlers);
        Ok(())
    }

    /// 按实例身份注销处理器，返回移除数量
    pub fn unregister_action_handlers(&self, handlers: &[Arc<dyn ActionHandler>]) -> Result<usize> {
        self.inner.ensure_running()?;
        Ok(self.inner.handlers.unregister(handlers))
    }

    // ==================== 作用域 ====================

    /// 为作用域启用单个规则集
    pub async fn enable_ruleset_for(&self, scope: impl Into<Scope>, ruleset: Ruleset) -> Result<()> {
        self.enable_rulesets_for(scope, vec![ruleset]).await
    }

    /// 为作用域启用一组规则集
    ///
    /// 作用域已启用时按替换语义处理：先停用（撤销已匹配规则的动作）再启用。
    /// 规则集结构错误在此直接返回，已启用的作用域保持不变。
    #[instrument(skip(self, scope, rulesets), fields(scope = tracing::field::Empty))]
    pub async fn enable_rulesets_for(
        &self,
        scope: impl Into<Scope>,
        rulesets: Vec<Ruleset>,
    ) -> Result<()> {
        self.inner.ensure_running()?;
        let scope = scope.into();
        tracing::Span::current().record("scope", scope.as_str());

        let mut state = self.inner.state.lock().await;
        self.inner.enable_locked(&mut state, scope, rulesets).await
    }

    /// 停用作用域
    ///
    /// 处于 matched 的规则按启用逆序撤销动作，随后释放该作用域独有的事实订阅。
    #[instrument(skip(self, scope), fields(scope = tracing::field::Empty))]
    pub async fn disable_ruleset_for(&self, scope: impl Into<Scope>) -> Result<()> {
        self.inner.ensure_running()?;
        let scope = scope.into();
        tracing::Span::current().record("scope", scope.as_str());

        let mut state = self.inner.state.lock().await;
        self.inner
            .disable_locked(&mut state, &scope)
            .await
            .map(|_| ())
            .ok_or_else(|| RuleError::ScopeNotEnabled(scope.to_string()))
    }

    pub async fn is_enabled(&self, scope: &Scope) -> bool {
        self.inner.state.lock().await.scope_index(scope).is_some()
    }

    /// 某条规则当前的激活状态
    pub async fn activation_state(
        &self,
        scope: &Scope,
        ruleset_id: &str,
        rule_id: &str,
    ) -> Option<ActivationState> {
        let key = RecordKey {
            scope: scope.clone(),
            ruleset_id: ruleset_id.to_string(),
            rule_id: rule_id.to_string(),
        };
        self.inner
            .state
            .lock()
            .await
            .records
            .get(&key)
            .map(|r| r.state())
    }

    // ==================== 观察 ====================

    /// 对当前事实值做一次无副作用的评估
    pub fn evaluate(&self, node: &ConditionNode) -> EvaluationResult {
        self.inner
            .evaluator
            .evaluate(node, self.inner.facts.as_ref(), &self.inner.operators.snapshot())
    }

    /// 订阅引擎事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub async fn stats(&self) -> EngineStats {
        let state = self.inner.state.lock().await;
        EngineStats {
            registered_facts: self.inner.facts.len(),
            live_fact_streams: self.inner.facts.live_streams(),
            fact_subscriptions: state.subscriptions.len(),
            operators: self.inner.operators.len(),
            action_handlers: self.inner.handlers.len(),
            enabled_scopes: state.scopes.len(),
            activation_records: state.records.len(),
            matched_records: state.records.values().filter(|r| r.is_matched()).count(),
        }
    }

    /// 等待调用前已排队的事实变化全部处理完成
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.inner.commands.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// 关闭引擎
    ///
    /// 按启用逆序停用全部作用域（撤销已匹配规则的动作），停止事实流和分发任务。
    /// 关闭后修改类调用返回 `EngineShutdown`。
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return Err(RuleError::EngineShutdown);
        }

        {
            let mut state = self.inner.state.lock().await;
            let scopes: Vec<Scope> = state.scopes.iter().rev().map(|s| s.scope.clone()).collect();
            for scope in scopes {
                self.inner.disable_locked(&mut state, &scope).await;
            }
            state.subscriptions.clear();
        }

        self.inner.facts.shutdown();
        if let Some(task) = self.inner.dispatch_task.lock().take() {
            task.abort();
        }

        info!(instance = %self.inner.config.instance_name, "规则引擎已关闭");
        Ok(())
    }
}
