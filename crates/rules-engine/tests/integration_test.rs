//! 规则引擎集成测试
//!
//! 覆盖作用域启用/停用、事实变化驱动的重新评估、动作对称撤销和覆盖语义的完整工作流。

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use mockall::mock;
use mockall::predicate::eq;
use parking_lot::Mutex;
use rules_engine::{
    ActionHandler, ActionRef, ActivationState, ConditionNode, EngineEvent, Fact, FactsProvider,
    Operator, Result, Rule, RuleError, Ruleset, RulesEngine, Scope, Verdict,
};
use rules_shared::config::RulesEngineConfig;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

mock! {
    pub Handler {}

    #[async_trait]
    impl ActionHandler for Handler {
        fn name(&self) -> &str;
        async fn apply(&self, parameters: &Value, scope: &Scope) -> Result<()>;
        async fn revert(&self, parameters: &Value, scope: &Scope) -> Result<()>;
    }
}

type CallLog = Arc<Mutex<Vec<String>>>;

/// 把每次调用记录为 "phase:scope:parameters" 的处理器
fn logging_handler(name: &str, log: CallLog) -> MockHandler {
    let mut handler = MockHandler::new();
    handler.expect_name().return_const(name.to_string());

    let apply_log = log.clone();
    handler.expect_apply().returning(move |params, scope| {
        apply_log.lock().push(format!("apply:{}:{}", scope, params));
        Ok(())
    });
    handler.expect_revert().returning(move |params, scope| {
        log.lock().push(format!("revert:{}:{}", scope, params));
        Ok(())
    });
    handler
}

fn as_handler(handler: MockHandler) -> Arc<dyn ActionHandler> {
    Arc::new(handler)
}

async fn settle(engine: &RulesEngine) {
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.flush().await;
    }
}

fn summer_ruleset() -> Ruleset {
    Ruleset::new(
        "campaign",
        vec![
            Rule::new("r1", ConditionNode::leaf("isSummer", "isTrue"))
                .with_action(ActionRef::new("popup", json!({"msg": "hi"}))),
        ],
    )
}

fn counting_fact(name: &str, opened: Arc<AtomicUsize>, values: watch::Receiver<Value>) -> Fact {
    Fact::from_async(name.to_string(), move || {
        let opened = opened.clone();
        let mut receiver = values.clone();
        async move {
            opened.fetch_add(1, Ordering::SeqCst);
            let first = receiver.borrow_and_update().clone();
            let rest = stream::unfold(receiver, |mut receiver| async move {
                receiver.changed().await.ok()?;
                let value = receiver.borrow_and_update().clone();
                Some((value, receiver))
            });
            Ok(stream::iter(vec![first]).chain(rest).boxed())
        }
    })
}

#[tokio::test]
async fn test_popup_scenario() {
    let engine = RulesEngine::with_defaults();

    let mut popup = MockHandler::new();
    popup.expect_name().return_const("popup".to_string());
    popup
        .expect_apply()
        .with(eq(json!({"msg": "hi"})), eq(Scope::new("S")))
        .times(1)
        .returning(|_, _| Ok(()));
    popup
        .expect_revert()
        .with(eq(json!({"msg": "hi"})), eq(Scope::new("S")))
        .times(1)
        .returning(|_, _| Ok(()));
    assert_ok!(engine.register_action_handlers(vec![as_handler(popup)]));

    let (summer, values) = watch::channel(json!(false));
    assert_ok!(
        engine
            .upsert_facts(vec![Fact::from_watch("isSummer", values)])
            .await
    );

    let scope = Scope::new("S");
    assert_ok!(engine.enable_ruleset_for(scope.clone(), summer_ruleset()).await);
    settle(&engine).await;
    assert_eq!(
        engine.activation_state(&scope, "campaign", "r1").await,
        Some(ActivationState::Unmatched)
    );

    summer.send_replace(json!(true));
    settle(&engine).await;
    assert_eq!(
        engine.activation_state(&scope, "campaign", "r1").await,
        Some(ActivationState::Matched)
    );

    assert_ok!(engine.disable_ruleset_for(scope).await);
}

#[tokio::test]
async fn test_ruleset_from_json() {
    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("popup", log.clone()))]));
    assert_ok!(
        engine
            .upsert_facts(vec![Fact::constant("isSummer", true)])
            .await
    );

    let ruleset = Ruleset::from_json(
        r#"{
            "id": "campaign",
            "rules": [{
                "id": "r1",
                "rootCondition": {"type": "leaf", "fact": "isSummer", "operator": "isTrue"},
                "actions": [{"handlerName": "popup", "parameters": {"msg": "hi"}}]
            }]
        }"#,
    )
    .unwrap();

    assert_ok!(engine.enable_ruleset_for("S", ruleset).await);
    settle(&engine).await;
    assert_eq!(*log.lock(), vec![r#"apply:S:{"msg":"hi"}"#.to_string()]);
}

#[tokio::test]
async fn test_two_scopes_share_fact() {
    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("tick", log.clone()))]));

    let opened = Arc::new(AtomicUsize::new(0));
    let (clock, values) = watch::channel(json!(1));
    assert_ok!(
        engine
            .upsert_facts(vec![counting_fact("clockTick", opened.clone(), values)])
            .await
    );

    let ruleset = Ruleset::new(
        "clock",
        vec![
            Rule::new("ticking", ConditionNode::binary("clockTick", "greaterThan", 0))
                .with_action(ActionRef::new("tick", json!("on"))),
        ],
    );
    assert_ok!(engine.enable_ruleset_for("S1", ruleset.clone()).await);
    settle(&engine).await;
    assert_ok!(engine.enable_ruleset_for("S2", ruleset).await);
    settle(&engine).await;
    assert_eq!(log.lock().len(), 2);

    assert_ok!(engine.disable_ruleset_for("S1").await);
    let stats = engine.stats().await;
    assert_eq!(stats.fact_subscriptions, 1);
    assert_eq!(stats.enabled_scopes, 1);

    // S2 仍然跟随 clockTick 变化
    clock.send_replace(json!(0));
    settle(&engine).await;

    assert_eq!(
        *log.lock(),
        vec![
            r#"apply:S1:"on""#.to_string(),
            r#"apply:S2:"on""#.to_string(),
            r#"revert:S1:"on""#.to_string(),
            r#"revert:S2:"on""#.to_string(),
        ]
    );
    assert_eq!(opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_single_flight_through_engine() {
    let engine = RulesEngine::with_defaults();
    let opened = Arc::new(AtomicUsize::new(0));
    let (_clock, values) = watch::channel(json!(42));
    assert_ok!(
        engine
            .upsert_facts(vec![counting_fact("clockTick", opened.clone(), values)])
            .await
    );

    let calls = (0..16).map(|_| engine.retrieve_or_create_fact_stream("clockTick"));
    let streams = futures::future::join_all(calls).await;
    assert!(streams.iter().all(|s| s.is_ok()));
    assert_eq!(opened.load(Ordering::SeqCst), 1);

    settle(&engine).await;
    assert_eq!(engine.fact_value("clockTick"), Some(json!(42)));
}

#[tokio::test]
async fn test_redundant_emissions_do_not_duplicate_actions() {
    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("banner", log.clone()))]));

    let (cart, values) = watch::channel(json!(150));
    assert_ok!(engine.upsert_facts(vec![Fact::from_watch("cart", values)]).await);

    let ruleset = Ruleset::new(
        "cart",
        vec![
            Rule::new("big-cart", ConditionNode::binary("cart", "greaterThan", 100))
                .with_action(ActionRef::new("banner", json!({"id": 7}))),
        ],
    );
    assert_ok!(engine.enable_ruleset_for("S", ruleset).await);
    settle(&engine).await;

    for amount in [150, 200, 300, 300] {
        cart.send_replace(json!(amount));
        settle(&engine).await;
    }

    assert_eq!(*log.lock(), vec![r#"apply:S:{"id":7}"#.to_string()]);
}

#[tokio::test]
async fn test_disable_reverts_in_reverse_order() {
    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("step", log.clone()))]));
    assert_ok!(
        engine
            .upsert_facts(vec![Fact::constant("isSummer", true)])
            .await
    );

    let rule = Rule::new("r1", ConditionNode::leaf("isSummer", "isTrue"))
        .with_action(ActionRef::new("step", json!(1)))
        .with_action(ActionRef::new("step", json!(2)))
        .with_action(ActionRef::new("step", json!(3)));
    assert_ok!(
        engine
            .enable_ruleset_for("S", Ruleset::new("rs", vec![rule]))
            .await
    );
    settle(&engine).await;
    assert_ok!(engine.disable_ruleset_for("S").await);

    assert_eq!(
        *log.lock(),
        vec![
            "apply:S:1".to_string(),
            "apply:S:2".to_string(),
            "apply:S:3".to_string(),
            "revert:S:3".to_string(),
            "revert:S:2".to_string(),
            "revert:S:1".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_unknown_is_not_unmatched() {
    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("popup", log.clone()))]));
    assert_ok!(
        engine
            .upsert_facts(vec![Fact::from_stream("isSummer", stream::pending::<Value>)])
            .await
    );

    let mut events = engine.subscribe_events();
    let scope = Scope::new("S");
    assert_ok!(engine.enable_ruleset_for(scope.clone(), summer_ruleset()).await);
    settle(&engine).await;

    assert_eq!(
        engine.activation_state(&scope, "campaign", "r1").await,
        Some(ActivationState::Uninitialized)
    );
    assert_ok!(engine.disable_ruleset_for(scope).await);

    let mut saw_unknown = false;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::Transition { .. } => panic!("unexpected transition: {:?}", event),
            EngineEvent::RuleEvaluated { verdict, .. } => {
                assert_eq!(verdict, Verdict::Unknown);
                saw_unknown = true;
            }
            _ => {}
        }
    }
    assert!(saw_unknown);
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn test_operator_override_wins() {
    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("banner", log.clone()))]));

    let (count, values) = watch::channel(json!(20));
    assert_ok!(engine.upsert_facts(vec![Fact::from_watch("count", values)]).await);

    let ruleset = Ruleset::new(
        "rs",
        vec![
            Rule::new("r1", ConditionNode::binary("count", "greaterThan", 10))
                .with_action(ActionRef::new("banner", json!(null))),
        ],
    );
    assert_ok!(engine.enable_ruleset_for("S", ruleset).await);
    settle(&engine).await;
    assert_eq!(log.lock().len(), 1);

    assert_ok!(engine.upsert_operators(vec![Operator::binary("greaterThan", |_, _| false)]));
    count.send_replace(json!(30));
    settle(&engine).await;

    assert_eq!(
        *log.lock(),
        vec!["apply:S:null".to_string(), "revert:S:null".to_string()]
    );
    let dry = engine.evaluate(&ConditionNode::binary("count", "greaterThan", 10));
    assert_eq!(dry.verdict, Verdict::Unmatched);
}

#[tokio::test]
async fn test_fact_override_wins() {
    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("popup", log.clone()))]));

    let first_opened = Arc::new(AtomicUsize::new(0));
    let second_opened = Arc::new(AtomicUsize::new(0));
    let (_first, first_values) = watch::channel(json!(false));
    let (_second, second_values) = watch::channel(json!(true));

    assert_ok!(
        engine
            .upsert_facts(vec![counting_fact("isSummer", first_opened.clone(), first_values)])
            .await
    );
    let scope = Scope::new("S");
    assert_ok!(engine.enable_ruleset_for(scope.clone(), summer_ruleset()).await);
    settle(&engine).await;
    assert_eq!(
        engine.activation_state(&scope, "campaign", "r1").await,
        Some(ActivationState::Unmatched)
    );

    assert_ok!(
        engine
            .upsert_facts(vec![counting_fact("isSummer", second_opened.clone(), second_values)])
            .await
    );
    settle(&engine).await;

    assert_eq!(
        engine.activation_state(&scope, "campaign", "r1").await,
        Some(ActivationState::Matched)
    );
    assert_eq!(*log.lock(), vec![r#"apply:S:{"msg":"hi"}"#.to_string()]);
    assert_eq!(first_opened.load(Ordering::SeqCst), 1);
    assert_eq!(second_opened.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_missing_handler_does_not_block_other_actions() {
    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("popup", log.clone()))]));
    assert_ok!(
        engine
            .upsert_facts(vec![Fact::constant("isSummer", true)])
            .await
    );

    let rule = Rule::new("r1", ConditionNode::leaf("isSummer", "isTrue"))
        .with_action(ActionRef::new("analytics", json!({"event": "summer"})))
        .with_action(ActionRef::new("popup", json!({"msg": "hi"})));
    let mut events = engine.subscribe_events();
    assert_ok!(
        engine
            .enable_ruleset_for("S", Ruleset::new("rs", vec![rule]))
            .await
    );
    settle(&engine).await;

    assert_eq!(*log.lock(), vec![r#"apply:S:{"msg":"hi"}"#.to_string()]);

    let mut missing = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::ActionFailed { failure, .. } = event {
            missing.push(failure.error);
        }
    }
    assert_eq!(
        missing,
        vec![RuleError::ActionHandlerNotFound("analytics".into())]
    );
}

#[tokio::test]
async fn test_failed_source_is_retried_on_next_access() {
    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("popup", log.clone()))]));

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    assert_ok!(
        engine
            .upsert_facts(vec![Fact::from_async("isSummer", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(RuleError::FactSource {
                            fact: "isSummer".into(),
                            message: "连接超时".into(),
                        })
                    } else {
                        Ok(stream::iter(vec![json!(true)]).chain(stream::pending()).boxed())
                    }
                }
            })])
            .await
    );

    let scope = Scope::new("S");
    assert_ok!(engine.enable_ruleset_for(scope.clone(), summer_ruleset()).await);
    settle(&engine).await;
    assert_eq!(
        engine.activation_state(&scope, "campaign", "r1").await,
        Some(ActivationState::Uninitialized)
    );
    assert!(engine.fact_value("isSummer").is_none());
    // 失败后不会自行重试
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    // 宿主再次访问即触发重建，引擎随之补上订阅
    assert_ok!(engine.retrieve_or_create_fact_stream("isSummer").await);
    settle(&engine).await;

    assert_eq!(
        engine.activation_state(&scope, "campaign", "r1").await,
        Some(ActivationState::Matched)
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(log.lock().len(), 1);
}

#[tokio::test]
async fn test_configured_retry_policy() {
    let mut config = RulesEngineConfig::default();
    config.source_retry.max_retries = 2;
    config.source_retry.initial_delay_ms = 1;
    config.source_retry.max_delay_ms = 5;
    let engine = RulesEngine::new(config);

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    assert_ok!(
        engine
            .upsert_facts(vec![Fact::from_async("isSummer", move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(RuleError::FactSource {
                            fact: "isSummer".into(),
                            message: "未就绪".into(),
                        })
                    } else {
                        Ok(stream::iter(vec![json!(true)]).boxed())
                    }
                }
            })])
            .await
    );

    let scope = Scope::new("S");
    assert_ok!(engine.enable_ruleset_for(scope.clone(), summer_ruleset()).await);
    settle(&engine).await;
    assert_eq!(
        engine.activation_state(&scope, "campaign", "r1").await,
        Some(ActivationState::Matched)
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_dry_run_tracks_state_without_side_effects() {
    let config = RulesEngineConfig {
        dry_run: true,
        ..Default::default()
    };
    let engine = RulesEngine::new(config);
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("popup", log.clone()))]));
    assert_ok!(
        engine
            .upsert_facts(vec![Fact::constant("isSummer", true)])
            .await
    );

    let mut events = engine.subscribe_events();
    let scope = Scope::new("S");
    assert_ok!(engine.enable_ruleset_for(scope.clone(), summer_ruleset()).await);
    settle(&engine).await;

    assert_eq!(
        engine.activation_state(&scope, "campaign", "r1").await,
        Some(ActivationState::Matched)
    );
    let mut transitions = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::Transition { .. }) {
            transitions += 1;
        }
    }
    assert_eq!(transitions, 1);
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn test_trace_evaluations_attaches_trace() {
    async fn traces(config: RulesEngineConfig) -> Vec<String> {
        let engine = RulesEngine::new(config);
        assert_ok!(
            engine
                .upsert_facts(vec![Fact::constant("isSummer", true)])
                .await
        );
        let mut events = engine.subscribe_events();
        assert_ok!(engine.enable_ruleset_for("S", summer_ruleset()).await);
        settle(&engine).await;

        let mut lines = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::RuleEvaluated { trace, .. } = event {
                lines.extend(trace);
            }
        }
        lines
    }

    assert!(traces(RulesEngineConfig::default()).await.is_empty());

    let traced = traces(RulesEngineConfig {
        trace_evaluations: true,
        ..Default::default()
    })
    .await;
    assert!(traced.iter().any(|line| line.contains("isSummer isTrue")));
}

#[tokio::test]
async fn test_event_bus_sequence() {
    let engine = RulesEngine::with_defaults();
    assert_ok!(
        engine
            .upsert_facts(vec![Fact::constant("isSummer", true)])
            .await
    );

    settle(&engine).await;

    let mut events = engine.subscribe_events();
    assert_ok!(engine.enable_ruleset_for("S", summer_ruleset()).await);
    settle(&engine).await;
    assert_ok!(engine.disable_ruleset_for("S").await);

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.scope().map(Scope::as_str), Some("S"));
        let kind = match event {
            EngineEvent::ScopeEnabled { .. } => "enabled",
            EngineEvent::ScopeDisabled { reverted, .. } => {
                assert_eq!(reverted, 1);
                "disabled"
            }
            EngineEvent::RuleEvaluated { .. } => "evaluated",
            EngineEvent::Transition { to, .. } => {
                assert_eq!(to, ActivationState::Matched);
                "transition"
            }
            // 未注册 popup 处理器
            EngineEvent::ActionFailed { .. } => "failed",
            EngineEvent::DispatchFailed { .. } => "dispatch_failed",
        };
        if kinds.last() != Some(&kind) {
            kinds.push(kind);
        }
    }
    assert_eq!(kinds.first(), Some(&"enabled"));
    assert_eq!(kinds.last(), Some(&"disabled"));
    assert!(kinds.contains(&"transition"));
    assert!(kinds.contains(&"failed"));
}

#[tokio::test]
async fn test_current_time_is_an_implicit_dependency() {
    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("reminder", log.clone()))]));

    let midnight = 1_767_225_600_000_i64;
    let (clock, now) = watch::channel(json!(midnight));
    assert_ok!(
        engine
            .upsert_facts(vec![
                Fact::from_watch("currentTime", now),
                Fact::constant("deadline", "2026-01-01T00:30:00Z"),
            ])
            .await
    );

    let ruleset = Ruleset::new(
        "reminders",
        vec![
            Rule::new("soon", ConditionNode::binary("deadline", "dateInNextMinutes", 10))
                .with_action(ActionRef::new("reminder", json!("deadline"))),
        ],
    );
    let scope = Scope::new("S");
    assert_ok!(engine.enable_ruleset_for(scope.clone(), ruleset).await);
    settle(&engine).await;
    assert_eq!(
        engine.activation_state(&scope, "reminders", "soon").await,
        Some(ActivationState::Unmatched)
    );

    clock.send_replace(json!(midnight + 25 * 60 * 1000));
    settle(&engine).await;
    assert_eq!(
        engine.activation_state(&scope, "reminders", "soon").await,
        Some(ActivationState::Matched)
    );
    assert_eq!(*log.lock(), vec![r#"apply:S:"deadline""#.to_string()]);
    assert_eq!(engine.stats().await.fact_subscriptions, 2);
}

struct SeasonFacts;

impl FactsProvider for SeasonFacts {
    fn facts(&self) -> Vec<Fact> {
        vec![Fact::constant("isSummer", true), Fact::constant("season", "summer")]
    }
}

#[tokio::test]
async fn test_facts_provider_and_replace_semantics() {
    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("popup", log.clone()))]));
    assert_ok!(engine.register_facts_provider(&SeasonFacts).await);
    assert_eq!(
        engine.registered_fact_names(),
        vec!["isSummer".to_string(), "season".to_string()]
    );

    assert_ok!(engine.enable_ruleset_for("S", summer_ruleset()).await);
    settle(&engine).await;
    // 重复启用同一作用域：先撤销再重新应用，不会产生重复订阅
    assert_ok!(engine.enable_ruleset_for("S", summer_ruleset()).await);
    settle(&engine).await;

    let stats = engine.stats().await;
    assert_eq!(stats.enabled_scopes, 1);
    assert_eq!(stats.activation_records, 1);
    assert_eq!(stats.fact_subscriptions, 1);
    assert_eq!(
        *log.lock(),
        vec![
            r#"apply:S:{"msg":"hi"}"#.to_string(),
            r#"revert:S:{"msg":"hi"}"#.to_string(),
            r#"apply:S:{"msg":"hi"}"#.to_string(),
        ]
    );
}

#[tokio::test]
async fn test_unregister_handler_by_instance() {
    let engine = RulesEngine::with_defaults();
    let first_log: CallLog = Arc::default();
    let second_log: CallLog = Arc::default();
    let first = as_handler(logging_handler("popup", first_log.clone()));
    let second = as_handler(logging_handler("popup", second_log.clone()));
    assert_ok!(engine.register_action_handlers(vec![first.clone(), second]));
    assert_eq!(assert_ok!(engine.unregister_action_handlers(&[first])), 1);

    assert_ok!(
        engine
            .upsert_facts(vec![Fact::constant("isSummer", true)])
            .await
    );
    assert_ok!(engine.enable_ruleset_for("S", summer_ruleset()).await);
    settle(&engine).await;

    assert!(first_log.lock().is_empty());
    assert_eq!(second_log.lock().len(), 1);
}

#[tokio::test]
async fn test_shutdown_reverts_and_rejects_calls() {
    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("popup", log.clone()))]));
    assert_ok!(
        engine
            .upsert_facts(vec![Fact::constant("isSummer", true)])
            .await
    );
    assert_ok!(engine.enable_ruleset_for("S1", summer_ruleset()).await);
    assert_ok!(engine.enable_ruleset_for("S2", summer_ruleset()).await);
    settle(&engine).await;

    assert_ok!(engine.shutdown().await);
    let reverts: Vec<String> = log
        .lock()
        .iter()
        .filter(|call| call.starts_with("revert"))
        .cloned()
        .collect();
    // 按启用逆序停用
    assert_eq!(
        reverts,
        vec![
            r#"revert:S2:{"msg":"hi"}"#.to_string(),
            r#"revert:S1:{"msg":"hi"}"#.to_string(),
        ]
    );

    assert_err!(engine.upsert_facts(vec![Fact::constant("x", 1)]).await);
    assert_err!(engine.retrieve_or_create_fact_stream("isSummer").await);
    assert_eq!(
        engine.disable_ruleset_for("S1").await,
        Err(RuleError::EngineShutdown)
    );
}

/// 打开后一直挂起的事实源；`started` 在 open 开始时置位，open 被取消时 `dropped` 收到错误
fn hanging_fact(
    name: &str,
    started: Arc<AtomicUsize>,
) -> (Fact, tokio::sync::oneshot::Receiver<()>) {
    let (guard_tx, dropped) = tokio::sync::oneshot::channel::<()>();
    let guard = Arc::new(Mutex::new(Some(guard_tx)));
    let fact = Fact::from_async(name.to_string(), move || {
        let guard = guard.lock().take();
        let started = started.clone();
        async move {
            let _guard = guard;
            started.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<Result<futures::stream::BoxStream<'static, Value>>>().await
        }
    });
    (fact, dropped)
}

#[tokio::test]
async fn test_slow_source_does_not_block_other_scopes() {
    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("popup", log.clone()))]));

    let started = Arc::new(AtomicUsize::new(0));
    let (slow, dropped) = hanging_fact("slow", started.clone());
    assert_ok!(
        engine
            .upsert_facts(vec![slow, Fact::constant("isSummer", true)])
            .await
    );

    let slow_ruleset = Ruleset::new(
        "slow",
        vec![Rule::new("r1", ConditionNode::leaf("slow", "isTrue"))],
    );
    let within = Duration::from_secs(1);
    assert_ok!(
        tokio::time::timeout(within, engine.enable_ruleset_for("S1", slow_ruleset))
            .await
            .expect("enable must not wait for the fact source")
    );
    assert_ok!(
        tokio::time::timeout(within, engine.enable_ruleset_for("S2", summer_ruleset()))
            .await
            .expect("unrelated scope must not be blocked")
    );
    settle(&engine).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(*log.lock(), vec![r#"apply:S2:{"msg":"hi"}"#.to_string()]);

    // 停用拥有进行中创建的作用域：立即返回，创建被取消，其他作用域不受影响
    assert_ok!(
        tokio::time::timeout(within, engine.disable_ruleset_for("S1"))
            .await
            .expect("disable must not wait for the fact source")
    );
    assert_err!(
        tokio::time::timeout(within, dropped)
            .await
            .expect("pending open must be cancelled")
    );
    assert_eq!(
        engine.activation_state(&Scope::new("S2"), "campaign", "r1").await,
        Some(ActivationState::Matched)
    );
    let stats = engine.stats().await;
    assert_eq!(stats.fact_subscriptions, 1);
    assert_eq!(stats.live_fact_streams, 1);
}

/// 另一作用域中出错的规则不影响 S2 跟随 flag 变化
async fn assert_other_scope_still_reacts(engine: &RulesEngine, flag: &watch::Sender<Value>, log: &CallLog) {
    let ruleset = Ruleset::new(
        "flag",
        vec![
            Rule::new("r1", ConditionNode::leaf("flag", "isTrue"))
                .with_action(ActionRef::new("popup", json!("flag"))),
        ],
    );
    assert_ok!(engine.enable_ruleset_for("S2", ruleset).await);
    settle(engine).await;

    flag.send_replace(json!(true));
    settle(engine).await;
    assert!(log.lock().contains(&r#"apply:S2:"flag""#.to_string()));
    assert_eq!(
        engine.activation_state(&Scope::new("S2"), "flag", "r1").await,
        Some(ActivationState::Matched)
    );
}

#[tokio::test]
async fn test_overflowing_operand_is_unknown() {
    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("popup", log.clone()))]));

    let (flag, flag_values) = watch::channel(json!(false));
    assert_ok!(
        engine
            .upsert_facts(vec![
                Fact::from_watch("flag", flag_values),
                Fact::constant("deadline", "2026-01-01T00:30:00Z"),
                Fact::constant("currentTime", 1_767_225_600_000_i64),
            ])
            .await
    );

    let mut events = engine.subscribe_events();
    let far = Ruleset::new(
        "far",
        vec![Rule::new(
            "r1",
            ConditionNode::binary("deadline", "dateInNextMinutes", 1e20),
        )],
    );
    assert_ok!(engine.enable_ruleset_for("S1", far).await);
    settle(&engine).await;
    assert_eq!(
        engine.activation_state(&Scope::new("S1"), "far", "r1").await,
        Some(ActivationState::Uninitialized)
    );

    let mut invalid = 0;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::RuleEvaluated { verdict, errors, .. } = event {
            assert_eq!(verdict, Verdict::Unknown);
            invalid += errors.iter().filter(|e| e.code() == "INVALID_OPERAND").count();
        }
    }
    assert!(invalid > 0);

    assert_other_scope_still_reacts(&engine, &flag, &log).await;
}

#[tokio::test]
async fn test_panicking_operator_and_handler_do_not_stop_dispatch() {
    struct Exploding;

    #[async_trait]
    impl ActionHandler for Exploding {
        fn name(&self) -> &str {
            "explode"
        }

        async fn apply(&self, _parameters: &Value, _scope: &Scope) -> Result<()> {
            panic!("handler boom")
        }

        async fn revert(&self, _parameters: &Value, _scope: &Scope) -> Result<()> {
            Ok(())
        }
    }

    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![
        Arc::new(Exploding) as Arc<dyn ActionHandler>,
        as_handler(logging_handler("popup", log.clone())),
    ]));
    assert_ok!(engine.upsert_operators(vec![Operator::unary("explodes", |_| panic!("operator boom"))]));

    let (flag, flag_values) = watch::channel(json!(false));
    let (trigger, trigger_values) = watch::channel(json!(1));
    assert_ok!(
        engine
            .upsert_facts(vec![
                Fact::from_watch("flag", flag_values),
                Fact::from_watch("trigger", trigger_values),
            ])
            .await
    );

    let mut events = engine.subscribe_events();
    let broken = Ruleset::new(
        "broken",
        vec![
            Rule::new("op", ConditionNode::leaf("trigger", "explodes")),
            Rule::new("handler", ConditionNode::binary("trigger", "greaterThan", 0))
                .with_action(ActionRef::new("explode", json!(null)))
                .with_action(ActionRef::new("popup", json!("after"))),
        ],
    );
    assert_ok!(engine.enable_ruleset_for("S1", broken).await);
    settle(&engine).await;

    // 变化再次触发出错的规则
    trigger.send_replace(json!(2));
    settle(&engine).await;

    assert_eq!(
        engine.activation_state(&Scope::new("S1"), "broken", "op").await,
        Some(ActivationState::Uninitialized)
    );
    assert_eq!(
        engine.activation_state(&Scope::new("S1"), "broken", "handler").await,
        Some(ActivationState::Matched)
    );
    // 同一迁移中 panic 之后的动作照常执行
    assert!(log.lock().contains(&r#"apply:S1:"after""#.to_string()));

    let mut operator_panics = 0;
    let mut handler_failures = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::RuleEvaluated { errors, .. } => {
                operator_panics += errors.iter().filter(|e| e.code() == "OPERATOR_PANICKED").count();
            }
            EngineEvent::ActionFailed { failure, .. } => {
                assert_eq!(failure.handler_name, "explode");
                handler_failures += 1;
            }
            _ => {}
        }
    }
    assert!(operator_panics >= 2);
    assert_eq!(handler_failures, 1);

    assert_other_scope_still_reacts(&engine, &flag, &log).await;
}

#[tokio::test]
async fn test_validity_range_gates_rules() {
    let engine = RulesEngine::with_defaults();
    let log: CallLog = Arc::default();
    assert_ok!(engine.register_action_handlers(vec![as_handler(logging_handler("popup", log.clone()))]));
    assert_ok!(
        engine
            .upsert_facts(vec![Fact::constant("isSummer", true)])
            .await
    );

    // 未注册时间事实时按系统时钟判断，过期规则集不会触发动作
    let expired = summer_ruleset().with_validity_range(None, Some(json!("2020-01-01T00:00:00Z")));
    assert_ok!(engine.enable_ruleset_for("old", expired).await);
    settle(&engine).await;
    assert_eq!(
        engine.activation_state(&Scope::new("old"), "campaign", "r1").await,
        Some(ActivationState::Unmatched)
    );
    assert!(log.lock().is_empty());

    let (clock, ticks) = watch::channel(json!(1_772_323_200_000_i64));
    assert_ok!(
        engine
            .upsert_facts(vec![Fact::from_watch("currentTime", ticks)])
            .await
    );
    let seasonal = summer_ruleset()
        .with_validity_range(Some(json!("2026-01-01")), Some(json!("2026-06-30T23:59:59Z")));
    assert_ok!(engine.enable_ruleset_for("S", seasonal).await);
    settle(&engine).await;
    assert_eq!(
        engine.activation_state(&Scope::new("S"), "campaign", "r1").await,
        Some(ActivationState::Matched)
    );

    // 时间推进到有效期之后，已应用的动作被撤销
    clock.send_replace(json!(1_782_864_000_000_i64));
    settle(&engine).await;
    assert_eq!(
        engine.activation_state(&Scope::new("S"), "campaign", "r1").await,
        Some(ActivationState::Unmatched)
    );
    assert_eq!(
        *log.lock(),
        vec![
            r#"apply:S:{"msg":"hi"}"#.to_string(),
            r#"revert:S:{"msg":"hi"}"#.to_string(),
        ]
    );
}
