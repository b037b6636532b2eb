//! 事实存储
//!
//! 每个事实名对应一个持久的 watch 通道和一个创建单元：
//! - 创建单元基于 `tokio::sync::OnceCell`，并发的首次访问只会打开一次事实源，
//!   创建失败时单元保持为空，下次访问重新创建；
//! - 事实源打开后由后台 pump 任务把值写入 watch 通道（相同值去重），
//!   订阅者共享同一通道并能立即读到最新值；
//! - 覆盖事实时保留 watch 通道，停止旧 pump，值重置为未产出并清空创建单元。

use super::stream::SharedStream;
use super::{Fact, FactSource};
use crate::error::{Result, RuleError};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use futures::stream::BoxStream;
use rules_shared::observability::metrics::FACT_SOURCE_CREATIONS_TOTAL;
use rules_shared::retry::{RetryPolicy, retry_with_policy};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{OnceCell, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// 事实的当前状态
#[derive(Debug, Clone, PartialEq)]
pub enum FactState {
    /// 未注册的事实名
    NotRegistered,
    /// 已注册但尚未产出值
    Unset,
    Value(Value),
}

/// 读取事实当前值（不触发创建）
pub trait FactLookup {
    fn lookup(&self, name: &str) -> FactState;
}

impl FactLookup for HashMap<String, Value> {
    fn lookup(&self, name: &str) -> FactState {
        self.get(name)
            .map_or(FactState::NotRegistered, |v| FactState::Value(v.clone()))
    }
}

impl FactLookup for BTreeMap<String, Value> {
    fn lookup(&self, name: &str) -> FactState {
        self.get(name)
            .map_or(FactState::NotRegistered, |v| FactState::Value(v.clone()))
    }
}

impl FactLookup for HashMap<String, Option<Value>> {
    fn lookup(&self, name: &str) -> FactState {
        match self.get(name) {
            None => FactState::NotRegistered,
            Some(None) => FactState::Unset,
            Some(Some(v)) => FactState::Value(v.clone()),
        }
    }
}

struct PumpHandle {
    task: JoinHandle<()>,
}

impl PumpHandle {
    fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct FactEntry {
    source: parking_lot::RwLock<Arc<dyn FactSource>>,
    sender: Arc<watch::Sender<Option<Value>>>,
    /// 每次覆盖或关闭递增，旧 pump 发现代数变化后不再写入
    generation: Arc<AtomicU64>,
    cell: parking_lot::Mutex<Arc<OnceCell<PumpHandle>>>,
}

impl FactEntry {
    fn new(source: Arc<dyn FactSource>) -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            source: parking_lot::RwLock::new(source),
            sender: Arc::new(sender),
            generation: Arc::new(AtomicU64::new(0)),
            cell: parking_lot::Mutex::new(Arc::new(OnceCell::new())),
        }
    }

    fn is_live(&self) -> bool {
        self.cell.lock().initialized()
    }

    fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let old = std::mem::replace(&mut *self.cell.lock(), Arc::new(OnceCell::new()));
        if let Some(pump) = old.get() {
            pump.abort();
        }
    }
}

/// 事实存储
pub struct FactStore {
    entries: DashMap<String, Arc<FactEntry>>,
    default_delay: Option<Duration>,
    retry: RetryPolicy,
}

impl Default for FactStore {
    fn default() -> Self {
        Self::new(None, RetryPolicy::none())
    }
}

impl FactStore {
    pub fn new(default_delay: Option<Duration>, retry: RetryPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            default_delay,
            retry,
        }
    }

    /// 注册或覆盖事实
    ///
    /// 返回被覆盖且此前已创建过事实流的事实名，调用方据此决定是否立即重建。
    pub fn upsert(&self, facts: Vec<Fact>) -> Vec<String> {
        let mut overridden_live = Vec::new();

        for fact in facts {
            let name = fact.name().to_string();
            match self.entries.entry(name.clone()) {
                Entry::Occupied(occupied) => {
                    let entry = Arc::clone(occupied.get());
                    drop(occupied);

                    let was_live = entry.is_live();
                    *entry.source.write() = Arc::clone(fact.source());
                    entry.stop();
                    entry.sender.send_if_modified(|current| current.take().is_some());

                    info!(fact = %name, was_live, "事实定义已覆盖");
                    if was_live {
                        overridden_live.push(name);
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(Arc::new(FactEntry::new(Arc::clone(fact.source()))));
                    debug!(fact = %name, "事实已注册");
                }
            }
        }

        overridden_live
    }

    /// 获取或创建事实流
    ///
    /// 已创建时直接返回共享流；否则打开事实源一次（并发调用等待同一次创建）。
    #[instrument(skip(self))]
    pub async fn retrieve_or_create(&self, name: &str) -> Result<SharedStream> {
        let entry = self
            .entries
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| RuleError::FactNotFound(name.to_string()))?;

        // 先订阅再等待创建，pump 在创建期间发布的首个值会被视为变更
        let receiver = entry.sender.subscribe();
        let cell = Arc::clone(&*entry.cell.lock());
        cell.get_or_try_init(|| self.open(name, &entry)).await?;

        Ok(SharedStream::new(name, receiver))
    }

    async fn open(&self, name: &str, entry: &FactEntry) -> Result<PumpHandle> {
        // 先读代数再读事实源：覆盖先写事实源后递增代数，并发覆盖时旧代数只会让 pump 静默退出
        let generation = entry.generation.load(Ordering::SeqCst);
        let source = Arc::clone(&*entry.source.read());

        let opened = retry_with_policy(
            &self.retry,
            "open_fact_source",
            |_: &RuleError| true,
            || {
                let source = Arc::clone(&source);
                async move { source.open().await }
            },
        )
        .await;

        match opened {
            Ok(values) => {
                metrics::counter!(FACT_SOURCE_CREATIONS_TOTAL, "outcome" => "ok").increment(1);
                info!(fact = %name, "事实流已创建");
                let task = tokio::spawn(pump(
                    name.to_string(),
                    values,
                    Arc::clone(&entry.sender),
                    Arc::clone(&entry.generation),
                    generation,
                    self.default_delay,
                ));
                Ok(PumpHandle { task })
            }
            Err(err) => {
                metrics::counter!(FACT_SOURCE_CREATIONS_TOTAL, "outcome" => "error").increment(1);
                warn!(fact = %name, error = %err, "事实源创建失败，下次访问时重试");
                if matches!(err, RuleError::FactSource { .. }) {
                    Err(err)
                } else {
                    Err(RuleError::FactSource {
                        fact: name.to_string(),
                        message: err.to_string(),
                    })
                }
            }
        }
    }

    /// 最新缓存值（不触发创建）
    pub fn fact_value(&self, name: &str) -> Option<Value> {
        self.entries
            .get(name)
            .and_then(|entry| entry.sender.borrow().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// 已注册的事实名（排序）
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 事实流是否已创建且未被覆盖
    pub fn is_live(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|e| e.value().is_live())
    }

    /// 已创建事实流的数量
    pub fn live_streams(&self) -> usize {
        self.entries.iter().filter(|e| e.value().is_live()).count()
    }

    /// 停止全部 pump，已缓存的值保留
    pub fn shutdown(&self) {
        for entry in self.entries.iter() {
            entry.value().stop();
        }
        info!(facts = self.entries.len(), "事实存储已关闭");
    }
}

impl FactLookup for FactStore {
    fn lookup(&self, name: &str) -> FactState {
        match self.entries.get(name) {
            None => FactState::NotRegistered,
            Some(entry) => match entry.sender.borrow().clone() {
                Some(value) => FactState::Value(value),
                None => FactState::Unset,
            },
        }
    }
}

/// 把事实源的值写入 watch 通道，相同值不重复发布
async fn pump(
    name: String,
    mut values: BoxStream<'static, Value>,
    sender: Arc<watch::Sender<Option<Value>>>,
    generation: Arc<AtomicU64>,
    own_generation: u64,
    default_delay: Option<Duration>,
) {
    let publish = |value: Value| -> bool {
        if generation.load(Ordering::SeqCst) != own_generation {
            return false;
        }
        sender.send_if_modified(|current| {
            if current.as_ref() == Some(&value) {
                false
            } else {
                *current = Some(value);
                true
            }
        });
        true
    };

    if let Some(delay) = default_delay {
        tokio::select! {
            first = values.next() => match first {
                Some(value) => {
                    if !publish(value) {
                        return;
                    }
                }
                None => return,
            },
            _ = tokio::time::sleep(delay) => {
                if generation.load(Ordering::SeqCst) == own_generation {
                    sender.send_if_modified(|current| {
                        if current.is_none() {
                            *current = Some(Value::Null);
                            true
                        } else {
                            false
                        }
                    });
                    debug!(fact = %name, "事实在默认延迟内未产出值，发布 null");
                }
            }
        }
    }

    while let Some(value) = values.next().await {
        if !publish(value) {
            return;
        }
    }

    debug!(fact = %name, "事实源已结束，保留最新值");
}
