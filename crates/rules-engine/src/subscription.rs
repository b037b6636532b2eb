//! 引擎对事实的订阅
//!
//! 每个被订阅的事实至多一个监听任务：先在评估锁之外创建事实流（可能等待事实源打开和重试），
//! 创建完成后补发一次变化通知，之后把事实流的每次变更送入引擎的分发队列。
//! 订阅按依赖该事实的激活记录计数，计数归零时中止监听任务，进行中的创建随之取消；
//! 事实本身的 pump 不受影响，其他订阅者继续共享同一事实流。

use crate::engine::Command;
use crate::fact::FactStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct Subscription {
    refcount: usize,
    watcher: Option<JoinHandle<()>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

#[derive(Default)]
pub(crate) struct FactSubscriptions {
    entries: HashMap<String, Subscription>,
}

impl FactSubscriptions {
    /// 增加引用，首次订阅返回 true
    pub(crate) fn acquire(&mut self, fact: &str) -> bool {
        match self.entries.get_mut(fact) {
            Some(subscription) => {
                subscription.refcount += 1;
                false
            }
            None => {
                self.entries.insert(
                    fact.to_string(),
                    Subscription {
                        refcount: 1,
                        watcher: None,
                    },
                );
                true
            }
        }
    }

    /// 减少引用，计数归零时移除订阅并中止监听任务，返回是否已移除
    pub(crate) fn release(&mut self, fact: &str) -> bool {
        let Some(subscription) = self.entries.get_mut(fact) else {
            return false;
        };
        subscription.refcount = subscription.refcount.saturating_sub(1);
        if subscription.refcount > 0 {
            return false;
        }
        self.entries.remove(fact);
        debug!(fact, "事实订阅已释放");
        true
    }

    pub(crate) fn is_subscribed(&self, fact: &str) -> bool {
        self.entries.contains_key(fact)
    }

    /// 监听任务是否仍在运行（创建中或转发中）
    pub(crate) fn is_watching(&self, fact: &str) -> bool {
        self.entries
            .get(fact)
            .and_then(|s| s.watcher.as_ref())
            .is_some_and(|w| !w.is_finished())
    }

    /// 挂上新的监听任务，替换并中止旧任务；事实未被订阅时直接中止新任务
    pub(crate) fn watch(&mut self, fact: &str, watcher: JoinHandle<()>) {
        match self.entries.get_mut(fact) {
            Some(subscription) => {
                if let Some(old) = subscription.watcher.replace(watcher) {
                    old.abort();
                }
            }
            None => watcher.abort(),
        }
    }

    pub(crate) fn refcount(&self, fact: &str) -> usize {
        self.entries.get(fact).map_or(0, |s| s.refcount)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// 启动监听任务
///
/// 创建失败时任务结束，事实保持未产出状态；下一次访问该事实时由引擎重新启动监听。
pub(crate) fn spawn_watcher(
    facts: Arc<FactStore>,
    fact: String,
    commands: mpsc::UnboundedSender<Command>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = match facts.retrieve_or_create(&fact).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(fact = %fact, error = %err, "事实流创建失败，依赖规则保持 unknown");
                return;
            }
        };
        debug!(fact = %fact, "事实订阅已建立");

        // 创建期间写入的值可能早于本任务订阅，补发一次
        if commands.send(Command::FactChanged(fact.clone())).is_err() {
            return;
        }
        while stream.changed().await.is_ok() {
            if commands.send(Command::FactChanged(fact.clone())).is_err() {
                break;
            }
        }
        debug!(fact = %fact, "事实监听任务已退出");
    })
}
