use crate::error::{Result, RuleError};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde_json::Value;
use tokio::sync::watch;

/// 共享事实流
///
/// 底层为事实的持久 watch 通道：晚到的订阅者立即看到最新值，
/// `None` 表示事实流尚未产出任何值（或刚被覆盖）。
#[derive(Debug, Clone)]
pub struct SharedStream {
    name: String,
    receiver: watch::Receiver<Option<Value>>,
}

impl SharedStream {
    pub(crate) fn new(name: impl Into<String>, receiver: watch::Receiver<Option<Value>>) -> Self {
        Self {
            name: name.into(),
            receiver,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 最新值，尚未产出时为 `None`
    pub fn current(&self) -> Option<Value> {
        self.receiver.borrow().clone()
    }

    /// 等待下一次变更并返回变更后的值
    pub async fn changed(&mut self) -> Result<Option<Value>> {
        self.receiver
            .changed()
            .await
            .map_err(|_| RuleError::EngineShutdown)?;
        Ok(self.receiver.borrow_and_update().clone())
    }

    /// 底层 watch 接收端
    pub fn receiver(&self) -> watch::Receiver<Option<Value>> {
        self.receiver.clone()
    }

    /// 转换为值流：先重放最新值（若有），之后发出每次变更，跳过未产出状态
    pub fn into_stream(self) -> BoxStream<'static, Value> {
        let mut receiver = self.receiver;
        receiver.mark_changed();
        stream::unfold(receiver, |mut receiver| async move {
            receiver.changed().await.ok()?;
            let value = receiver.borrow_and_update().clone();
            Some((value, receiver))
        })
        .filter_map(|value| async move { value })
        .boxed()
    }
}
