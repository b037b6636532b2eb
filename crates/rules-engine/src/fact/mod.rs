//! 事实定义与事实源
//!
//! 事实是按名称注册的、惰性创建、可共享的值源。事实源只在首次被引用时打开一次，
//! 之后所有订阅者共享同一条"重放最新值"的流，见 [`FactStore`]。

mod store;
mod stream;

pub use store::{FactLookup, FactState, FactStore};
pub use stream::SharedStream;

use crate::error::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self as futures_stream, BoxStream};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// 事实源
///
/// `open` 每次调用都应返回一条新的值流；引擎保证同一事实在被覆盖或引擎关闭前只调用一次。
#[async_trait]
pub trait FactSource: Send + Sync {
    async fn open(&self) -> Result<BoxStream<'static, Value>>;
}

/// 事实提供者
///
/// 按功能模块组织的一组事实，一次性注册到引擎。
pub trait FactsProvider: Send + Sync {
    fn facts(&self) -> Vec<Fact>;
}

/// 事实定义
#[derive(Clone)]
pub struct Fact {
    name: String,
    source: Arc<dyn FactSource>,
}

impl fmt::Debug for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fact").field("name", &self.name).finish()
    }
}

impl Fact {
    pub fn new(name: impl Into<String>, source: Arc<dyn FactSource>) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }

    /// 常量事实
    pub fn constant(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(name, Arc::new(ConstantSource(value.into())))
    }

    /// 由 watch 通道驱动的事实，先发布当前值，之后跟随每次变更
    pub fn from_watch(name: impl Into<String>, receiver: watch::Receiver<Value>) -> Self {
        Self::new(name, Arc::new(WatchSource(receiver)))
    }

    /// 由流工厂驱动的事实
    pub fn from_stream<F, S>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: futures::Stream<Item = Value> + Send + 'static,
    {
        Self::new(name, Arc::new(StreamSource(factory)))
    }

    /// 由异步可失败工厂驱动的事实
    pub fn from_async<F, Fut>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<BoxStream<'static, Value>>> + Send + 'static,
    {
        Self::new(name, Arc::new(AsyncSource(factory)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Arc<dyn FactSource> {
        &self.source
    }
}

struct ConstantSource(Value);

#[async_trait]
impl FactSource for ConstantSource {
    async fn open(&self) -> Result<BoxStream<'static, Value>> {
        Ok(futures_stream::once(futures::future::ready(self.0.clone())).boxed())
    }
}

struct WatchSource(watch::Receiver<Value>);

#[async_trait]
impl FactSource for WatchSource {
    async fn open(&self) -> Result<BoxStream<'static, Value>> {
        let receiver = self.0.clone();
        Ok(futures_stream::unfold((receiver, true), |(mut receiver, first)| async move {
            if !first {
                receiver.changed().await.ok()?;
            }
            let value = receiver.borrow_and_update().clone();
            Some((value, (receiver, false)))
        })
        .boxed())
    }
}

struct StreamSource<F>(F);

#[async_trait]
impl<F, S> FactSource for StreamSource<F>
where
    F: Fn() -> S + Send + Sync + 'static,
    S: futures::Stream<Item = Value> + Send + 'static,
{
    async fn open(&self) -> Result<BoxStream<'static, Value>> {
        Ok((self.0)().boxed())
    }
}

struct AsyncSource<F>(F);

#[async_trait]
impl<F, Fut> FactSource for AsyncSource<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BoxStream<'static, Value>>> + Send + 'static,
{
    async fn open(&self) -> Result<BoxStream<'static, Value>> {
        (self.0)().await
    }
}
