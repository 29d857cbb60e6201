//! 广播底座（backplane）抽象 - 多进程扇出的共享 Pub/Sub 设施
//!
//! 底座是注入式能力而非隐藏全局量：每次 publish/subscribe 前检查
//! `available()`，不可用时广播退化为单进程本地直投（受支持的降级
//! 模式，不是错误状态）。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{MetaSyncError, Result};
use crate::protocol::PushMessage;

/// 订阅句柄：guard 负责退订，receiver 承载频道消息
pub struct BackplaneSubscription {
    pub guard: SubscriptionGuard,
    pub receiver: mpsc::UnboundedReceiver<PushMessage>,
}

/// drop 即退订（与「返回 unsubscribe 回调」等价的 RAII 形式）
pub struct SubscriptionGuard(Option<Box<dyn FnOnce() + Send + Sync>>);

impl SubscriptionGuard {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(unsubscribe)))
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.0.take() {
            unsubscribe();
        }
    }
}

/// 跨进程广播底座
#[async_trait]
pub trait Backplane: Send + Sync {
    /// 底座当前是否可用
    fn available(&self) -> bool;

    /// 向频道发布一条推送帧
    async fn publish(&self, channel: &str, message: PushMessage) -> Result<()>;

    /// 订阅频道；每个频道至多由注册表持有一个订阅
    async fn subscribe(&self, channel: &str) -> Result<BackplaneSubscription>;
}

type SubscriberMap = HashMap<String, Vec<(u64, mpsc::UnboundedSender<PushMessage>)>>;

/// 进程内存实现：单进程部署与测试共用
///
/// 语义对齐外部 Pub/Sub：发布到无人订阅的频道不是错误。
pub struct MemoryBackplane {
    available: AtomicBool,
    next_id: AtomicU64,
    subscribers: Arc<Mutex<SubscriberMap>>,
}

impl MemoryBackplane {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 切换可用状态（模拟底座上线/掉线）
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 某频道当前的订阅数（不变式：注册表侧恒为 0 或 1）
    pub fn subscription_count(&self, channel: &str) -> usize {
        self.subscribers
            .lock()
            .get(channel)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

impl Default for MemoryBackplane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backplane for MemoryBackplane {
    fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn publish(&self, channel: &str, message: PushMessage) -> Result<()> {
        if !self.available() {
            return Err(MetaSyncError::Transport("广播底座不可用".to_string()));
        }
        let subscribers = self.subscribers.lock();
        if let Some(subs) = subscribers.get(channel) {
            for (id, sender) in subs {
                if sender.send(message.clone()).is_err() {
                    debug!("底座订阅 {} 已关闭，跳过投递", id);
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BackplaneSubscription> {
        if !self.available() {
            return Err(MetaSyncError::Transport("广播底座不可用".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));

        let subscribers = Arc::clone(&self.subscribers);
        let channel_name = channel.to_string();
        let guard = SubscriptionGuard::new(move || {
            let mut map = subscribers.lock();
            if let Some(subs) = map.get_mut(&channel_name) {
                subs.retain(|(sub_id, _)| *sub_id != id);
                if subs.is_empty() {
                    map.remove(&channel_name);
                }
            }
        });

        Ok(BackplaneSubscription { guard, receiver: rx })
    }
}
