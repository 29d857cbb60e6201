//! 频道注册表 - (workspace, base) → 逻辑频道的生命周期管理
//!
//! 不变式：
//! - 频道存在 ⇔ 成员集非空（首个订阅创建，末位退订销毁）
//! - 底座可用时，每个频道恰好持有一个上游订阅；释放先于遗忘
//! - 单个频道的成员变更与开/关决策互斥；扇出不打乱单连接内的接收顺序

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MetaSyncError, Result};
use crate::protocol::PushMessage;
use super::backplane::{Backplane, BackplaneSubscription, SubscriptionGuard};

pub type ConnectionId = String;

struct Channel {
    members: HashMap<ConnectionId, UnboundedSender<PushMessage>>,
    /// 上游底座订阅：guard 退订，task 为扇出循环
    backplane_sub: Option<(SubscriptionGuard, JoinHandle<()>)>,
}

impl Channel {
    fn new() -> Self {
        Self {
            members: HashMap::new(),
            backplane_sub: None,
        }
    }

    fn deliver(&self, message: &PushMessage) {
        for (conn_id, sender) in &self.members {
            if sender.send(message.clone()).is_err() {
                debug!("连接 {} 接收端已关闭，待断开清理", conn_id);
            }
        }
    }
}

/// 频道注册表
pub struct ChannelRegistry {
    backplane: Option<Arc<dyn Backplane>>,
    channels: Arc<RwLock<HashMap<String, Channel>>>,
}

impl ChannelRegistry {
    pub fn new(backplane: Option<Arc<dyn Backplane>>) -> Self {
        Self {
            backplane,
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn backplane(&self) -> Option<&Arc<dyn Backplane>> {
        self.backplane.as_ref()
    }

    /// 底座是否可用（未配置视为不可用，走本地直投）
    pub fn backplane_available(&self) -> bool {
        self.backplane.as_ref().map_or(false, |b| b.available())
    }

    /// 将连接加入频道；首个成员触发创建，并按需打开唯一的上游订阅
    pub async fn join(
        &self,
        channel: &str,
        conn_id: &ConnectionId,
        sender: UnboundedSender<PushMessage>,
    ) -> Result<()> {
        let mut channels = self.channels.write().await;
        let entry = channels
            .entry(channel.to_string())
            .or_insert_with(Channel::new);
        entry.members.insert(conn_id.clone(), sender);

        if entry.backplane_sub.is_some() {
            return Ok(());
        }
        let Some(backplane) = self.backplane.as_ref().filter(|b| b.available()) else {
            return Ok(());
        };
        match backplane.subscribe(channel).await {
            Ok(sub) => {
                let BackplaneSubscription {
                    guard,
                    mut receiver,
                } = sub;
                let fan_out = Arc::clone(&self.channels);
                let name = channel.to_string();
                let task = tokio::spawn(async move {
                    // 上游每来一帧，扇出给频道当前的全部本地成员
                    while let Some(message) = receiver.recv().await {
                        let channels = fan_out.read().await;
                        match channels.get(&name) {
                            Some(ch) => ch.deliver(&message),
                            None => break,
                        }
                    }
                });
                entry.backplane_sub = Some((guard, task));
                info!("频道 {} 已打开底座订阅", channel);
                Ok(())
            }
            Err(e) => {
                // 订阅失败回滚本次加入，频道若因此空了则一并回收
                entry.members.remove(conn_id);
                let emptied = entry.members.is_empty();
                if emptied {
                    channels.remove(channel);
                }
                Err(MetaSyncError::Subscription(format!(
                    "打开底座订阅失败: {}",
                    e
                )))
            }
        }
    }

    /// 将连接移出频道；末位成员离开时先释放上游订阅再遗忘频道
    pub async fn leave(&self, channel: &str, conn_id: &ConnectionId) {
        let mut channels = self.channels.write().await;
        let emptied = match channels.get_mut(channel) {
            None => return,
            Some(ch) => {
                ch.members.remove(conn_id);
                if ch.members.is_empty() {
                    if let Some((guard, task)) = ch.backplane_sub.take() {
                        drop(guard);
                        task.abort();
                        info!("频道 {} 底座订阅已释放", channel);
                    }
                    true
                } else {
                    false
                }
            }
        };
        if emptied {
            channels.remove(channel);
            debug!("频道 {} 成员清空，已销毁", channel);
        }
    }

    /// 本地直投：把一帧送达频道的全部本地成员（底座缺席时的广播路径）
    pub async fn deliver_local(&self, channel: &str, message: &PushMessage) {
        let channels = self.channels.read().await;
        match channels.get(channel) {
            Some(ch) => ch.deliver(message),
            None => debug!("频道 {} 无本地成员，丢弃帧", channel),
        }
    }

    pub async fn member_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map(|ch| ch.members.len())
            .unwrap_or(0)
    }

    /// 该频道当前是否持有上游底座订阅
    pub async fn has_backplane_subscription(&self, channel: &str) -> bool {
        self.channels
            .read()
            .await
            .get(channel)
            .map(|ch| ch.backplane_sub.is_some())
            .unwrap_or(false)
    }

    /// 释放全部频道（服务停机）
    pub async fn shutdown(&self) {
        let mut channels = self.channels.write().await;
        for (name, mut ch) in channels.drain() {
            if let Some((guard, task)) = ch.backplane_sub.take() {
                drop(guard);
                task.abort();
                warn!("停机释放频道 {} 的底座订阅", name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{channel_name, ChangeEvent, EventTarget, MetaOperation, MetaTable};
    use crate::server::backplane::MemoryBackplane;
    use chrono::Utc;
    use tokio::sync::mpsc;

    fn push(event_id: u64) -> PushMessage {
        PushMessage::from_event(&ChangeEvent {
            op: MetaOperation::Insert,
            target: EventTarget::Known(MetaTable::Columns),
            payload: serde_json::json!({"id": event_id}),
            event_id,
            workspace_id: "ws1".to_string(),
            base_id: "b1".to_string(),
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_backplane_subscription_opened_once_per_channel() {
        let backplane = Arc::new(MemoryBackplane::new());
        let registry = ChannelRegistry::new(Some(backplane.clone()));
        let channel = channel_name("ws1", "b1");

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        registry.join(&channel, &"c1".to_string(), tx1).await.unwrap();
        registry.join(&channel, &"c2".to_string(), tx2).await.unwrap();

        // 两个成员，上游订阅仍只有一个
        assert_eq!(registry.member_count(&channel).await, 2);
        assert_eq!(backplane.subscription_count(&channel), 1);
        assert!(registry.has_backplane_subscription(&channel).await);
    }

    #[tokio::test]
    async fn test_last_member_leave_releases_subscription() {
        let backplane = Arc::new(MemoryBackplane::new());
        let registry = ChannelRegistry::new(Some(backplane.clone()));
        let channel = channel_name("ws1", "b1");

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        registry.join(&channel, &"c1".to_string(), tx1).await.unwrap();
        registry.join(&channel, &"c2".to_string(), tx2).await.unwrap();

        registry.leave(&channel, &"c1".to_string()).await;
        assert_eq!(backplane.subscription_count(&channel), 1);

        registry.leave(&channel, &"c2".to_string()).await;
        // 末位成员离开：订阅释放、频道遗忘，无泄漏
        assert_eq!(backplane.subscription_count(&channel), 0);
        assert_eq!(registry.member_count(&channel).await, 0);
        assert!(!registry.has_backplane_subscription(&channel).await);
    }

    #[tokio::test]
    async fn test_no_backplane_means_no_subscription() {
        let registry = ChannelRegistry::new(None);
        let channel = channel_name("ws1", "b1");
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.join(&channel, &"c1".to_string(), tx).await.unwrap();
        assert!(!registry.has_backplane_subscription(&channel).await);
        assert_eq!(registry.member_count(&channel).await, 1);
    }

    #[tokio::test]
    async fn test_backplane_message_fans_out_to_members() {
        let backplane = Arc::new(MemoryBackplane::new());
        let registry = ChannelRegistry::new(Some(backplane.clone()));
        let channel = channel_name("ws1", "b1");

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.join(&channel, &"c1".to_string(), tx1).await.unwrap();
        registry.join(&channel, &"c2".to_string(), tx2).await.unwrap();

        backplane.publish(&channel, push(1)).await.unwrap();

        let m1 = rx1.recv().await.unwrap();
        let m2 = rx2.recv().await.unwrap();
        assert_eq!(m1.data.event_id, 1);
        assert_eq!(m2.data.event_id, 1);
    }

    #[tokio::test]
    async fn test_direct_delivery_without_backplane() {
        let registry = ChannelRegistry::new(None);
        let channel = channel_name("ws1", "b1");
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.join(&channel, &"c1".to_string(), tx).await.unwrap();

        registry.deliver_local(&channel, &push(9)).await;
        assert_eq!(rx.recv().await.unwrap().data.event_id, 9);
    }

    #[tokio::test]
    async fn test_channels_are_independent() {
        let backplane = Arc::new(MemoryBackplane::new());
        let registry = ChannelRegistry::new(Some(backplane.clone()));
        let ch1 = channel_name("ws1", "b1");
        let ch2 = channel_name("ws1", "b2");

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.join(&ch1, &"c1".to_string(), tx1).await.unwrap();
        registry.join(&ch2, &"c2".to_string(), tx2).await.unwrap();

        backplane.publish(&ch1, push(1)).await.unwrap();
        assert_eq!(rx1.recv().await.unwrap().data.event_id, 1);
        // b2 频道的成员收不到 b1 的事件
        assert!(rx2.try_recv().is_err());
    }
}
