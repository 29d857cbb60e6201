//! 事件广播器 - 已提交的元数据变更 → 频道扇出
//!
//! 尽力而为、至少一次：重复/乱序投递由客户端同步控制器容忍。
//! 发布失败只记日志不重试，漏掉的实时帧靠增量拉取补齐。

use std::sync::Arc;
use tracing::{debug, error};

use crate::protocol::{channel_name, ChangeEvent, PushMessage};
use super::channel::ChannelRegistry;

pub struct EventBroadcaster {
    registry: Arc<ChannelRegistry>,
}

impl EventBroadcaster {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self { registry }
    }

    /// 每次变更持久化之后调用一次；不阻塞变更路径，不因投递失败报错
    pub async fn emit(&self, event: &ChangeEvent) {
        let channel = channel_name(&event.workspace_id, &event.base_id);
        let message = PushMessage::from_event(event);

        match self.registry.backplane().filter(|b| b.available()) {
            Some(backplane) => match backplane.publish(&channel, message).await {
                Ok(()) => debug!(
                    "事件 {} ({}) 已发布到底座频道 {}",
                    event.event_id, event.op, channel
                ),
                Err(e) => error!("底座发布失败（不重试，增量拉取可补）: {}", e),
            },
            None => {
                self.registry.deliver_local(&channel, &message).await;
                debug!(
                    "事件 {} ({}) 已本地直投频道 {}",
                    event.event_id, event.op, channel
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EventTarget, MetaOperation, MetaTable};
    use crate::server::backplane::MemoryBackplane;
    use chrono::Utc;
    use tokio::sync::mpsc;

    fn event(event_id: u64, base_id: &str) -> ChangeEvent {
        ChangeEvent {
            op: MetaOperation::Update,
            target: EventTarget::Known(MetaTable::Columns),
            payload: serde_json::json!({"id": 1, "title": "FullName"}),
            event_id,
            workspace_id: "ws1".to_string(),
            base_id: base_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_emit_via_backplane_reaches_channel_members() {
        let backplane = Arc::new(MemoryBackplane::new());
        let registry = Arc::new(ChannelRegistry::new(Some(
            backplane as Arc<dyn crate::server::backplane::Backplane>,
        )));
        let broadcaster = EventBroadcaster::new(registry.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .join("META:ws1:b1", &"c1".to_string(), tx)
            .await
            .unwrap();

        broadcaster.emit(&event(1, "b1")).await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.op, MetaOperation::Update);
        assert_eq!(msg.data.event_id, 1);
    }

    #[tokio::test]
    async fn test_emit_degrades_to_direct_delivery() {
        let backplane = Arc::new(MemoryBackplane::new());
        backplane.set_available(false);
        let registry = Arc::new(ChannelRegistry::new(Some(
            backplane as Arc<dyn crate::server::backplane::Backplane>,
        )));
        let broadcaster = EventBroadcaster::new(registry.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .join("META:ws1:b1", &"c1".to_string(), tx)
            .await
            .unwrap();

        // 底座不可用：走本地直投，单进程行为不变
        broadcaster.emit(&event(2, "b1")).await;
        assert_eq!(rx.recv().await.unwrap().data.event_id, 2);
    }

    #[tokio::test]
    async fn test_emit_to_empty_channel_is_silent() {
        let registry = Arc::new(ChannelRegistry::new(None));
        let broadcaster = EventBroadcaster::new(registry);
        broadcaster.emit(&event(3, "b-nobody")).await;
    }
}
