//! 客户端事件系统 - 同步通知的注册与分发
//!
//! 双通道分发：
//! - 显式注册的监听器：按注册顺序同步触发，每次通知每个监听器至多调用一次
//! - tokio broadcast：异步消费者自行订阅
//!
//! 无订阅者时 broadcast send 失败属正常场景（如无 UI 的嵌入端），仅打 debug。

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::protocol::ChangeEvent;
use crate::sync::SyncState;
use crate::transport::ConnectionState;

/// 同步通知
#[derive(Debug, Clone)]
pub enum MetaSyncNotification {
    /// 一条元数据事件已成功落库
    EventApplied { event: ChangeEvent },
    /// 实时事件应用失败：不自动重试，推荐从游标做增量恢复
    ApplyFailed {
        event_id: u64,
        target: String,
        error: String,
    },
    /// 同步状态机迁移
    SyncStateChanged {
        workspace_id: String,
        base_id: String,
        state: SyncState,
    },
    /// bootstrap 完成（records 为落库行数）
    BootstrapCompleted {
        workspace_id: String,
        base_id: String,
        records: usize,
    },
    /// 增量同步完成（applied 为应用事件数）
    CatchUpCompleted {
        workspace_id: String,
        base_id: String,
        applied: usize,
    },
    /// 传输层连接状态变更
    ConnectionStateChanged { state: ConnectionState },
}

impl MetaSyncNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EventApplied { .. } => "event_applied",
            Self::ApplyFailed { .. } => "apply_failed",
            Self::SyncStateChanged { .. } => "sync_state_changed",
            Self::BootstrapCompleted { .. } => "bootstrap_completed",
            Self::CatchUpCompleted { .. } => "catch_up_completed",
            Self::ConnectionStateChanged { .. } => "connection_state_changed",
        }
    }
}

pub type NotificationListener = Arc<dyn Fn(&MetaSyncNotification) + Send + Sync>;

/// 事件总线
pub struct MetaEventBus {
    sender: broadcast::Sender<MetaSyncNotification>,
    listeners: RwLock<Vec<NotificationListener>>,
}

impl MetaEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// 分发一条通知：先广播，再按注册顺序逐个触发监听器
    pub fn emit(&self, notification: MetaSyncNotification) {
        if let Err(e) = self.sender.send(notification.clone()) {
            debug!("广播通知失败（无活跃订阅者）: {}", e);
        }
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            listener(&notification);
        }
    }

    /// 注册监听器；同一监听器对每条通知只会被触发一次
    pub fn on<F>(&self, listener: F)
    where
        F: Fn(&MetaSyncNotification) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// 订阅广播通道（异步消费）
    pub fn subscribe(&self) -> broadcast::Receiver<MetaSyncNotification> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn notification() -> MetaSyncNotification {
        MetaSyncNotification::BootstrapCompleted {
            workspace_id: "ws1".to_string(),
            base_id: "b1".to_string(),
            records: 3,
        }
    }

    #[test]
    fn test_listeners_fire_in_registration_order() {
        let bus = MetaEventBus::new(16);
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.on(move |_| order.lock().unwrap().push(tag));
        }
        bus.emit(notification());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_each_listener_fires_once_per_notification() {
        let bus = MetaEventBus::new(16);
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        bus.on(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(notification());
        bus.emit(notification());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_broadcast_subscribers_receive() {
        let bus = MetaEventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit(notification());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind(), "bootstrap_completed");
    }

    #[test]
    fn test_clear_listeners() {
        let bus = MetaEventBus::new(16);
        bus.on(|_| {});
        assert_eq!(bus.listener_count(), 1);
        bus.clear_listeners();
        assert_eq!(bus.listener_count(), 0);
    }
}
