//! 客户端传输层抽象 - 订阅通道与推送帧流
//!
//! 传输层负责连接的建立、掉线检测与重建；掉线期间服务端的频道
//! 成员资格即丢失，重连后必须重新订阅再做增量同步（由同步控制器
//! 驱动）。LocalTransport 是进程内回环实现，把控制器直接接在
//! RealtimeHub 上，单进程嵌入与集成测试共用。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{MetaSyncError, Result};
use crate::protocol::{BootstrapTable, PushMessage, SubscribeAck, SyncEventRow, SyncEventsRequest};
use crate::server::{ConnectionId, RealtimeHub};
use crate::sync::SyncApi;

/// 连接状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Connecting,
    Reconnecting,
}

/// 传输层上行给同步控制器的事件
#[derive(Debug)]
pub enum TransportEvent {
    /// 服务端推送帧（只承载 META_* 事件）
    Push(PushMessage),
    /// 连接状态变更
    StateChanged(ConnectionState),
}

/// 实时订阅传输
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn subscribe(&self, workspace_id: &str, base_id: &str) -> Result<SubscribeAck>;

    async fn unsubscribe(&self, workspace_id: &str, base_id: &str) -> Result<SubscribeAck>;

    /// 取走事件接收端；只能取一次，由同步控制器独占消费
    async fn take_events(&self) -> Result<UnboundedReceiver<TransportEvent>>;
}

/// 进程内回环传输：直接挂在 RealtimeHub 上
pub struct LocalTransport {
    hub: Arc<RealtimeHub>,
    token: String,
    conn_id: Mutex<Option<ConnectionId>>,
    events_tx: UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<UnboundedReceiver<TransportEvent>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

impl LocalTransport {
    /// 建立回环连接（握手失败即报认证错误）
    pub async fn connect(hub: Arc<RealtimeHub>, token: &str) -> Result<Arc<Self>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            hub,
            token: token.to_string(),
            conn_id: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            pump: Mutex::new(None),
        });
        transport.establish().await?;
        Ok(transport)
    }

    async fn establish(&self) -> Result<()> {
        let handle = self.hub.connect(&self.token).await?;
        info!("回环连接已建立: {}", handle.id);
        *self.conn_id.lock().await = Some(handle.id);

        let events_tx = self.events_tx.clone();
        let mut receiver = handle.receiver;
        let pump = tokio::spawn(async move {
            // 逐帧转发，保持单连接内的接收顺序
            while let Some(message) = receiver.recv().await {
                if events_tx.send(TransportEvent::Push(message)).is_err() {
                    break;
                }
            }
            debug!("推送泵结束");
        });
        if let Some(old) = self.pump.lock().await.replace(pump) {
            old.abort();
        }

        let _ = self
            .events_tx
            .send(TransportEvent::StateChanged(ConnectionState::Connected));
        Ok(())
    }

    /// 模拟传输层掉线并重建连接（服务端成员资格随断开丢失）
    pub async fn reconnect(&self) -> Result<()> {
        if let Some(old) = self.conn_id.lock().await.take() {
            self.hub.disconnect(&old).await;
        }
        let _ = self
            .events_tx
            .send(TransportEvent::StateChanged(ConnectionState::Reconnecting));
        self.establish().await
    }

    /// 主动断开
    pub async fn disconnect(&self) {
        if let Some(conn_id) = self.conn_id.lock().await.take() {
            self.hub.disconnect(&conn_id).await;
        }
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        let _ = self
            .events_tx
            .send(TransportEvent::StateChanged(ConnectionState::Disconnected));
    }

    async fn current_conn(&self) -> Result<ConnectionId> {
        self.conn_id
            .lock()
            .await
            .clone()
            .ok_or(MetaSyncError::NotConnected)
    }
}

#[async_trait]
impl RealtimeTransport for LocalTransport {
    async fn subscribe(&self, workspace_id: &str, base_id: &str) -> Result<SubscribeAck> {
        let conn_id = self.current_conn().await?;
        let ack = self.hub.subscribe(&conn_id, workspace_id, base_id).await?;
        if ack.status != "subscribed" {
            return Err(MetaSyncError::Subscription(format!(
                "订阅未确认: {}",
                ack.status
            )));
        }
        Ok(ack)
    }

    async fn unsubscribe(&self, workspace_id: &str, base_id: &str) -> Result<SubscribeAck> {
        let conn_id = self.current_conn().await?;
        self.hub.unsubscribe(&conn_id, workspace_id, base_id).await
    }

    async fn take_events(&self) -> Result<UnboundedReceiver<TransportEvent>> {
        self.events_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| MetaSyncError::Other("事件接收端已被取走".to_string()))
    }
}

/// 进程内拉取通道：bootstrap / sync-events 直连 Hub（与 LocalTransport 配套）
pub struct LocalSyncApi {
    hub: Arc<RealtimeHub>,
}

impl LocalSyncApi {
    pub fn new(hub: Arc<RealtimeHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl SyncApi for LocalSyncApi {
    async fn fetch_bootstrap(
        &self,
        workspace_id: &str,
        base_id: &str,
    ) -> Result<Vec<BootstrapTable>> {
        self.hub.bootstrap(workspace_id, base_id).await
    }

    async fn fetch_events(&self, request: &SyncEventsRequest) -> Result<Vec<SyncEventRow>> {
        self.hub.sync_events(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MetaOperation, MetaTable};
    use crate::server::{
        Backplane, DigestTokenVerifier, MemoryBackplane, MemoryMetaStore, MetaReader,
        SyncEventSource,
    };
    use serde_json::json;

    async fn local_hub() -> (Arc<MemoryMetaStore>, Arc<RealtimeHub>) {
        let store = Arc::new(MemoryMetaStore::new());
        let verifier = Arc::new(DigestTokenVerifier::new());
        verifier.register("tok-alice", "alice").await;
        let hub = Arc::new(RealtimeHub::new(
            Some(Arc::new(MemoryBackplane::new()) as Arc<dyn Backplane>),
            verifier,
            store.clone() as Arc<dyn MetaReader>,
            store.clone() as Arc<dyn SyncEventSource>,
        ));
        (store, hub)
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_token() {
        let (_store, hub) = local_hub().await;
        let err = LocalTransport::connect(hub, "tok-wrong").await.unwrap_err();
        assert!(matches!(err, MetaSyncError::Auth(_)));
    }

    #[tokio::test]
    async fn test_push_flows_through_transport() {
        let (store, hub) = local_hub().await;
        let transport = LocalTransport::connect(hub.clone(), "tok-alice").await.unwrap();
        let mut events = transport.take_events().await.unwrap();

        // 建连即上报 Connected
        match events.recv().await.unwrap() {
            TransportEvent::StateChanged(ConnectionState::Connected) => {}
            other => panic!("unexpected event: {:?}", other),
        }

        transport.subscribe("ws1", "b1").await.unwrap();
        let event = store
            .commit("ws1", "b1", MetaOperation::Insert, MetaTable::Columns, json!({"id": 1}))
            .await
            .unwrap();
        hub.emit(&event).await;

        match events.recv().await.unwrap() {
            TransportEvent::Push(msg) => assert_eq!(msg.data.event_id, 1),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconnect_drops_server_membership() {
        let (_store, hub) = local_hub().await;
        let transport = LocalTransport::connect(hub.clone(), "tok-alice").await.unwrap();
        transport.subscribe("ws1", "b1").await.unwrap();
        assert_eq!(hub.registry().member_count("META:ws1:b1").await, 1);

        transport.reconnect().await.unwrap();
        // 旧连接断开即被从频道清理；订阅需由控制器重新发起
        assert_eq!(hub.registry().member_count("META:ws1:b1").await, 0);

        transport.subscribe("ws1", "b1").await.unwrap();
        assert_eq!(hub.registry().member_count("META:ws1:b1").await, 1);
    }

    #[tokio::test]
    async fn test_take_events_is_single_shot() {
        let (_store, hub) = local_hub().await;
        let transport = LocalTransport::connect(hub, "tok-alice").await.unwrap();
        transport.take_events().await.unwrap();
        assert!(transport.take_events().await.is_err());
    }
}
