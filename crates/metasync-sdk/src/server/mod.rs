//! 服务端实时同步 - 频道注册、连接管理、事件广播、快照供给
//!
//! RealtimeHub 是服务端入口：
//! - 握手/订阅/退订/断开 走 ConnectionManager
//! - 变更提交后 emit 走 EventBroadcaster（底座可用发底座，否则本地直投）
//! - bootstrap / sync-events 两个拉取接口分别对接 MetaReader / SyncEventSource

pub mod backplane;
pub mod bootstrap;
pub mod broadcaster;
pub mod channel;
pub mod connection;

pub use backplane::{Backplane, BackplaneSubscription, MemoryBackplane, SubscriptionGuard};
pub use bootstrap::{serve_bootstrap, MemoryMetaStore, MetaReader, SyncEventSource};
pub use broadcaster::EventBroadcaster;
pub use channel::{ChannelRegistry, ConnectionId};
pub use connection::{ConnectionHandle, ConnectionManager, DigestTokenVerifier, TokenVerifier};

use std::sync::Arc;

use crate::error::Result;
use crate::protocol::{BootstrapTable, ChangeEvent, SubscribeAck, SyncEventRow, SyncEventsRequest};

/// 服务端实时同步入口
pub struct RealtimeHub {
    registry: Arc<ChannelRegistry>,
    connections: ConnectionManager,
    broadcaster: EventBroadcaster,
    meta: Arc<dyn MetaReader>,
    events: Arc<dyn SyncEventSource>,
}

impl RealtimeHub {
    pub fn new(
        backplane: Option<Arc<dyn Backplane>>,
        verifier: Arc<dyn TokenVerifier>,
        meta: Arc<dyn MetaReader>,
        events: Arc<dyn SyncEventSource>,
    ) -> Self {
        let registry = Arc::new(ChannelRegistry::new(backplane));
        let connections = ConnectionManager::new(verifier, Arc::clone(&registry));
        let broadcaster = EventBroadcaster::new(Arc::clone(&registry));
        Self {
            registry,
            connections,
            broadcaster,
            meta,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// 握手认证；失败即拒绝，不产生连接
    pub async fn connect(&self, token: &str) -> Result<ConnectionHandle> {
        self.connections.connect(token).await
    }

    pub async fn subscribe(
        &self,
        conn_id: &ConnectionId,
        workspace_id: &str,
        base_id: &str,
    ) -> Result<SubscribeAck> {
        self.connections
            .subscribe(conn_id, workspace_id, base_id)
            .await
    }

    pub async fn unsubscribe(
        &self,
        conn_id: &ConnectionId,
        workspace_id: &str,
        base_id: &str,
    ) -> Result<SubscribeAck> {
        self.connections
            .unsubscribe(conn_id, workspace_id, base_id)
            .await
    }

    pub async fn disconnect(&self, conn_id: &ConnectionId) {
        self.connections.disconnect(conn_id).await;
    }

    /// 变更持久化之后调用；尽力而为，失败只记日志
    pub async fn emit(&self, event: &ChangeEvent) {
        self.broadcaster.emit(event).await;
    }

    /// GET /api/v2/meta/{base_id}/bootstrap
    pub async fn bootstrap(
        &self,
        workspace_id: &str,
        base_id: &str,
    ) -> Result<Vec<BootstrapTable>> {
        serve_bootstrap(self.meta.as_ref(), workspace_id, base_id).await
    }

    /// POST /api/sync-events
    pub async fn sync_events(&self, request: &SyncEventsRequest) -> Result<Vec<SyncEventRow>> {
        self.events
            .events_since(
                &request.workspace_id,
                &request.base_id,
                request.since,
                request.offset,
                request.limit,
            )
            .await
    }

    /// 停机：释放全部频道与底座订阅
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
