//! MetaSync SDK - 工作区元数据实时同步
//!
//! 让多个同时在线的客户端以低延迟观察到一致的元数据（schema、视图、
//! 列、过滤器等，按 workspace/base 划分），无需轮询：
//! - 📡 服务端频道扇出：按 (workspace, base) 订阅，底座可用时跨进程广播
//! - 🗄️ 客户端本地副本：bootstrap 全量快照 + 有序事件流保持最新
//! - 🔁 断线补偿：游标增量拉取，分页有界、重放幂等
//! - ⚙️ 事件系统：统一的同步通知与回调机制
//! - 🧵 并发安全：异步优先设计，按频道/按 base 隔离共享状态
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use metasync_sdk::{
//!     LocalSyncApi, LocalTransport, MemoryBackplane, MemoryMetaStore, MetaSyncConfig,
//!     MetaSyncSDK, DigestTokenVerifier, RealtimeHub,
//! };
//! use metasync_sdk::server::{Backplane, MetaReader, SyncEventSource};
//! use metasync_sdk::transport::RealtimeTransport;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // 服务端：底座 + 凭证 + 元数据存储
//!     let store = Arc::new(MemoryMetaStore::new());
//!     let verifier = Arc::new(DigestTokenVerifier::new());
//!     verifier.register("my-token", "alice").await;
//!     let hub = Arc::new(RealtimeHub::new(
//!         Some(Arc::new(MemoryBackplane::new()) as Arc<dyn Backplane>),
//!         verifier,
//!         store.clone() as Arc<dyn MetaReader>,
//!         store.clone() as Arc<dyn SyncEventSource>,
//!     ));
//!
//!     // 客户端：回环传输 + SDK
//!     let transport = LocalTransport::connect(hub.clone(), "my-token").await?;
//!     let config = MetaSyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .auth_token("my-token")
//!         .build()?;
//!     let sdk = MetaSyncSDK::initialize_with_api(
//!         config,
//!         transport as Arc<dyn RealtimeTransport>,
//!         Arc::new(LocalSyncApi::new(hub)),
//!     )
//!     .await?;
//!
//!     // 激活 base：订阅 → bootstrap → 实时同步
//!     sdk.activate_base("ws1", "b1").await?;
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod protocol;
pub mod replica;
pub mod sdk;
pub mod server;
pub mod sync;
pub mod transport;

// 重新导出核心类型，方便使用
pub use config::{MetaSyncConfig, MetaSyncConfigBuilder};
pub use error::{MetaSyncError, Result};
pub use events::{MetaEventBus, MetaSyncNotification};
pub use protocol::{
    channel_name, BootstrapTable, ChangeEvent, EventTarget, MetaOperation, MetaTable,
    PushBody, PushMessage, SubscribeAck, SubscribeRequest, SyncEventRow, SyncEventsRequest,
};
pub use replica::{ReplicaStore, SyncCursor};
pub use sdk::MetaSyncSDK;
pub use server::{
    Backplane, ChannelRegistry, ConnectionHandle, ConnectionManager, DigestTokenVerifier,
    EventBroadcaster, MemoryBackplane, MemoryMetaStore, RealtimeHub, TokenVerifier,
};
pub use sync::{HttpSyncApi, SyncApi, SyncController, SyncState};
pub use transport::{
    ConnectionState, LocalSyncApi, LocalTransport, RealtimeTransport, TransportEvent,
};
