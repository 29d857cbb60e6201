//! 统一 SDK 接口 - MetaSyncSDK 主入口
//!
//! 分层架构：
//! ```text
//! MetaSyncSDK (门面)
//!   ├── SyncController (同步状态机)
//!   ├── ReplicaStore (本地副本存储)
//!   ├── MetaEventBus (通知分发)
//!   └── RealtimeTransport / SyncApi (传输与拉取接缝，外部注入)
//! ```

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::MetaSyncConfig;
use crate::error::Result;
use crate::events::{MetaEventBus, MetaSyncNotification};
use crate::replica::ReplicaStore;
use crate::sync::{HttpSyncApi, SyncApi, SyncController, SyncState};
use crate::transport::RealtimeTransport;

/// SDK 门面
pub struct MetaSyncSDK {
    config: MetaSyncConfig,
    replica: Arc<ReplicaStore>,
    bus: Arc<MetaEventBus>,
    controller: SyncController,
}

impl MetaSyncSDK {
    /// 初始化（HTTP 拉取模式，要求配置 api_base_url）
    pub async fn initialize(
        config: MetaSyncConfig,
        transport: Arc<dyn RealtimeTransport>,
    ) -> Result<Arc<Self>> {
        let api = Arc::new(HttpSyncApi::from_config(&config)?);
        Self::initialize_with_api(config, transport, api).await
    }

    /// 初始化（自定义拉取通道，如进程内回环）
    pub async fn initialize_with_api(
        config: MetaSyncConfig,
        transport: Arc<dyn RealtimeTransport>,
        api: Arc<dyn SyncApi>,
    ) -> Result<Arc<Self>> {
        let replica = Arc::new(ReplicaStore::open(&config.data_dir).await?);
        let bus = Arc::new(MetaEventBus::new(1024));
        let controller = SyncController::start(
            api,
            transport,
            Arc::clone(&replica),
            Arc::clone(&bus),
            config.catch_up_page_size,
            config.bootstrap_batch_size,
        )
        .await?;

        info!("✅ MetaSync SDK 初始化完成: {}", config.data_dir.display());
        Ok(Arc::new(Self {
            config,
            replica,
            bus,
            controller,
        }))
    }

    pub fn config(&self) -> &MetaSyncConfig {
        &self.config
    }

    pub fn replica(&self) -> &Arc<ReplicaStore> {
        &self.replica
    }

    pub fn sync_state(&self) -> SyncState {
        self.controller.state()
    }

    pub fn active_base(&self) -> Option<(String, String)> {
        self.controller.active_base()
    }

    /// 激活 base：订阅频道 → bootstrap → 进入实时同步
    pub async fn activate_base(&self, workspace_id: &str, base_id: &str) -> Result<()> {
        self.controller.activate_base(workspace_id, base_id).await
    }

    /// 关闭当前 base
    pub async fn deactivate_base(&self) -> Result<()> {
        self.controller.deactivate_base().await
    }

    /// 显式触发增量同步
    pub async fn resume(&self) -> Result<()> {
        self.controller.resume().await
    }

    /// 注册同步通知监听器（按注册顺序触发）
    pub fn on_notification<F>(&self, listener: F)
    where
        F: Fn(&MetaSyncNotification) + Send + Sync + 'static,
    {
        self.bus.on(listener);
    }

    /// 订阅通知广播（异步消费）
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<MetaSyncNotification> {
        self.bus.subscribe()
    }

    /// 关闭 SDK：停控制器（副本数据库随之空闲）
    pub async fn shutdown(&self) -> Result<()> {
        self.controller.shutdown().await;
        info!("MetaSync SDK 已关闭");
        Ok(())
    }
}
