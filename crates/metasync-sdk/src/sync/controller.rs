//! 同步控制器 - 副本同步状态机
//!
//! 状态：Idle → Bootstrapping → Live → CatchingUp → Live（循环），
//! 切换/关闭 base 时回到 Idle。
//!
//! 单 base 的事件应用由控制器的单工作循环串行化：bootstrap 与实时
//! 应用绝不交错（bootstrap 期间到达的推送滞留在事件队列，完成后按
//! 序排空再进入 Live）；增量分页严格顺序（上一页应用完才取下一页）。
//! 不同 base 各自的控制器可并行。

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MetaSyncError, Result};
use crate::events::{MetaEventBus, MetaSyncNotification};
use crate::protocol::{ChangeEvent, PushMessage, SyncEventsRequest};
use crate::replica::ReplicaStore;
use crate::transport::{ConnectionState, RealtimeTransport, TransportEvent};
use super::api::SyncApi;

/// 同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Bootstrapping,
    Live,
    CatchingUp,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Idle => write!(f, "idle"),
            SyncState::Bootstrapping => write!(f, "bootstrapping"),
            SyncState::Live => write!(f, "live"),
            SyncState::CatchingUp => write!(f, "catching_up"),
        }
    }
}

enum Command {
    Activate {
        workspace_id: String,
        base_id: String,
        ack: oneshot::Sender<Result<()>>,
    },
    Deactivate {
        ack: oneshot::Sender<Result<()>>,
    },
    Resume {
        ack: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

struct Shared {
    state: parking_lot::RwLock<SyncState>,
    active: parking_lot::RwLock<Option<(String, String)>>,
}

/// 同步控制器句柄
pub struct SyncController {
    commands: UnboundedSender<Command>,
    shared: Arc<Shared>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SyncController {
    /// 启动控制器工作循环（独占消费传输层事件流）
    pub async fn start(
        api: Arc<dyn SyncApi>,
        transport: Arc<dyn RealtimeTransport>,
        replica: Arc<ReplicaStore>,
        bus: Arc<MetaEventBus>,
        page_limit: u64,
        batch_size: usize,
    ) -> Result<Self> {
        let events = transport.take_events().await?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: parking_lot::RwLock::new(SyncState::Idle),
            active: parking_lot::RwLock::new(None),
        });

        let worker = Worker {
            api,
            transport,
            replica,
            bus,
            shared: Arc::clone(&shared),
            page_limit,
            batch_size,
            needs_catchup: false,
        };
        let handle = tokio::spawn(worker.run(commands_rx, events));

        Ok(Self {
            commands: commands_tx,
            shared,
            worker: parking_lot::Mutex::new(Some(handle)),
        })
    }

    async fn send(&self, build: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(build(ack_tx))
            .map_err(|_| MetaSyncError::ShuttingDown("同步控制器已停止".to_string()))?;
        ack_rx
            .await
            .map_err(|_| MetaSyncError::ShuttingDown("同步控制器已停止".to_string()))?
    }

    /// 激活 base：订阅 → bootstrap → Live。已有激活 base 时先退订旧频道。
    pub async fn activate_base(&self, workspace_id: &str, base_id: &str) -> Result<()> {
        let workspace_id = workspace_id.to_string();
        let base_id = base_id.to_string();
        self.send(move |ack| Command::Activate {
            workspace_id,
            base_id,
            ack,
        })
        .await
    }

    /// 关闭当前 base：退订并回到 Idle
    pub async fn deactivate_base(&self) -> Result<()> {
        self.send(|ack| Command::Deactivate { ack }).await
    }

    /// 显式触发增量同步（重新订阅 + 从游标分页补齐）
    pub async fn resume(&self) -> Result<()> {
        self.send(|ack| Command::Resume { ack }).await
    }

    pub fn state(&self) -> SyncState {
        *self.shared.state.read()
    }

    pub fn active_base(&self) -> Option<(String, String)> {
        self.shared.active.read().clone()
    }

    pub async fn shutdown(&self) {
        let handle = { self.worker.lock().take() };
        if let Some(handle) = handle {
            let _ = self.commands.send(Command::Shutdown);
            let _ = handle.await;
        }
    }
}

struct Worker {
    api: Arc<dyn SyncApi>,
    transport: Arc<dyn RealtimeTransport>,
    replica: Arc<ReplicaStore>,
    bus: Arc<MetaEventBus>,
    shared: Arc<Shared>,
    page_limit: u64,
    batch_size: usize,
    needs_catchup: bool,
}

impl Worker {
    /// 读取当前激活的 (workspace, base)，锁不跨 await 持有
    fn active(&self) -> Option<(String, String)> {
        self.shared.active.read().clone()
    }

    fn take_active(&self) -> Option<(String, String)> {
        self.shared.active.write().take()
    }

    async fn run(
        mut self,
        mut commands: UnboundedReceiver<Command>,
        mut events: UnboundedReceiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(Command::Activate { workspace_id, base_id, ack }) => {
                        let result = self.activate(&workspace_id, &base_id).await;
                        let _ = ack.send(result);
                    }
                    Some(Command::Deactivate { ack }) => {
                        let result = self.deactivate().await;
                        let _ = ack.send(result);
                    }
                    Some(Command::Resume { ack }) => {
                        let result = self.catch_up().await;
                        let _ = ack.send(result);
                    }
                },
                event = events.recv() => match event {
                    None => {
                        debug!("传输层事件流已关闭，控制器退出");
                        break;
                    }
                    Some(TransportEvent::Push(message)) => self.on_push(message).await,
                    Some(TransportEvent::StateChanged(state)) => {
                        self.on_connection_state(state).await;
                    }
                },
            }
        }
        info!("同步控制器工作循环结束");
    }

    fn set_state(&self, workspace_id: &str, base_id: &str, state: SyncState) {
        *self.shared.state.write() = state;
        self.bus.emit(MetaSyncNotification::SyncStateChanged {
            workspace_id: workspace_id.to_string(),
            base_id: base_id.to_string(),
            state,
        });
    }

    async fn activate(&mut self, workspace_id: &str, base_id: &str) -> Result<()> {
        // 先退订旧 base 再订阅新 base，防止跨 base 事件串流
        let previous = self.take_active();
        if let Some((old_ws, old_base)) = previous {
            if let Err(e) = self.transport.unsubscribe(&old_ws, &old_base).await {
                warn!("退订旧频道失败（忽略，继续切换）: {}", e);
            }
        }

        self.transport.subscribe(workspace_id, base_id).await?;
        *self.shared.active.write() =
            Some((workspace_id.to_string(), base_id.to_string()));
        self.set_state(workspace_id, base_id, SyncState::Bootstrapping);
        info!("🔄 base {} 激活，开始 bootstrap", base_id);

        match self.bootstrap(workspace_id, base_id).await {
            Ok(records) => {
                self.set_state(workspace_id, base_id, SyncState::Live);
                self.bus.emit(MetaSyncNotification::BootstrapCompleted {
                    workspace_id: workspace_id.to_string(),
                    base_id: base_id.to_string(),
                    records,
                });
                info!("✅ base {} bootstrap 完成: {} 条", base_id, records);
                Ok(())
            }
            Err(e) => {
                // bootstrap 清空后重载，整体重试是安全的；这里回到未激活状态
                let _ = self.transport.unsubscribe(workspace_id, base_id).await;
                *self.shared.active.write() = None;
                self.set_state(workspace_id, base_id, SyncState::Idle);
                Err(e)
            }
        }
    }

    async fn bootstrap(&self, workspace_id: &str, base_id: &str) -> Result<usize> {
        let snapshot = self.api.fetch_bootstrap(workspace_id, base_id).await?;
        self.replica
            .apply_bootstrap(base_id, &snapshot, self.batch_size)
            .await
    }

    async fn deactivate(&mut self) -> Result<()> {
        let active = self.take_active();
        if let Some((workspace_id, base_id)) = active {
            if let Err(e) = self.transport.unsubscribe(&workspace_id, &base_id).await {
                warn!("退订频道失败: {}", e);
            }
            self.set_state(&workspace_id, &base_id, SyncState::Idle);
            info!("base {} 已关闭", base_id);
        }
        Ok(())
    }

    async fn on_push(&mut self, message: PushMessage) {
        let Some((workspace_id, base_id)) = self.active() else {
            debug!("无激活 base，丢弃推送帧 event_id={}", message.data.event_id);
            return;
        };
        if message.data.workspace_id != workspace_id || message.data.base_id != base_id {
            // 切换竞态下的跨 base 残留帧
            debug!(
                "丢弃跨 base 推送帧: {}:{} (当前 {}:{})",
                message.data.workspace_id, message.data.base_id, workspace_id, base_id
            );
            return;
        }
        self.apply_live(message.into_event()).await;
    }

    async fn apply_live(&self, event: ChangeEvent) {
        let event_id = event.event_id;
        let target = event.target.as_str().to_string();
        match self.replica.apply_event(&event).await {
            Ok(()) => {
                self.bus.emit(MetaSyncNotification::EventApplied { event });
            }
            Err(e) => {
                // 不自动重试：盲目重放可能乱序，推荐走游标增量恢复
                warn!("实时事件 {} 应用失败: {}", event_id, e);
                self.bus.emit(MetaSyncNotification::ApplyFailed {
                    event_id,
                    target,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn on_connection_state(&mut self, state: ConnectionState) {
        self.bus
            .emit(MetaSyncNotification::ConnectionStateChanged { state });
        match state {
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                self.needs_catchup = true;
            }
            ConnectionState::Connected => {
                if self.needs_catchup && self.active().is_some() {
                    self.needs_catchup = false;
                    // 重连风暴削峰：小幅随机延迟再拉增量
                    let jitter = rand::thread_rng().gen_range(0..200u64);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                    if let Err(e) = self.catch_up().await {
                        warn!("重连后增量同步失败（游标未动，可 resume 重试）: {}", e);
                    }
                }
            }
            ConnectionState::Connecting => {}
        }
    }

    /// 增量同步：重新订阅 → 读游标 → 分页补齐（短页终止）
    async fn catch_up(&mut self) -> Result<()> {
        let Some((workspace_id, base_id)) = self.active() else {
            return Err(MetaSyncError::Other(
                "没有激活的 base，无法增量同步".to_string(),
            ));
        };
        // 断线后服务端成员资格已丢失；重复订阅在服务端为幂等 no-op
        self.transport.subscribe(&workspace_id, &base_id).await?;
        self.set_state(&workspace_id, &base_id, SyncState::CatchingUp);

        let result = self.catch_up_pages(&workspace_id, &base_id).await;
        self.set_state(&workspace_id, &base_id, SyncState::Live);
        match result {
            Ok(applied) => {
                self.bus.emit(MetaSyncNotification::CatchUpCompleted {
                    workspace_id,
                    base_id,
                    applied,
                });
                Ok(())
            }
            Err(e) => {
                warn!("增量同步中止，游标停在最后提交的事件: {}", e);
                Err(e)
            }
        }
    }

    async fn catch_up_pages(&self, workspace_id: &str, base_id: &str) -> Result<usize> {
        let cursor = self.replica.cursor(workspace_id, base_id).await?;
        let Some(cursor) = cursor else {
            // 无游标（从未 bootstrap 成功）：只能整体重新 bootstrap
            info!("无同步游标，退化为全量 bootstrap: base={}", base_id);
            let records = self.bootstrap(workspace_id, base_id).await?;
            self.bus.emit(MetaSyncNotification::BootstrapCompleted {
                workspace_id: workspace_id.to_string(),
                base_id: base_id.to_string(),
                records,
            });
            return Ok(records);
        };

        let since = cursor.last_event_id;
        let mut offset = 0u64;
        let mut applied = 0usize;
        // 有界分页循环：上一页应用完才取下一页，短页即终止
        loop {
            let request = SyncEventsRequest {
                workspace_id: workspace_id.to_string(),
                base_id: base_id.to_string(),
                since,
                since_type: "event_id".to_string(),
                offset,
                limit: self.page_limit,
            };
            let rows = self.api.fetch_events(&request).await?;
            let count = rows.len() as u64;
            for row in rows {
                let event = row.into_event(workspace_id, base_id);
                self.replica.apply_event(&event).await?;
                applied += 1;
                self.bus.emit(MetaSyncNotification::EventApplied { event });
            }
            debug!("增量同步本页 {} 条，累计 {}", count, applied);
            if count < self.page_limit {
                break;
            }
            offset += self.page_limit;
        }
        info!("增量同步完成: base={} 共 {} 条", base_id, applied);
        Ok(applied)
    }
}
