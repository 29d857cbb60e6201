//! 连接管理 - 握手认证、订阅簿记、断开清理
//!
//! 握手失败即拒绝，不产生任何连接状态；订阅幂等（重复订阅同一
//! (workspace, base) 第二次为 no-op）；断开时退订全部频道后遗忘连接。

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{MetaSyncError, Result};
use crate::protocol::{channel_name, PushMessage, SubscribeAck};
use super::channel::{ChannelRegistry, ConnectionId};

/// 握手凭证校验（认证中间件的接缝，内部实现只认摘要）
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// 校验成功返回 principal（用户标识）
    async fn verify(&self, token: &str) -> Result<String>;
}

/// 基于 SHA-256 摘要的静态凭证表
///
/// 只保存 token 摘要，不落明文。
pub struct DigestTokenVerifier {
    tokens: RwLock<HashMap<String, String>>,
}

impl DigestTokenVerifier {
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    fn digest(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"metasync_token_v1");
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn register(&self, token: &str, principal: &str) {
        self.tokens
            .write()
            .await
            .insert(Self::digest(token), principal.to_string());
    }

    pub async fn revoke(&self, token: &str) {
        self.tokens.write().await.remove(&Self::digest(token));
    }
}

impl Default for DigestTokenVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenVerifier for DigestTokenVerifier {
    async fn verify(&self, token: &str) -> Result<String> {
        self.tokens
            .read()
            .await
            .get(&Self::digest(token))
            .cloned()
            .ok_or_else(|| MetaSyncError::Auth("凭证无效或已吊销".to_string()))
    }
}

struct Connection {
    principal: String,
    subscriptions: HashSet<(String, String)>,
    sender: UnboundedSender<PushMessage>,
}

/// 握手成功后交给传输层的句柄：推送帧从 receiver 依序流出
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub principal: String,
    pub receiver: UnboundedReceiver<PushMessage>,
}

/// 连接管理器
pub struct ConnectionManager {
    verifier: Arc<dyn TokenVerifier>,
    registry: Arc<ChannelRegistry>,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl ConnectionManager {
    pub fn new(verifier: Arc<dyn TokenVerifier>, registry: Arc<ChannelRegistry>) -> Self {
        Self {
            verifier,
            registry,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// 握手：认证失败直接拒绝，不留任何状态
    pub async fn connect(&self, token: &str) -> Result<ConnectionHandle> {
        let principal = self.verifier.verify(token).await.map_err(|e| {
            warn!("握手认证失败: {}", e);
            e
        })?;

        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().await.insert(
            id.clone(),
            Connection {
                principal: principal.clone(),
                subscriptions: HashSet::new(),
                sender: tx,
            },
        );
        info!("连接 {} 已建立 (principal: {})", id, principal);

        Ok(ConnectionHandle {
            id,
            principal,
            receiver: rx,
        })
    }

    /// 订阅 (workspace, base)：校验 → 入频道 → 幂等记账
    pub async fn subscribe(
        &self,
        conn_id: &ConnectionId,
        workspace_id: &str,
        base_id: &str,
    ) -> Result<SubscribeAck> {
        if workspace_id.is_empty() || base_id.is_empty() {
            return Err(MetaSyncError::Validation(
                "workspace_id 与 base_id 均不能为空".to_string(),
            ));
        }
        let channel = channel_name(workspace_id, base_id);

        let mut connections = self.connections.write().await;
        let conn = connections
            .get_mut(conn_id)
            .ok_or(MetaSyncError::NotConnected)?;

        let pair = (workspace_id.to_string(), base_id.to_string());
        if conn.subscriptions.contains(&pair) {
            // 重复订阅为 no-op，直接回放应答
            return Ok(SubscribeAck {
                status: "subscribed".to_string(),
                channel,
            });
        }

        let sender = conn.sender.clone();
        self.registry.join(&channel, conn_id, sender).await?;
        conn.subscriptions.insert(pair);
        info!("连接 {} 订阅频道 {}", conn_id, channel);

        Ok(SubscribeAck {
            status: "subscribed".to_string(),
            channel,
        })
    }

    /// 退订：成员清空的频道随之释放
    pub async fn unsubscribe(
        &self,
        conn_id: &ConnectionId,
        workspace_id: &str,
        base_id: &str,
    ) -> Result<SubscribeAck> {
        let channel = channel_name(workspace_id, base_id);

        let mut connections = self.connections.write().await;
        let conn = connections
            .get_mut(conn_id)
            .ok_or(MetaSyncError::NotConnected)?;

        let pair = (workspace_id.to_string(), base_id.to_string());
        if conn.subscriptions.remove(&pair) {
            self.registry.leave(&channel, conn_id).await;
            info!("连接 {} 退订频道 {}", conn_id, channel);
        }

        Ok(SubscribeAck {
            status: "unsubscribed".to_string(),
            channel,
        })
    }

    /// 断开：先逐频道退订（触发空频道回收），再遗忘连接
    pub async fn disconnect(&self, conn_id: &ConnectionId) {
        let mut connections = self.connections.write().await;
        let Some(conn) = connections.remove(conn_id) else {
            return;
        };
        for (workspace_id, base_id) in &conn.subscriptions {
            let channel = channel_name(workspace_id, base_id);
            self.registry.leave(&channel, conn_id).await;
        }
        info!(
            "连接 {} 已断开，清理 {} 个订阅",
            conn_id,
            conn.subscriptions.len()
        );
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn subscription_count(&self, conn_id: &ConnectionId) -> usize {
        self.connections
            .read()
            .await
            .get(conn_id)
            .map(|c| c.subscriptions.len())
            .unwrap_or(0)
    }
}
