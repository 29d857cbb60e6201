//! 快照与增量事件的服务端供给
//!
//! 元数据的物理存储在核心之外，通过两个接缝接入：
//! - MetaReader: 按表读取 base 范围内的全量记录（bootstrap 用）
//! - SyncEventSource: 按「大于游标 id」分页读取事件（增量拉取用）
//!
//! MemoryMetaStore 是两个接缝的进程内实现，单进程嵌入与测试共用。

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::error::{MetaSyncError, Result};
use crate::protocol::{
    BootstrapTable, ChangeEvent, EventTarget, MetaOperation, MetaTable, SyncEventRow,
};

/// 服务端元数据读取接缝（底层引擎无关的通用查询接口）
#[async_trait]
pub trait MetaReader: Send + Sync {
    /// 某表在 (workspace, base) 范围内的全部记录
    async fn list(
        &self,
        workspace_id: &str,
        base_id: &str,
        table: MetaTable,
    ) -> Result<Vec<serde_json::Value>>;
}

/// 增量事件供给接缝
#[async_trait]
pub trait SyncEventSource: Send + Sync {
    /// id 大于 since 的事件，按 id 升序，跳过 offset 条，至多 limit 条
    async fn events_since(
        &self,
        workspace_id: &str,
        base_id: &str,
        since: u64,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<SyncEventRow>>;
}

/// 组装 bootstrap 响应：每个可复制表一个 {table, records} 条目
///
/// 读路径不加额外锁，快照与并发写之间只保证「足够接近」，
/// 差异由客户端随后的增量拉取收敛。
pub async fn serve_bootstrap(
    meta: &dyn MetaReader,
    workspace_id: &str,
    base_id: &str,
) -> Result<Vec<BootstrapTable>> {
    let mut results = Vec::with_capacity(MetaTable::ALL.len());
    for &table in MetaTable::ALL {
        let records = meta.list(workspace_id, base_id, table).await.map_err(|e| {
            error!("bootstrap 读取表 {} 失败: {}", table, e);
            e
        })?;
        results.push(BootstrapTable {
            table: table.as_str().to_string(),
            records,
        });
    }
    info!(
        "bootstrap 快照组装完成: workspace={} base={} 共 {} 表",
        workspace_id,
        base_id,
        results.len()
    );
    Ok(results)
}

#[derive(Default)]
struct BaseState {
    records: HashMap<MetaTable, Vec<serde_json::Value>>,
    events: Vec<ChangeEvent>,
    next_event_id: u64,
}

/// 进程内元数据存储：记录表 + 按 (workspace, base) 单调分配 id 的事件日志
pub struct MemoryMetaStore {
    bases: RwLock<HashMap<(String, String), BaseState>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self {
            bases: RwLock::new(HashMap::new()),
        }
    }

    fn record_key(table: MetaTable, record: &serde_json::Value) -> Option<String> {
        let field = if table.has_composite_key() {
            "fk_user_id"
        } else {
            "id"
        };
        match record.get(field) {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    /// 提交一次变更：先落内存记录，再分配事件 id 追加日志
    ///
    /// 返回的 ChangeEvent 交给广播器 emit；"持久化之后才广播" 的
    /// 顺序由调用方保持。
    pub async fn commit(
        &self,
        workspace_id: &str,
        base_id: &str,
        op: MetaOperation,
        table: MetaTable,
        payload: serde_json::Value,
    ) -> Result<ChangeEvent> {
        let mut bases = self.bases.write().await;
        let state = bases
            .entry((workspace_id.to_string(), base_id.to_string()))
            .or_default();

        let key = Self::record_key(table, &payload)
            .ok_or_else(|| MetaSyncError::Validation(format!("{} payload 缺少主键", table)))?;
        let records = state.records.entry(table).or_default();

        match op {
            MetaOperation::Insert => {
                records.retain(|r| Self::record_key(table, r).as_deref() != Some(&key));
                records.push(payload.clone());
            }
            MetaOperation::Update => {
                for record in records.iter_mut() {
                    if Self::record_key(table, record).as_deref() == Some(&key) {
                        if let (Some(base), Some(delta)) =
                            (record.as_object_mut(), payload.as_object())
                        {
                            for (k, v) in delta {
                                base.insert(k.clone(), v.clone());
                            }
                        }
                    }
                }
            }
            MetaOperation::Delete => {
                records.retain(|r| Self::record_key(table, r).as_deref() != Some(&key));
            }
        }

        state.next_event_id += 1;
        let event = ChangeEvent {
            op,
            target: EventTarget::Known(table),
            payload,
            event_id: state.next_event_id,
            workspace_id: workspace_id.to_string(),
            base_id: base_id.to_string(),
            timestamp: Utc::now(),
        };
        state.events.push(event.clone());
        Ok(event)
    }
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetaReader for MemoryMetaStore {
    async fn list(
        &self,
        workspace_id: &str,
        base_id: &str,
        table: MetaTable,
    ) -> Result<Vec<serde_json::Value>> {
        let bases = self.bases.read().await;
        Ok(bases
            .get(&(workspace_id.to_string(), base_id.to_string()))
            .and_then(|state| state.records.get(&table))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl SyncEventSource for MemoryMetaStore {
    async fn events_since(
        &self,
        workspace_id: &str,
        base_id: &str,
        since: u64,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<SyncEventRow>> {
        let bases = self.bases.read().await;
        let Some(state) = bases.get(&(workspace_id.to_string(), base_id.to_string())) else {
            return Ok(Vec::new());
        };
        Ok(state
            .events
            .iter()
            .filter(|e| e.event_id > since)
            .skip(offset as usize)
            .take(limit as usize)
            .map(|e| SyncEventRow {
                id: e.event_id,
                operation: e.op,
                target: e.target.clone(),
                payload: e.payload.clone(),
            })
            .collect())
    }
}
