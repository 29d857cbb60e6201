//! 同步游标 - sync_metadata 表访问
//!
//! 每个 (workspace_id, base_id) 一行，记录最后成功应用的事件 id。
//! 游标是断线重连后增量拉取的唯一事实来源：先 apply 提交，后推进游标。

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{MetaSyncError, Result};

/// 某 (workspace, base) 的同步游标行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCursor {
    pub workspace_id: String,
    pub base_id: String,
    pub last_event_id: u64,
    pub last_sync_timestamp: String,
}

pub struct SyncCursorDao<'a> {
    conn: &'a Connection,
}

impl<'a> SyncCursorDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, workspace_id: &str, base_id: &str) -> Result<Option<SyncCursor>> {
        let cursor = self
            .conn
            .query_row(
                "SELECT workspace_id, base_id, last_event_id, last_sync_timestamp
                 FROM sync_metadata WHERE workspace_id = ?1 AND base_id = ?2",
                params![workspace_id, base_id],
                |row| {
                    Ok(SyncCursor {
                        workspace_id: row.get(0)?,
                        base_id: row.get(1)?,
                        last_event_id: row.get::<_, i64>(2)? as u64,
                        last_sync_timestamp: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(|e| MetaSyncError::Database(format!("读取同步游标失败: {}", e)))?;
        Ok(cursor)
    }

    /// upsert 游标，冲突时合并
    ///
    /// last_event_id 单调不回退：实时推送与增量拉取并发应用同一事件时，
    /// 任一路径都不能把游标往回拖。
    pub fn upsert(&self, workspace_id: &str, base_id: &str, event_id: u64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO sync_metadata (workspace_id, base_id, last_event_id, last_sync_timestamp)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(workspace_id, base_id) DO UPDATE SET
                     last_event_id = MAX(sync_metadata.last_event_id, excluded.last_event_id),
                     last_sync_timestamp = excluded.last_sync_timestamp",
                params![workspace_id, base_id, event_id as i64, now],
            )
            .map_err(|e| MetaSyncError::Database(format!("写入同步游标失败: {}", e)))?;
        Ok(())
    }
}
