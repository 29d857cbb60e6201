//! 本地副本存储 - 每个可复制元数据表一张 SQLite 表
//!
//! 分层设计：
//! - ReplicaStore: 统一入口，持有连接并负责建表 / bootstrap 落库
//! - apply: 事件应用（insert / update / delete + 游标推进）
//! - cursor: sync_metadata 游标表访问
//!
//! 行存储为「主键列 + JSON payload」文档式结构：update 事件按
//! 列合并语义合入已有 payload，与服务端部分更新行为一致。

pub mod apply;
pub mod cursor;

use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{MetaSyncError, Result};
use crate::protocol::{BootstrapTable, ChangeEvent, MetaTable};

pub use cursor::{SyncCursor, SyncCursorDao};

/// 客户端本地副本存储
#[derive(Debug)]
pub struct ReplicaStore {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl ReplicaStore {
    /// 打开（或创建）副本数据库并初始化表结构
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| MetaSyncError::IO(format!("创建副本数据目录失败: {}", e)))?;
        let db_path = data_dir.join("meta_replica.db");

        let conn = Connection::open(&db_path)
            .map_err(|e| MetaSyncError::Database(format!("打开副本数据库失败: {}", e)))?;

        // 启用 WAL 模式和其他优化
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| MetaSyncError::Database(format!("设置 WAL 模式失败: {}", e)))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| MetaSyncError::Database(format!("设置同步模式失败: {}", e)))?;
        conn.pragma_update(None, "cache_size", "-16000")
            .map_err(|e| MetaSyncError::Database(format!("设置缓存大小失败: {}", e)))?;

        Self::create_tables(&conn)?;
        info!("副本数据库初始化完成: {}", db_path.display());

        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn create_tables(conn: &Connection) -> Result<()> {
        for &table in MetaTable::ALL {
            let sql = if table.has_composite_key() {
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        base_id TEXT NOT NULL,
                        fk_user_id TEXT NOT NULL,
                        payload TEXT NOT NULL,
                        updated_at INTEGER NOT NULL,
                        PRIMARY KEY (base_id, fk_user_id)
                    )",
                    table.as_str()
                )
            } else {
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        id TEXT NOT NULL PRIMARY KEY,
                        base_id TEXT NOT NULL,
                        payload TEXT NOT NULL,
                        updated_at INTEGER NOT NULL
                    )",
                    table.as_str()
                )
            };
            conn.execute(&sql, [])
                .map_err(|e| MetaSyncError::Database(format!("创建表 {} 失败: {}", table, e)))?;

            if !table.has_composite_key() {
                conn.execute(
                    &format!(
                        "CREATE INDEX IF NOT EXISTS idx_{t}_base_id ON {t}(base_id)",
                        t = table.as_str()
                    ),
                    [],
                )
                .map_err(|e| MetaSyncError::Database(format!("创建索引失败: {}", e)))?;
            }
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_metadata (
                workspace_id TEXT NOT NULL,
                base_id TEXT NOT NULL,
                last_event_id INTEGER NOT NULL,
                last_sync_timestamp TEXT NOT NULL,
                PRIMARY KEY (workspace_id, base_id)
            )",
            [],
        )
        .map_err(|e| MetaSyncError::Database(format!("创建 sync_metadata 表失败: {}", e)))?;

        Ok(())
    }

    /// 全量快照落库：逐表「清空本 base 范围 → 分批插入」
    ///
    /// 身份表（bases）只 upsert 不清空；快照中缺失的表保持原样，仅告警。
    /// 失败时副本可能处于批次中间状态，调用方应整体重跑 bootstrap。
    pub async fn apply_bootstrap(
        &self,
        base_id: &str,
        snapshot: &[BootstrapTable],
        batch_size: usize,
    ) -> Result<usize> {
        let conn = self.conn.lock().await;
        let mut total = 0usize;

        for &table in MetaTable::ALL {
            let entry = snapshot.iter().find(|t| t.table == table.as_str());
            let Some(entry) = entry else {
                warn!("bootstrap 快照缺少表 {}，保持本地原样", table);
                continue;
            };

            if !table.is_identity_table() {
                apply::wipe_base(&conn, table, base_id)?;
            }

            for chunk in entry.records.chunks(batch_size.max(1)) {
                let tx = conn
                    .unchecked_transaction()
                    .map_err(|e| MetaSyncError::Database(format!("开启事务失败: {}", e)))?;
                for record in chunk {
                    apply::upsert_record(&tx, table, base_id, record)?;
                }
                tx.commit()
                    .map_err(|e| MetaSyncError::Database(format!("提交事务失败: {}", e)))?;
                total += chunk.len();
            }
        }

        info!("bootstrap 落库完成: base={} 共 {} 条", base_id, total);
        Ok(total)
    }

    /// 应用单条变更事件并推进游标（同一事务内提交）
    pub async fn apply_event(&self, event: &ChangeEvent) -> Result<()> {
        let conn = self.conn.lock().await;
        apply::apply_event(&conn, event)
    }

    /// 读取某 (workspace, base) 的同步游标
    pub async fn cursor(&self, workspace_id: &str, base_id: &str) -> Result<Option<SyncCursor>> {
        let conn = self.conn.lock().await;
        SyncCursorDao::new(&conn).get(workspace_id, base_id)
    }

    /// 按表读取 base 范围内的全部记录（payload 形式）
    pub async fn list_records(
        &self,
        table: MetaTable,
        base_id: &str,
    ) -> Result<Vec<serde_json::Value>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT payload FROM {} WHERE base_id = ?1", table.as_str());
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![base_id], |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for raw in rows {
            let raw = raw.map_err(|e| MetaSyncError::Database(format!("读取记录失败: {}", e)))?;
            records.push(serde_json::from_str(&raw)?);
        }
        Ok(records)
    }

    /// base 范围内某表的行数
    pub async fn count(&self, table: MetaTable, base_id: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE base_id = ?1",
            table.as_str()
        );
        let count: u64 = conn
            .query_row(&sql, params![base_id], |row| row.get(0))
            .map_err(|e| MetaSyncError::Database(format!("统计行数失败: {}", e)))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, ReplicaStore) {
        let dir = TempDir::new().unwrap();
        let store = ReplicaStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_open_creates_all_tables() {
        let (_dir, store) = open_store().await;
        let conn = store.conn.lock().await;
        for &table in MetaTable::ALL {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1)",
                    params![table.as_str()],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "missing table {}", table);
        }
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='sync_metadata')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(exists);
    }

    #[tokio::test]
    async fn test_bootstrap_wipes_then_reloads() {
        let (_dir, store) = open_store().await;

        let first = vec![BootstrapTable {
            table: "columns".to_string(),
            records: vec![json!({"id": 1, "title": "Name"}), json!({"id": 2, "title": "Age"})],
        }];
        store.apply_bootstrap("b1", &first, 1000).await.unwrap();
        assert_eq!(store.count(MetaTable::Columns, "b1").await.unwrap(), 2);

        // 重跑 bootstrap：旧行被清空，不会累积
        let second = vec![BootstrapTable {
            table: "columns".to_string(),
            records: vec![json!({"id": 3, "title": "Email"})],
        }];
        store.apply_bootstrap("b1", &second, 1000).await.unwrap();
        assert_eq!(store.count(MetaTable::Columns, "b1").await.unwrap(), 1);
        let records = store.list_records(MetaTable::Columns, "b1").await.unwrap();
        assert_eq!(records[0]["id"], 3);
    }

    #[tokio::test]
    async fn test_bootstrap_scopes_wipe_to_base() {
        let (_dir, store) = open_store().await;

        let b1 = vec![BootstrapTable {
            table: "views".to_string(),
            records: vec![json!({"id": "v1"})],
        }];
        store.apply_bootstrap("b1", &b1, 1000).await.unwrap();

        let b2 = vec![BootstrapTable {
            table: "views".to_string(),
            records: vec![json!({"id": "v2"})],
        }];
        store.apply_bootstrap("b2", &b2, 1000).await.unwrap();

        // b2 的 bootstrap 不影响 b1 的行
        assert_eq!(store.count(MetaTable::Views, "b1").await.unwrap(), 1);
        assert_eq!(store.count(MetaTable::Views, "b2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_upserts_identity_table() {
        let (_dir, store) = open_store().await;

        let first = vec![BootstrapTable {
            table: "bases".to_string(),
            records: vec![json!({"id": "b1", "title": "Old"})],
        }];
        store.apply_bootstrap("b1", &first, 1000).await.unwrap();

        let second = vec![BootstrapTable {
            table: "bases".to_string(),
            records: vec![json!({"id": "b1", "title": "New"})],
        }];
        store.apply_bootstrap("b1", &second, 1000).await.unwrap();

        let records = store.list_records(MetaTable::Bases, "b1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["title"], "New");
    }

    #[tokio::test]
    async fn test_bootstrap_missing_table_left_untouched() {
        let (_dir, store) = open_store().await;

        let first = vec![BootstrapTable {
            table: "hooks".to_string(),
            records: vec![json!({"id": "h1"})],
        }];
        store.apply_bootstrap("b1", &first, 1000).await.unwrap();

        // 快照中没有 hooks 表：本地行保持原样
        let second = vec![BootstrapTable {
            table: "columns".to_string(),
            records: vec![json!({"id": 1})],
        }];
        store.apply_bootstrap("b1", &second, 1000).await.unwrap();
        assert_eq!(store.count(MetaTable::Hooks, "b1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_batches_large_snapshot() {
        let (_dir, store) = open_store().await;
        let records: Vec<_> = (0..2500).map(|i| json!({"id": i, "title": format!("c{}", i)})).collect();
        let snapshot = vec![BootstrapTable {
            table: "columns".to_string(),
            records,
        }];
        // batch_size=1000 时 2500 条分 3 批写入
        let total = store.apply_bootstrap("b1", &snapshot, 1000).await.unwrap();
        assert_eq!(total, 2500);
        assert_eq!(store.count(MetaTable::Columns, "b1").await.unwrap(), 2500);
    }
}
