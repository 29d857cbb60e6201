//! 事件应用器 - 将 ChangeEvent 写入本地副本表
//!
//! 幂等性约束：
//! - insert 的行键取自 payload 自身主键（确定性），重放不产生重复行
//! - update / delete 按键匹配，重放天然幂等
//! - 行写入与游标推进在同一事务内提交，游标不会先于 apply 生效

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{MetaSyncError, Result};
use crate::protocol::{ChangeEvent, EventTarget, MetaOperation, MetaTable};
use super::cursor::SyncCursorDao;

/// 行键：成员表为 (base_id, fk_user_id)，其余表为 payload 主键 id
enum RecordKey {
    Id(String),
    FkUser(String),
}

fn value_to_key(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn resolve_key(table: MetaTable, payload: &serde_json::Value) -> Result<RecordKey> {
    if table.has_composite_key() {
        let fk = payload
            .get("fk_user_id")
            .and_then(value_to_key)
            .ok_or_else(|| {
                MetaSyncError::Apply(format!("{} payload 缺少 fk_user_id", table))
            })?;
        Ok(RecordKey::FkUser(fk))
    } else {
        let id = payload
            .get("id")
            .and_then(value_to_key)
            .ok_or_else(|| MetaSyncError::Apply(format!("{} payload 缺少主键 id", table)))?;
        Ok(RecordKey::Id(id))
    }
}

/// 浅合并：patch 中出现的列覆盖已有 payload 的同名列（部分更新语义）
fn merge_payload(
    existing: serde_json::Value,
    patch: &serde_json::Value,
) -> serde_json::Value {
    match (existing, patch) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(delta)) => {
            for (k, v) in delta {
                base.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(base)
        }
        (_, patch) => patch.clone(),
    }
}

/// 清空某 base 在一张表内的全部行，返回删除行数
pub(crate) fn wipe_base(conn: &Connection, table: MetaTable, base_id: &str) -> Result<usize> {
    let sql = format!("DELETE FROM {} WHERE base_id = ?1", table.as_str());
    let deleted = conn
        .execute(&sql, params![base_id])
        .map_err(|e| MetaSyncError::Database(format!("清空表 {} 失败: {}", table, e)))?;
    Ok(deleted)
}

/// 按 payload 主键 upsert 一行（bootstrap 与 insert 事件共用）
pub(crate) fn upsert_record(
    conn: &Connection,
    table: MetaTable,
    base_id: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    let now = Utc::now().timestamp_millis();
    let raw = serde_json::to_string(payload)?;
    // payload 自带 base_id 时以其为准（快照行本身已归属该 base）
    let row_base = payload
        .get("base_id")
        .and_then(value_to_key)
        .unwrap_or_else(|| base_id.to_string());

    match resolve_key(table, payload)? {
        RecordKey::Id(id) => {
            let sql = format!(
                "INSERT INTO {} (id, base_id, payload, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     base_id = excluded.base_id,
                     payload = excluded.payload,
                     updated_at = excluded.updated_at",
                table.as_str()
            );
            conn.execute(&sql, params![id, row_base, raw, now])
                .map_err(|e| MetaSyncError::Database(format!("写入 {} 失败: {}", table, e)))?;
        }
        RecordKey::FkUser(fk) => {
            let sql = format!(
                "INSERT INTO {} (base_id, fk_user_id, payload, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(base_id, fk_user_id) DO UPDATE SET
                     payload = excluded.payload,
                     updated_at = excluded.updated_at",
                table.as_str()
            );
            conn.execute(&sql, params![row_base, fk, raw, now])
                .map_err(|e| MetaSyncError::Database(format!("写入 {} 失败: {}", table, e)))?;
        }
    }
    Ok(())
}

fn apply_update(
    conn: &Connection,
    table: MetaTable,
    base_id: &str,
    payload: &serde_json::Value,
) -> Result<usize> {
    let now = Utc::now().timestamp_millis();
    match resolve_key(table, payload)? {
        RecordKey::Id(id) => {
            let select = format!(
                "SELECT payload FROM {} WHERE id = ?1 AND base_id = ?2",
                table.as_str()
            );
            let existing: Option<String> = conn
                .query_row(&select, params![id, base_id], |row| row.get(0))
                .optional()
                .map_err(|e| MetaSyncError::Database(format!("查询 {} 失败: {}", table, e)))?;
            let Some(existing) = existing else {
                // 无匹配行：与服务端 update 零行命中一致，不视为错误
                return Ok(0);
            };
            let merged = merge_payload(serde_json::from_str(&existing)?, payload);
            let update = format!(
                "UPDATE {} SET payload = ?1, updated_at = ?2 WHERE id = ?3 AND base_id = ?4",
                table.as_str()
            );
            let changed = conn
                .execute(&update, params![serde_json::to_string(&merged)?, now, id, base_id])
                .map_err(|e| MetaSyncError::Database(format!("更新 {} 失败: {}", table, e)))?;
            Ok(changed)
        }
        RecordKey::FkUser(fk) => {
            let select = format!(
                "SELECT payload FROM {} WHERE base_id = ?1 AND fk_user_id = ?2",
                table.as_str()
            );
            let existing: Option<String> = conn
                .query_row(&select, params![base_id, fk], |row| row.get(0))
                .optional()
                .map_err(|e| MetaSyncError::Database(format!("查询 {} 失败: {}", table, e)))?;
            let Some(existing) = existing else {
                return Ok(0);
            };
            let merged = merge_payload(serde_json::from_str(&existing)?, payload);
            let update = format!(
                "UPDATE {} SET payload = ?1, updated_at = ?2 WHERE base_id = ?3 AND fk_user_id = ?4",
                table.as_str()
            );
            let changed = conn
                .execute(&update, params![serde_json::to_string(&merged)?, now, base_id, fk])
                .map_err(|e| MetaSyncError::Database(format!("更新 {} 失败: {}", table, e)))?;
            Ok(changed)
        }
    }
}

fn apply_delete(
    conn: &Connection,
    table: MetaTable,
    base_id: &str,
    payload: &serde_json::Value,
) -> Result<usize> {
    let sql;
    let deleted = match resolve_key(table, payload)? {
        RecordKey::Id(id) => {
            sql = format!(
                "DELETE FROM {} WHERE id = ?1 AND base_id = ?2",
                table.as_str()
            );
            conn.execute(&sql, params![id, base_id])
        }
        RecordKey::FkUser(fk) => {
            sql = format!(
                "DELETE FROM {} WHERE base_id = ?1 AND fk_user_id = ?2",
                table.as_str()
            );
            conn.execute(&sql, params![base_id, fk])
        }
    }
    .map_err(|e| MetaSyncError::Database(format!("删除 {} 失败: {}", table, e)))?;
    Ok(deleted)
}

/// 应用单条变更事件：行写入 + 游标推进在同一事务内提交
///
/// 失败时事务回滚，游标保持原位，调用方可从游标做增量恢复。
pub fn apply_event(conn: &Connection, event: &ChangeEvent) -> Result<()> {
    let table = match &event.target {
        EventTarget::Known(t) => *t,
        EventTarget::Unsupported(name) => {
            return Err(MetaSyncError::UnsupportedTarget(name.clone()));
        }
    };

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| MetaSyncError::Database(format!("开启事务失败: {}", e)))?;

    match event.op {
        MetaOperation::Insert => {
            upsert_record(&tx, table, &event.base_id, &event.payload)?;
        }
        MetaOperation::Update => {
            let changed = apply_update(&tx, table, &event.base_id, &event.payload)?;
            if changed == 0 {
                debug!(
                    "update 事件无匹配行: table={} base={} event_id={}",
                    table, event.base_id, event.event_id
                );
            }
        }
        MetaOperation::Delete => {
            apply_delete(&tx, table, &event.base_id, &event.payload)?;
        }
    }

    SyncCursorDao::new(&tx).upsert(&event.workspace_id, &event.base_id, event.event_id)?;
    tx.commit()
        .map_err(|e| MetaSyncError::Database(format!("提交事务失败: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BootstrapTable;
    use crate::replica::ReplicaStore;
    use serde_json::json;
    use tempfile::TempDir;

    fn event(
        op: MetaOperation,
        target: &str,
        payload: serde_json::Value,
        event_id: u64,
    ) -> ChangeEvent {
        ChangeEvent {
            op,
            target: EventTarget::from(target),
            payload,
            event_id,
            workspace_id: "ws1".to_string(),
            base_id: "b1".to_string(),
            timestamp: Utc::now(),
        }
    }

    async fn open_store() -> (TempDir, ReplicaStore) {
        let dir = TempDir::new().unwrap();
        let store = ReplicaStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_bootstrap_then_update_scenario() {
        let (_dir, store) = open_store().await;
        let snapshot = vec![BootstrapTable {
            table: "columns".to_string(),
            records: vec![json!({"id": 1, "title": "Name"})],
        }];
        store.apply_bootstrap("b1", &snapshot, 1000).await.unwrap();

        store
            .apply_event(&event(
                MetaOperation::Update,
                "columns",
                json!({"id": 1, "title": "FullName"}),
                1,
            ))
            .await
            .unwrap();

        let records = store.list_records(MetaTable::Columns, "b1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["title"], "FullName");
        let cursor = store.cursor("ws1", "b1").await.unwrap().unwrap();
        assert_eq!(cursor.last_event_id, 1);
    }

    #[tokio::test]
    async fn test_unsupported_target_rejected_without_cursor_advance() {
        let (_dir, store) = open_store().await;
        let err = store
            .apply_event(&event(
                MetaOperation::Insert,
                "widgets",
                json!({"id": 1}),
                1,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, MetaSyncError::UnsupportedTarget(_)));
        assert!(store.cursor("ws1", "b1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_replay_does_not_duplicate() {
        let (_dir, store) = open_store().await;
        let ev = event(
            MetaOperation::Insert,
            "columns",
            json!({"id": 5, "title": "Status"}),
            3,
        );
        store.apply_event(&ev).await.unwrap();
        store.apply_event(&ev).await.unwrap();
        assert_eq!(store.count(MetaTable::Columns, "b1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sequence_applied_twice_is_idempotent() {
        let (_dir, store) = open_store().await;
        let sequence = vec![
            event(MetaOperation::Insert, "columns", json!({"id": 1, "title": "A"}), 1),
            event(MetaOperation::Insert, "columns", json!({"id": 2, "title": "B"}), 2),
            event(MetaOperation::Update, "columns", json!({"id": 1, "title": "A2"}), 3),
            event(MetaOperation::Delete, "columns", json!({"id": 2}), 4),
            event(MetaOperation::Insert, "views", json!({"id": "v1", "title": "Grid"}), 5),
        ];

        for ev in &sequence {
            store.apply_event(ev).await.unwrap();
        }
        let columns_once = store.list_records(MetaTable::Columns, "b1").await.unwrap();
        let views_once = store.list_records(MetaTable::Views, "b1").await.unwrap();
        let cursor_once = store.cursor("ws1", "b1").await.unwrap().unwrap();

        // 整个序列完整重放一遍，副本终态不变
        for ev in &sequence {
            store.apply_event(ev).await.unwrap();
        }
        assert_eq!(
            store.list_records(MetaTable::Columns, "b1").await.unwrap(),
            columns_once
        );
        assert_eq!(
            store.list_records(MetaTable::Views, "b1").await.unwrap(),
            views_once
        );
        assert_eq!(
            store.cursor("ws1", "b1").await.unwrap().unwrap().last_event_id,
            cursor_once.last_event_id
        );
    }

    #[tokio::test]
    async fn test_update_merges_partial_payload() {
        let (_dir, store) = open_store().await;
        store
            .apply_event(&event(
                MetaOperation::Insert,
                "views",
                json!({"id": "v1", "title": "Grid", "order": 1}),
                1,
            ))
            .await
            .unwrap();
        // 部分更新：未携带的列保持原值
        store
            .apply_event(&event(
                MetaOperation::Update,
                "views",
                json!({"id": "v1", "title": "Kanban"}),
                2,
            ))
            .await
            .unwrap();
        let records = store.list_records(MetaTable::Views, "b1").await.unwrap();
        assert_eq!(records[0]["title"], "Kanban");
        assert_eq!(records[0]["order"], 1);
    }

    #[tokio::test]
    async fn test_update_missing_row_is_noop_but_advances_cursor() {
        let (_dir, store) = open_store().await;
        store
            .apply_event(&event(
                MetaOperation::Update,
                "columns",
                json!({"id": 99, "title": "Ghost"}),
                7,
            ))
            .await
            .unwrap();
        assert_eq!(store.count(MetaTable::Columns, "b1").await.unwrap(), 0);
        assert_eq!(
            store.cursor("ws1", "b1").await.unwrap().unwrap().last_event_id,
            7
        );
    }

    #[tokio::test]
    async fn test_base_users_composite_key_roundtrip() {
        let (_dir, store) = open_store().await;
        store
            .apply_event(&event(
                MetaOperation::Insert,
                "base_users",
                json!({"fk_user_id": "u1", "roles": "editor"}),
                1,
            ))
            .await
            .unwrap();
        store
            .apply_event(&event(
                MetaOperation::Update,
                "base_users",
                json!({"fk_user_id": "u1", "roles": "owner"}),
                2,
            ))
            .await
            .unwrap();
        let records = store
            .list_records(MetaTable::BaseUsers, "b1")
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["roles"], "owner");

        store
            .apply_event(&event(
                MetaOperation::Delete,
                "base_users",
                json!({"fk_user_id": "u1"}),
                3,
            ))
            .await
            .unwrap();
        assert_eq!(store.count(MetaTable::BaseUsers, "b1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_missing_primary_key_fails() {
        let (_dir, store) = open_store().await;
        let err = store
            .apply_event(&event(
                MetaOperation::Insert,
                "columns",
                json!({"title": "NoId"}),
                1,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, MetaSyncError::Apply(_)));
        assert!(store.cursor("ws1", "b1").await.unwrap().is_none());
    }
}
