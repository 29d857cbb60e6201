//! 元数据同步协议层 - 客户端/服务端共享的线上类型
//!
//! 包括：
//! - 受控的可复制表枚举（MetaTable，编译期闭合）
//! - 变更事件与推送帧（META_INSERT / META_UPDATE / META_DELETE）
//! - 订阅/退订请求与应答
//! - bootstrap 快照与增量拉取（sync-events）的请求/响应

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;

/// 可复制的元数据表（受控枚举，新增需客户端与服务端同步升级）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaTable {
    /// base/workspace 身份表：bootstrap 时只 upsert，永不清空
    Bases,
    Sources,
    Models,
    Columns,
    Filters,
    Sorts,
    Views,
    ViewColumns,
    Hooks,
    /// 成员表：复合主键 (base_id, fk_user_id)
    BaseUsers,
}

impl MetaTable {
    /// 全部可复制表，bootstrap 按此顺序逐表处理
    pub const ALL: &'static [MetaTable] = &[
        MetaTable::Bases,
        MetaTable::Sources,
        MetaTable::Models,
        MetaTable::Columns,
        MetaTable::Filters,
        MetaTable::Sorts,
        MetaTable::Views,
        MetaTable::ViewColumns,
        MetaTable::Hooks,
        MetaTable::BaseUsers,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bases => "bases",
            Self::Sources => "sources",
            Self::Models => "models",
            Self::Columns => "columns",
            Self::Filters => "filters",
            Self::Sorts => "sorts",
            Self::Views => "views",
            Self::ViewColumns => "view_columns",
            Self::Hooks => "hooks",
            Self::BaseUsers => "base_users",
        }
    }

    /// 是否使用复合主键 (base_id, fk_user_id)
    pub fn has_composite_key(self) -> bool {
        matches!(self, Self::BaseUsers)
    }

    /// bootstrap 时是否跳过清空（身份表只 upsert）
    pub fn is_identity_table(self) -> bool {
        matches!(self, Self::Bases)
    }
}

impl FromStr for MetaTable {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bases" => Ok(Self::Bases),
            "sources" => Ok(Self::Sources),
            "models" => Ok(Self::Models),
            "columns" => Ok(Self::Columns),
            "filters" => Ok(Self::Filters),
            "sorts" => Ok(Self::Sorts),
            "views" => Ok(Self::Views),
            "view_columns" => Ok(Self::ViewColumns),
            "hooks" => Ok(Self::Hooks),
            "base_users" => Ok(Self::BaseUsers),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for MetaTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 事件目标表：受控枚举之外的表名保留原文，由 apply 侧显式拒绝
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTarget {
    Known(MetaTable),
    Unsupported(String),
}

impl EventTarget {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Known(t) => t.as_str(),
            Self::Unsupported(name) => name.as_str(),
        }
    }
}

impl From<MetaTable> for EventTarget {
    fn from(table: MetaTable) -> Self {
        Self::Known(table)
    }
}

impl From<&str> for EventTarget {
    fn from(name: &str) -> Self {
        match MetaTable::from_str(name) {
            Ok(t) => Self::Known(t),
            Err(()) => Self::Unsupported(name.to_string()),
        }
    }
}

impl Serialize for EventTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(EventTarget::from(name.as_str()))
    }
}

/// 变更操作类型，同时是推送帧的事件名
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaOperation {
    #[serde(rename = "META_INSERT")]
    Insert,
    #[serde(rename = "META_UPDATE")]
    Update,
    #[serde(rename = "META_DELETE")]
    Delete,
}

impl MetaOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "META_INSERT",
            Self::Update => "META_UPDATE",
            Self::Delete => "META_DELETE",
        }
    }
}

impl std::fmt::Display for MetaOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次已提交的元数据变更
///
/// event_id 由服务端变更层按 (workspace_id, base_id) 单调分配，
/// 全序可比较，增量拉取按「大于该 id」取事件。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: MetaOperation,
    pub target: EventTarget,
    pub payload: serde_json::Value,
    pub event_id: u64,
    pub workspace_id: String,
    pub base_id: String,
    pub timestamp: DateTime<Utc>,
}

/// 推送帧正文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushBody {
    pub target: EventTarget,
    pub payload: serde_json::Value,
    pub event_id: u64,
    pub workspace_id: String,
    pub base_id: String,
}

/// 服务端 → 订阅连接的推送帧
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub op: MetaOperation,
    pub data: PushBody,
    pub timestamp: DateTime<Utc>,
}

impl PushMessage {
    pub fn from_event(event: &ChangeEvent) -> Self {
        Self {
            op: event.op,
            data: PushBody {
                target: event.target.clone(),
                payload: event.payload.clone(),
                event_id: event.event_id,
                workspace_id: event.workspace_id.clone(),
                base_id: event.base_id.clone(),
            },
            timestamp: event.timestamp,
        }
    }

    /// 还原为 ChangeEvent，客户端 apply 路径统一吃 ChangeEvent
    pub fn into_event(self) -> ChangeEvent {
        ChangeEvent {
            op: self.op,
            target: self.data.target,
            payload: self.data.payload,
            event_id: self.data.event_id,
            workspace_id: self.data.workspace_id,
            base_id: self.data.base_id,
            timestamp: self.timestamp,
        }
    }
}

/// 订阅/退订请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub workspace_id: String,
    pub base_id: String,
}

/// 订阅/退订应答：status 为 "subscribed" / "unsubscribed"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeAck {
    pub status: String,
    pub channel: String,
}

/// bootstrap 快照中的一张表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapTable {
    pub table: String,
    pub records: Vec<serde_json::Value>,
}

/// 增量拉取请求（POST /api/sync-events）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEventsRequest {
    pub workspace_id: String,
    pub base_id: String,
    pub since: u64,
    #[serde(rename = "sinceType")]
    pub since_type: String,
    pub offset: u64,
    pub limit: u64,
}

/// 增量拉取响应中的一条事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEventRow {
    pub id: u64,
    pub operation: MetaOperation,
    pub target: EventTarget,
    pub payload: serde_json::Value,
}

impl SyncEventRow {
    /// 升格为 ChangeEvent；增量事件的时间戳以应用时刻为准
    pub fn into_event(self, workspace_id: &str, base_id: &str) -> ChangeEvent {
        ChangeEvent {
            op: self.operation,
            target: self.target,
            payload: self.payload,
            event_id: self.id,
            workspace_id: workspace_id.to_string(),
            base_id: base_id.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// 频道键：META:{workspace_id}:{base_id}，确定性拼接
pub fn channel_name(workspace_id: &str, base_id: &str) -> String {
    format!("META:{}:{}", workspace_id, base_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn meta_table_as_str_and_from_str() {
        assert_eq!(MetaTable::Columns.as_str(), "columns");
        assert_eq!(MetaTable::BaseUsers.as_str(), "base_users");
        assert_eq!(MetaTable::from_str("columns").unwrap(), MetaTable::Columns);
        assert_eq!(
            MetaTable::from_str("view_columns").unwrap(),
            MetaTable::ViewColumns
        );
        assert!(MetaTable::from_str("nc_unknown").is_err());
        // ALL 与 from_str 闭合一致
        for &t in MetaTable::ALL {
            assert_eq!(MetaTable::from_str(t.as_str()).unwrap(), t);
        }
    }

    #[test]
    fn event_target_keeps_unknown_names() {
        assert_eq!(
            EventTarget::from("columns"),
            EventTarget::Known(MetaTable::Columns)
        );
        assert_eq!(
            EventTarget::from("widgets"),
            EventTarget::Unsupported("widgets".to_string())
        );
    }

    #[test]
    fn channel_name_format() {
        assert_eq!(channel_name("ws1", "b1"), "META:ws1:b1");
    }

    #[test]
    fn push_message_wire_shape() {
        let event = ChangeEvent {
            op: MetaOperation::Update,
            target: MetaTable::Columns.into(),
            payload: serde_json::json!({"id": 1, "title": "FullName"}),
            event_id: 7,
            workspace_id: "ws1".to_string(),
            base_id: "b1".to_string(),
            timestamp: Utc::now(),
        };
        let msg = PushMessage::from_event(&event);
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["type"], "META_UPDATE");
        assert_eq!(wire["data"]["target"], "columns");
        assert_eq!(wire["data"]["event_id"], 7);

        let back: PushMessage = serde_json::from_value(wire).unwrap();
        let restored = back.into_event();
        assert_eq!(restored.event_id, 7);
        assert_eq!(restored.target, EventTarget::Known(MetaTable::Columns));
    }
}
