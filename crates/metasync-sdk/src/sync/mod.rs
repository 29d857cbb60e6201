//! 客户端同步层 - 状态机、bootstrap、增量拉取
//!
//! ## NOTE: 控制器不做重试
//!
//! SyncController does not retry. Bootstrap and catch-up failures are safely
//! retryable by the caller (re-activate / resume); live apply failures are
//! surfaced and recovered via catch-up from the last committed cursor.

pub mod api;
pub mod controller;

pub use api::{HttpSyncApi, SyncApi};
pub use controller::{SyncController, SyncState};
