//! 同步拉取通道 - bootstrap 快照与增量事件的获取接缝
//!
//! HttpSyncApi 为默认实现：认证凭证随 xc-auth 头携带。

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use crate::config::MetaSyncConfig;
use crate::error::{MetaSyncError, Result};
use crate::protocol::{BootstrapTable, SyncEventRow, SyncEventsRequest};

/// 拉取接缝：bootstrap 全量快照 + 按游标分页的增量事件
#[async_trait]
pub trait SyncApi: Send + Sync {
    async fn fetch_bootstrap(
        &self,
        workspace_id: &str,
        base_id: &str,
    ) -> Result<Vec<BootstrapTable>>;

    async fn fetch_events(&self, request: &SyncEventsRequest) -> Result<Vec<SyncEventRow>>;
}

/// HTTP 实现
#[derive(Debug)]
pub struct HttpSyncApi {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl HttpSyncApi {
    pub fn new(
        base_url: &str,
        auth_token: &str,
        connect_timeout_secs: Option<u64>,
        request_timeout_secs: Option<u64>,
    ) -> Result<Self> {
        if base_url.is_empty() {
            return Err(MetaSyncError::Config("api_base_url 不能为空".to_string()));
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }
        if let Some(timeout) = request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }
        let client = builder
            .build()
            .map_err(|e| MetaSyncError::Http(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ 同步 HTTP 客户端已创建 (base_url: {})", base_url);
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.to_string(),
        })
    }

    pub fn from_config(config: &MetaSyncConfig) -> Result<Self> {
        let base_url = config
            .api_base_url
            .as_deref()
            .ok_or_else(|| MetaSyncError::Config("未配置 api_base_url".to_string()))?;
        Self::new(
            base_url,
            &config.auth_token,
            config.connect_timeout_secs,
            config.request_timeout_secs,
        )
    }
}

#[async_trait]
impl SyncApi for HttpSyncApi {
    async fn fetch_bootstrap(
        &self,
        _workspace_id: &str,
        base_id: &str,
    ) -> Result<Vec<BootstrapTable>> {
        let url = format!("{}/api/v2/meta/{}/bootstrap", self.base_url, base_id);
        let response = self
            .client
            .get(&url)
            .header("xc-auth", self.auth_token.as_str())
            .send()
            .await
            .map_err(|e| MetaSyncError::Http(format!("bootstrap 请求失败: {}", e)))?
            .error_for_status()
            .map_err(|e| MetaSyncError::Http(format!("bootstrap 响应异常: {}", e)))?;

        response
            .json::<Vec<BootstrapTable>>()
            .await
            .map_err(|e| MetaSyncError::Http(format!("解析 bootstrap 响应失败: {}", e)))
    }

    async fn fetch_events(&self, request: &SyncEventsRequest) -> Result<Vec<SyncEventRow>> {
        let url = format!("{}/api/sync-events", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("xc-auth", self.auth_token.as_str())
            .json(request)
            .send()
            .await
            .map_err(|e| MetaSyncError::Http(format!("sync-events 请求失败: {}", e)))?
            .error_for_status()
            .map_err(|e| MetaSyncError::Http(format!("sync-events 响应异常: {}", e)))?;

        response
            .json::<Vec<SyncEventRow>>()
            .await
            .map_err(|e| MetaSyncError::Http(format!("解析 sync-events 响应失败: {}", e)))
    }
}
