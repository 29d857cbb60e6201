//! SDK 配置 - builder 风格
//!
//! data_dir 为副本数据库所在目录；api_base_url 缺省时走进程内回环
//! 拉取通道（嵌入模式），配置后使用 HTTP 拉取。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{MetaSyncError, Result};

/// 增量拉取默认页大小（与服务端一致）
pub const DEFAULT_CATCH_UP_PAGE_SIZE: u64 = 1000;
/// bootstrap 落库默认批大小
pub const DEFAULT_BOOTSTRAP_BATCH_SIZE: usize = 1000;

/// SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaSyncConfig {
    /// 副本数据目录
    pub data_dir: PathBuf,
    /// 同步 API 基础地址（如 https://meta.example.com）；None 表示回环模式
    pub api_base_url: Option<String>,
    /// 握手与拉取共用的认证凭证（xc-auth）
    pub auth_token: String,
    /// 增量拉取页大小
    pub catch_up_page_size: u64,
    /// bootstrap 落库批大小
    pub bootstrap_batch_size: usize,
    /// HTTP 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// HTTP 请求超时（秒）
    pub request_timeout_secs: Option<u64>,
}

impl MetaSyncConfig {
    pub fn builder() -> MetaSyncConfigBuilder {
        MetaSyncConfigBuilder::default()
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct MetaSyncConfigBuilder {
    data_dir: Option<PathBuf>,
    api_base_url: Option<String>,
    auth_token: Option<String>,
    catch_up_page_size: Option<u64>,
    bootstrap_batch_size: Option<usize>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

impl MetaSyncConfigBuilder {
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn catch_up_page_size(mut self, size: u64) -> Self {
        self.catch_up_page_size = Some(size);
        self
    }

    pub fn bootstrap_batch_size(mut self, size: usize) -> Self {
        self.bootstrap_batch_size = Some(size);
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = Some(secs);
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = Some(secs);
        self
    }

    pub fn build(self) -> Result<MetaSyncConfig> {
        let data_dir = self
            .data_dir
            .ok_or_else(|| MetaSyncError::Config("data_dir 未配置".to_string()))?;
        let auth_token = self
            .auth_token
            .ok_or_else(|| MetaSyncError::Config("auth_token 未配置".to_string()))?;
        let catch_up_page_size = self.catch_up_page_size.unwrap_or(DEFAULT_CATCH_UP_PAGE_SIZE);
        if catch_up_page_size == 0 {
            return Err(MetaSyncError::Config(
                "catch_up_page_size 必须大于 0".to_string(),
            ));
        }
        Ok(MetaSyncConfig {
            data_dir,
            api_base_url: self.api_base_url,
            auth_token,
            catch_up_page_size,
            bootstrap_batch_size: self
                .bootstrap_batch_size
                .unwrap_or(DEFAULT_BOOTSTRAP_BATCH_SIZE),
            connect_timeout_secs: self.connect_timeout_secs,
            request_timeout_secs: self.request_timeout_secs,
        })
    }
}
