//! 远端数据服务 - 变更重放与数据拉取的出口
//!
//! `RemoteDataService` 是同步引擎依赖的唯一远端接口，
//! 生产实现走 REST（PostgREST 风格路由），测试用内存 Mock。

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, SiteSyncSDKError};
use crate::storage::entities::{SyncAction, SyncQueueItem};
use crate::storage::schema::Table;

/// 远端数据服务接口
#[async_trait]
pub trait RemoteDataService: Send + Sync {
    /// 把一个队列项重放到远端。
    /// 成功返回 Ok；失败统一返回 Err，由同步引擎按重试预算处理。
    async fn apply(&self, item: &SyncQueueItem) -> Result<()>;

    /// 拉取某表的全量数据（初始同步 / 手动刷新用）
    async fn fetch_all(&self, table: Table) -> Result<Vec<(String, serde_json::Value)>>;
}

/// REST 远端服务配置
#[derive(Debug, Clone)]
pub struct RestRemoteConfig {
    /// 远端服务根地址，如 https://api.sitesync.dev
    pub base_url: String,
    /// API key（apikey 头）
    pub api_key: String,
    /// 用户访问令牌（Authorization: Bearer）
    pub access_token: Option<String>,
    /// 单请求超时
    pub timeout: Duration,
}

impl RestRemoteConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            access_token: None,
            timeout: Duration::from_secs(15),
        }
    }

    /// 健康端点（连通性探测用）
    pub fn health_url(&self) -> String {
        format!("{}/rest/v1/", self.base_url.trim_end_matches('/'))
    }
}

/// 基于 reqwest 的 REST 实现
pub struct RestRemoteService {
    client: reqwest::Client,
    config: RestRemoteConfig,
}

impl RestRemoteService {
    pub fn new(config: RestRemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SiteSyncSDKError::Transport(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { client, config })
    }

    fn table_url(&self, table: Table) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            table.name()
        )
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let req = req.header("apikey", &self.config.api_key);
        match &self.config.access_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// 统一响应处理：连接层错误归 Transport，HTTP 错误状态归 Remote
    async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(SiteSyncSDKError::Remote {
            status: status.as_u16(),
            message,
        })
    }

    fn transport_err(e: reqwest::Error) -> SiteSyncSDKError {
        if e.is_timeout() {
            SiteSyncSDKError::Timeout(format!("远端请求超时: {}", e))
        } else {
            SiteSyncSDKError::Transport(format!("远端请求失败: {}", e))
        }
    }
}

#[async_trait]
impl RemoteDataService for RestRemoteService {
    async fn apply(&self, item: &SyncQueueItem) -> Result<()> {
        let url = self.table_url(item.table);
        debug!("🔄 重放 {} {}/{}", item.action, item.table, item.record_id);

        let resp = match item.action {
            SyncAction::Create => {
                let body = item.data.as_ref().ok_or_else(|| {
                    SiteSyncSDKError::InvalidOperation("create 队列项缺少载荷".to_string())
                })?;
                self.with_auth(self.client.post(&url))
                    .json(body)
                    .send()
                    .await
                    .map_err(Self::transport_err)?
            }
            SyncAction::Update => {
                let body = item.data.as_ref().ok_or_else(|| {
                    SiteSyncSDKError::InvalidOperation("update 队列项缺少载荷".to_string())
                })?;
                self.with_auth(self.client.patch(&url))
                    .query(&[("id", format!("eq.{}", item.record_id))])
                    .json(body)
                    .send()
                    .await
                    .map_err(Self::transport_err)?
            }
            SyncAction::Delete => self
                .with_auth(self.client.delete(&url))
                .query(&[("id", format!("eq.{}", item.record_id))])
                .send()
                .await
                .map_err(Self::transport_err)?,
        };

        Self::check_response(resp).await?;
        Ok(())
    }

    async fn fetch_all(&self, table: Table) -> Result<Vec<(String, serde_json::Value)>> {
        let url = self.table_url(table);
        let resp = self
            .with_auth(self.client.get(&url))
            .query(&[("select", "*")])
            .send()
            .await
            .map_err(Self::transport_err)?;
        let resp = Self::check_response(resp).await?;

        let rows: Vec<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| SiteSyncSDKError::Serialization(format!("解析远端响应失败: {}", e)))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    SiteSyncSDKError::Serialization(format!("远端 {} 行缺少 id 字段", table))
                })?
                .to_string();
            records.push((id, row));
        }
        Ok(records)
    }
}
