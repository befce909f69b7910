//! SDK 入口 - 显式组合根
//!
//! 这里不设任何全局单例：宿主创建配置、调用 `initialize`，
//! 得到一个持有全部组件的 `SiteSyncSDK` 实例，自行决定共享方式。
//! 所有组件间的依赖都在本文件内显式装配。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cache::worker::{
    spawn_cache_worker, CacheWorkerConfig, CacheWorkerHandle, HttpFetcher, NetworkFetcher,
};
use crate::error::{Result, SiteSyncSDKError};
use crate::events::{EventManager, ListenerId, SyncEvent};
use crate::network::{HttpConnectivityProbe, NetworkMonitor, NetworkStatus};
use crate::remote::{RemoteDataService, RestRemoteConfig, RestRemoteService};
use crate::storage::entities::EntityRecord;
use crate::storage::schema::Table;
use crate::storage::StorageManager;
use crate::sync::{SyncEngine, SyncEngineStatus, SyncReport};

/// SDK 配置
#[derive(Debug, Clone)]
pub struct SiteSyncConfig {
    /// 本地数据目录（SQLite 库与 sled 缓存都放这里）
    pub data_dir: PathBuf,
    /// 远端服务配置
    pub remote: RestRemoteConfig,
    /// 自动同步间隔；None 表示不启动自动同步
    pub auto_sync_interval: Option<Duration>,
    /// 主动连通性探测间隔；None 表示只依赖宿主注入的网络状态
    pub probe_interval: Option<Duration>,
    /// 是否启动后台缓存 worker
    pub enable_cache_worker: bool,
    /// 缓存 worker 的预缓存种子列表
    pub precache_urls: Vec<String>,
}

impl SiteSyncConfig {
    pub fn builder(data_dir: impl Into<PathBuf>, remote: RestRemoteConfig) -> SiteSyncConfigBuilder {
        SiteSyncConfigBuilder {
            config: SiteSyncConfig {
                data_dir: data_dir.into(),
                remote,
                auto_sync_interval: Some(Duration::from_secs(30)),
                probe_interval: None,
                enable_cache_worker: false,
                precache_urls: Vec::new(),
            },
        }
    }
}

/// 配置构建器
pub struct SiteSyncConfigBuilder {
    config: SiteSyncConfig,
}

impl SiteSyncConfigBuilder {
    pub fn auto_sync_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.auto_sync_interval = interval;
        self
    }

    pub fn probe_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.probe_interval = interval;
        self
    }

    pub fn cache_worker(mut self, precache_urls: Vec<String>) -> Self {
        self.config.enable_cache_worker = true;
        self.config.precache_urls = precache_urls;
        self
    }

    pub fn build(self) -> SiteSyncConfig {
        self.config
    }
}

/// SDK 实例 - 全部组件的持有者
pub struct SiteSyncSDK {
    config: SiteSyncConfig,
    storage: Arc<StorageManager>,
    events: Arc<EventManager>,
    network: Arc<NetworkMonitor>,
    remote: Arc<dyn RemoteDataService>,
    engine: Arc<SyncEngine>,
    cache_worker: Option<CacheWorkerHandle>,
}

impl SiteSyncSDK {
    /// 初始化 SDK：装配全部组件并按配置启动后台任务
    pub async fn initialize(config: SiteSyncConfig) -> Result<Self> {
        let remote = Arc::new(RestRemoteService::new(config.remote.clone())?);
        Self::initialize_with_remote(config, remote).await
    }

    /// 注入自定义远端实现的初始化入口（测试、或非 REST 后端）
    pub async fn initialize_with_remote(
        config: SiteSyncConfig,
        remote: Arc<dyn RemoteDataService>,
    ) -> Result<Self> {
        info!("🚀 SiteSync SDK 初始化，数据目录: {:?}", config.data_dir);

        let storage = Arc::new(StorageManager::new(&config.data_dir).await?);
        let events = EventManager::new();
        let network = NetworkMonitor::new(events.clone());

        let engine = SyncEngine::new(
            storage.clone(),
            remote.clone(),
            network.clone(),
            events.clone(),
        );

        if let Some(interval) = config.probe_interval {
            let probe = Arc::new(HttpConnectivityProbe::new(config.remote.health_url())?);
            network.start_probing(probe, interval);
        }

        if let Some(interval) = config.auto_sync_interval {
            engine.start_auto_sync(interval);
        }

        let cache_worker = if config.enable_cache_worker {
            let fetcher: Arc<dyn NetworkFetcher> = Arc::new(HttpFetcher::new()?);
            let remote_host = reqwest::Url::parse(&config.remote.base_url)
                .ok()
                .and_then(|u| u.host_str().map(String::from));
            let handle = spawn_cache_worker(
                CacheWorkerConfig {
                    cache_dir: config.data_dir.join("cache"),
                    precache_urls: config.precache_urls.clone(),
                    remote_host,
                },
                fetcher,
                events.clone(),
            )?;
            Some(handle)
        } else {
            None
        };

        Ok(Self {
            config,
            storage,
            events,
            network,
            remote,
            engine,
            cache_worker,
        })
    }

    // ========== 本地读写（离线优先：永远先落本地） ==========

    /// 保存记录：本地乐观写入 + 入队，在线时顺手触发一轮同步
    pub async fn save_record(
        &self,
        table: Table,
        id: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let item = self.storage.save_pending(table, id, data).await?;
        self.events.emit(SyncEvent::MutationQueued {
            table,
            record_id: item.record_id,
        });

        if self.network.is_online() {
            let engine = self.engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.sync().await {
                    warn!("写入后同步失败: {}", e);
                }
            });
        }
        Ok(())
    }

    /// 删除记录：本地删除 + delete 入队
    pub async fn delete_record(&self, table: Table, id: &str) -> Result<()> {
        let item = self.storage.delete_pending(table, id).await?;
        self.events.emit(SyncEvent::MutationQueued {
            table,
            record_id: item.record_id,
        });

        if self.network.is_online() {
            let engine = self.engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.sync().await {
                    warn!("删除后同步失败: {}", e);
                }
            });
        }
        Ok(())
    }

    pub async fn get_all(&self, table: Table) -> Result<Vec<EntityRecord>> {
        self.storage.get_all(table).await
    }

    pub async fn get_by_id(&self, table: Table, id: &str) -> Result<Option<EntityRecord>> {
        self.storage.get_by_id(table, id).await
    }

    pub async fn get_by_index(&self, table: Table, value: &str) -> Result<Vec<EntityRecord>> {
        self.storage.get_by_index(table, value).await
    }

    // ========== 同步控制 ==========

    /// 手动触发一轮同步
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.engine.sync().await
    }

    /// 同步状态投影
    pub async fn get_sync_status(&self) -> Result<SyncEngineStatus> {
        self.engine.get_status().await
    }

    /// 重置失败项并重试
    pub async fn retry_failed(&self) -> Result<(usize, SyncReport)> {
        self.engine.retry_failed().await
    }

    /// 从远端全量拉取一张表并落库（synced 状态）
    pub async fn pull_table(&self, table: Table) -> Result<usize> {
        if !self.network.is_online() {
            return Err(SiteSyncSDKError::NotConnected(
                "离线状态无法拉取远端数据".to_string(),
            ));
        }
        let rows = self.remote.fetch_all(table).await?;
        self.storage.put_synced_batch(table, rows).await
    }

    // ========== 事件与网络 ==========

    /// 订阅事件流
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// 注册事件回调，返回句柄
    pub fn add_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.add_listener(callback)
    }

    /// 取消事件回调
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.events.remove_listener(id)
    }

    /// 宿主注入网络状态（平台网络回调的入口）
    pub fn report_network_status(&self, status: NetworkStatus) {
        self.network.report_status(status);
    }

    /// 当前网络状态
    pub fn network_status(&self) -> NetworkStatus {
        self.network.current()
    }

    /// 缓存 worker 句柄（未启用时为 None）
    pub fn cache_worker(&self) -> Option<&CacheWorkerHandle> {
        self.cache_worker.as_ref()
    }

    /// 数据目录
    pub fn data_dir(&self) -> &std::path::Path {
        &self.config.data_dir
    }

    /// 清空全部本地数据（登出）：先停自动同步避免清空期间 drain
    pub async fn reset_local_data(&self) -> Result<()> {
        self.engine.stop_auto_sync();
        self.storage.clear_all().await?;
        if let Some(worker) = &self.cache_worker {
            worker.clear_cache().await?;
        }
        Ok(())
    }

    /// 关闭 SDK：停掉全部后台任务
    pub async fn shutdown(mut self) -> Result<()> {
        info!("👋 SiteSync SDK 关闭");
        self.engine.stop_auto_sync();
        self.network.stop_probing();
        if let Some(worker) = self.cache_worker.take() {
            worker.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::MockRemote;
    use crate::storage::entities::SyncStatus;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> SiteSyncConfig {
        SiteSyncConfig::builder(
            dir.path(),
            RestRemoteConfig::new("https://api.sitesync.dev", "test-key"),
        )
        .auto_sync_interval(None)
        .build()
    }

    #[tokio::test]
    async fn test_offline_write_stays_local() {
        let dir = TempDir::new().unwrap();
        let remote = MockRemote::new();
        let sdk = SiteSyncSDK::initialize_with_remote(test_config(&dir), remote.clone())
            .await
            .unwrap();

        sdk.save_record(Table::Sites, "s1", json!({"org_id": "o1", "name": "库房"}))
            .await
            .unwrap();

        let record = sdk.get_by_id(Table::Sites, "s1").await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert!(remote.applied.lock().is_empty());

        let status = sdk.get_sync_status().await.unwrap();
        assert_eq!(status.pending_count, 1);
        assert!(!status.network.is_online());

        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_online_write_triggers_sync() {
        let dir = TempDir::new().unwrap();
        let remote = MockRemote::new();
        let sdk = SiteSyncSDK::initialize_with_remote(test_config(&dir), remote.clone())
            .await
            .unwrap();
        sdk.report_network_status(NetworkStatus::Online);

        sdk.save_record(Table::Tenants, "t1", json!({"site_id": "s1"}))
            .await
            .unwrap();

        // 写入后的同步是后台任务，轮询等它完成
        let mut drained = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if sdk.get_sync_status().await.unwrap().pending_count == 0 {
                drained = true;
                break;
            }
        }
        assert!(drained);
        assert_eq!(remote.applied_record_ids(), vec!["t1".to_string()]);

        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pull_table_requires_online() {
        let dir = TempDir::new().unwrap();
        let remote = MockRemote::new();
        remote.fetch_rows.lock().insert(
            Table::Sites,
            vec![("s1".to_string(), json!({"id": "s1", "org_id": "o1"}))],
        );
        let sdk = SiteSyncSDK::initialize_with_remote(test_config(&dir), remote.clone())
            .await
            .unwrap();

        assert!(sdk.pull_table(Table::Sites).await.is_err());

        sdk.report_network_status(NetworkStatus::Online);
        let pulled = sdk.pull_table(Table::Sites).await.unwrap();
        assert_eq!(pulled, 1);

        let record = sdk.get_by_id(Table::Sites, "s1").await.unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);

        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_sees_mutation_queued() {
        let dir = TempDir::new().unwrap();
        let sdk = SiteSyncSDK::initialize_with_remote(test_config(&dir), MockRemote::new())
            .await
            .unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let id = sdk.add_listener(move |event| {
            seen_clone.lock().push(event.event_type());
        });

        sdk.save_record(Table::Hazards, "h1", json!({"assessment_id": "a1"}))
            .await
            .unwrap();
        assert!(seen.lock().contains(&"mutation_queued"));
        assert!(sdk.remove_listener(id));

        sdk.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_local_data() {
        let dir = TempDir::new().unwrap();
        let sdk = SiteSyncSDK::initialize_with_remote(test_config(&dir), MockRemote::new())
            .await
            .unwrap();

        sdk.save_record(Table::Sites, "s1", json!({"org_id": "o1"}))
            .await
            .unwrap();
        sdk.reset_local_data().await.unwrap();

        assert!(sdk.get_all(Table::Sites).await.unwrap().is_empty());
        assert_eq!(sdk.get_sync_status().await.unwrap().pending_count, 0);

        sdk.shutdown().await.unwrap();
    }
}
