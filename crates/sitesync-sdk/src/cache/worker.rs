//! 缓存 worker - 独立后台任务中的请求拦截层
//!
//! 生命周期仿照后台拦截上下文：
//! - install：按种子列表预缓存应用外壳（入口页、shell 路由、manifest、图标）
//! - activate：立即接管，删除过期缓存代际，不等待旧实例
//! - fetch：经 mpsc 命令通道逐个处理，按请求类别套用缓存策略
//! - message：SKIP_WAITING（强制立即激活，幂等）与 CLEAR_CACHE 两条命令
//!
//! worker 不执行同步本身：需要同步时只向所有页面广播 SyncNeeded，
//! 实际重放永远交给页面侧的同步引擎。

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, SiteSyncSDKError};
use crate::events::{EventManager, SyncEvent};

use super::strategy::{self, CacheStrategy, FetchPlan};
use super::{CachedResponse, RequestCache, RequestCategory};

/// 网络抓取种子 - worker 的出网口
#[async_trait]
pub trait NetworkFetcher: Send + Sync {
    /// 发起请求并把响应固化为可缓存形式；网络层失败返回 Err
    async fn fetch(&self, method: &str, url: &str) -> Result<CachedResponse>;
}

/// 基于 reqwest 的生产实现
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| SiteSyncSDKError::Transport(format!("创建抓取客户端失败: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NetworkFetcher for HttpFetcher {
    async fn fetch(&self, method: &str, url: &str) -> Result<CachedResponse> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| SiteSyncSDKError::InvalidOperation(format!("非法请求方法: {}", e)))?;
        let resp = self
            .client
            .request(method, url)
            .send()
            .await
            .map_err(|e| SiteSyncSDKError::Transport(format!("网络请求失败: {}", e)))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| SiteSyncSDKError::Transport(format!("读取响应体失败: {}", e)))?
            .to_vec();

        Ok(CachedResponse {
            status,
            headers,
            body,
            stored_at: Utc::now().timestamp_millis(),
        })
    }
}

/// 发给 worker 的命令
pub enum CacheCommand {
    /// 拦截一个请求
    Fetch {
        method: String,
        url: String,
        respond_to: oneshot::Sender<Result<CachedResponse>>,
    },
    /// 强制立即激活（重复执行无害）
    SkipWaiting,
    /// 清空全部缓存
    ClearCache,
}

/// worker 广播给所有页面的通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageNotification {
    /// 有待同步的本地变更，页面应触发同步引擎
    SyncNeeded,
}

/// worker 配置
#[derive(Debug, Clone)]
pub struct CacheWorkerConfig {
    /// sled 缓存库目录
    pub cache_dir: PathBuf,
    /// install 阶段的预缓存种子列表
    pub precache_urls: Vec<String>,
    /// 远端数据服务域名（排除拦截）
    pub remote_host: Option<String>,
}

/// worker 句柄：命令入口 + 页面通知广播
pub struct CacheWorkerHandle {
    commands: mpsc::Sender<CacheCommand>,
    notifications: broadcast::Sender<PageNotification>,
    join: JoinHandle<()>,
}

impl CacheWorkerHandle {
    /// 拦截一个请求并等待响应
    pub async fn fetch(&self, method: &str, url: &str) -> Result<CachedResponse> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(CacheCommand::Fetch {
                method: method.to_string(),
                url: url.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| SiteSyncSDKError::ShuttingDown("缓存 worker 已退出".to_string()))?;
        rx.await
            .map_err(|_| SiteSyncSDKError::ShuttingDown("缓存 worker 未应答".to_string()))?
    }

    /// SKIP_WAITING 命令
    pub async fn skip_waiting(&self) -> Result<()> {
        self.commands
            .send(CacheCommand::SkipWaiting)
            .await
            .map_err(|_| SiteSyncSDKError::ShuttingDown("缓存 worker 已退出".to_string()))
    }

    /// CLEAR_CACHE 命令
    pub async fn clear_cache(&self) -> Result<()> {
        self.commands
            .send(CacheCommand::ClearCache)
            .await
            .map_err(|_| SiteSyncSDKError::ShuttingDown("缓存 worker 已退出".to_string()))
    }

    /// 订阅页面通知
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<PageNotification> {
        self.notifications.subscribe()
    }

    /// 向所有页面广播"需要同步"（后台同步注册的降级实现）
    pub fn notify_sync_needed(&self) {
        let receivers = self.notifications.receiver_count();
        debug!("📣 广播 SyncNeeded（{} 个页面在听）", receivers);
        let _ = self.notifications.send(PageNotification::SyncNeeded);
    }

    /// 关闭 worker：停收命令并等待退出
    pub async fn shutdown(self) {
        drop(self.commands);
        let _ = self.join.await;
    }
}

struct CacheWorker {
    cache: Arc<RequestCache>,
    fetcher: Arc<dyn NetworkFetcher>,
    events: Arc<EventManager>,
    remote_host: Option<String>,
}

impl CacheWorker {
    /// 启动 worker：install → activate → 进入命令循环
    pub fn spawn(
        config: CacheWorkerConfig,
        fetcher: Arc<dyn NetworkFetcher>,
        events: Arc<EventManager>,
    ) -> Result<CacheWorkerHandle> {
        let cache = Arc::new(RequestCache::open(&config.cache_dir)?);
        let (commands_tx, mut commands_rx) = mpsc::channel(64);
        let (notifications_tx, _) = broadcast::channel(16);

        let worker = CacheWorker {
            cache,
            fetcher,
            events,
            remote_host: config.remote_host,
        };
        let precache_urls = config.precache_urls;

        let join = tokio::spawn(async move {
            worker.install(&precache_urls).await;
            worker.activate();

            while let Some(command) = commands_rx.recv().await {
                match command {
                    CacheCommand::Fetch {
                        method,
                        url,
                        respond_to,
                    } => {
                        let result = worker.handle_fetch(&method, &url).await;
                        let _ = respond_to.send(result);
                    }
                    CacheCommand::SkipWaiting => {
                        info!("⏭️ 收到 SKIP_WAITING，立即重新激活");
                        worker.activate();
                    }
                    CacheCommand::ClearCache => {
                        if let Err(e) = worker.cache.clear_all() {
                            warn!("清空缓存失败: {}", e);
                        }
                    }
                }
            }
            debug!("缓存 worker 退出");
        });

        Ok(CacheWorkerHandle {
            commands: commands_tx,
            notifications: notifications_tx,
            join,
        })
    }

    /// install：预缓存种子列表，单条失败只告警不阻塞
    async fn install(&self, precache_urls: &[String]) {
        info!("📦 缓存 worker 安装，预缓存 {} 项", precache_urls.len());
        for url in precache_urls {
            match self.fetcher.fetch("GET", url).await {
                Ok(resp) if resp.is_success() => {
                    let kind = RequestCategory::classify("GET", url, self.remote_host.as_deref())
                        .cache_kind();
                    if let Err(e) = self.cache.put(kind, url, &resp) {
                        warn!("预缓存写入失败 {}: {}", url, e);
                    }
                }
                Ok(resp) => warn!("预缓存 {} 返回 {}，跳过", url, resp.status),
                Err(e) => warn!("预缓存 {} 失败: {}", url, e),
            }
        }
    }

    /// activate：清理过期代际，立即接管
    fn activate(&self) {
        match self.cache.cleanup_old_generations() {
            Ok(dropped) if dropped > 0 => info!("✅ 缓存 worker 激活，清理 {} 个旧代际", dropped),
            Ok(_) => info!("✅ 缓存 worker 激活"),
            Err(e) => warn!("激活清理失败: {}", e),
        }
    }

    async fn handle_fetch(&self, method: &str, url: &str) -> Result<CachedResponse> {
        let category = RequestCategory::classify(method, url, self.remote_host.as_deref());
        if category == RequestCategory::Excluded {
            // 排除的请求直连网络，错误原样上抛
            return self.fetcher.fetch(method, url).await;
        }

        let kind = category.cache_kind();
        let cached = self.cache.get(kind, url)?;
        let strategy = CacheStrategy::for_category(category);

        match strategy::plan(strategy, cached) {
            FetchPlan::ServeCached(hit) => {
                debug!("🎯 缓存命中 {}", url);
                Ok(hit)
            }
            FetchPlan::NeedNetwork { fallback } => {
                let network = self.fetcher.fetch(method, url).await.ok();
                let settled = strategy::settle(category, fallback, network);
                if settled.store {
                    self.cache.put(kind, url, &settled.response)?;
                }
                if settled.synthetic {
                    debug!("📴 离线合成响应 {} ({})", url, settled.response.status);
                }
                Ok(settled.response)
            }
            FetchPlan::ServeCachedAndRevalidate(hit) => {
                self.spawn_revalidate(kind, url.to_string());
                Ok(hit)
            }
        }
    }

    /// 后台刷新：成功且 2xx 才覆盖缓存，之后发 CacheRefreshed 事件
    fn spawn_revalidate(&self, kind: super::CacheKind, url: String) {
        let cache = self.cache.clone();
        let fetcher = self.fetcher.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            match fetcher.fetch("GET", &url).await {
                Ok(resp) if resp.is_success() => {
                    if let Err(e) = cache.put(kind, &url, &resp) {
                        warn!("后台刷新写入失败 {}: {}", url, e);
                        return;
                    }
                    events.emit(SyncEvent::CacheRefreshed {
                        cache_key: super::cache_key(&url),
                    });
                }
                Ok(resp) => debug!("后台刷新 {} 返回 {}，保留旧缓存", url, resp.status),
                Err(e) => debug!("后台刷新 {} 失败: {}", url, e),
            }
        });
    }
}

/// 组合根使用的启动入口
pub fn spawn_cache_worker(
    config: CacheWorkerConfig,
    fetcher: Arc<dyn NetworkFetcher>,
    events: Arc<EventManager>,
) -> Result<CacheWorkerHandle> {
    CacheWorker::spawn(config, fetcher, events)
}
