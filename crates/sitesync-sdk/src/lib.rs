//! SiteSync SDK - 离线优先的数据同步引擎
//!
//! 核心设计：
//! - 本地 SQLite 是权威数据源，UI 永远读写本地，远端只是异步副本
//! - 乐观写入：写本地 + 标记 pending + 变更入队，同一事务完成
//! - 同步引擎按入队顺序重放变更，失败项带重试预算，永不丢弃
//! - 网络状态由宿主注入或主动探测，离线→在线跳变自动触发同步
//! - 可选的后台缓存 worker 拦截应用资源请求，离线时兜底
//!
//! 使用方式（组合根模式，无全局单例）：
//!
//! ```no_run
//! use sitesync_sdk::{RestRemoteConfig, SiteSyncConfig, SiteSyncSDK, Table};
//!
//! # async fn demo() -> sitesync_sdk::Result<()> {
//! let config = SiteSyncConfig::builder(
//!     "/tmp/sitesync",
//!     RestRemoteConfig::new("https://api.sitesync.dev", "api-key"),
//! )
//! .build();
//!
//! let sdk = SiteSyncSDK::initialize(config).await?;
//! sdk.save_record(Table::Sites, "s1", serde_json::json!({"org_id": "o1"})).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod events;
pub mod network;
pub mod remote;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod version;

pub use error::{Result, SiteSyncSDKError};
pub use events::{EventManager, ListenerId, SyncEvent};
pub use network::{ConnectivityProbe, NetworkMonitor, NetworkStatus};
pub use remote::{RemoteDataService, RestRemoteConfig, RestRemoteService};
pub use sdk::{SiteSyncConfig, SiteSyncConfigBuilder, SiteSyncSDK};
pub use storage::entities::{EntityRecord, SyncAction, SyncQueueItem, SyncStatus};
pub use storage::schema::Table;
pub use storage::StorageManager;
pub use sync::{SyncEngine, SyncEngineStatus, SyncReport, MAX_SYNC_RETRIES};
pub use version::{SDK_DB_VERSION, SDK_VERSION};
