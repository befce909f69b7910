//! 事件系统 - 同步生命周期与网络状态的统一事件总线
//!
//! 两种消费方式：
//! - `subscribe()`：拿 broadcast Receiver，适合异步任务循环处理
//! - `add_listener()`：注册回调闭包，适合 UI 桥接层
//!
//! 事件只描述已发生的事实，不携带控制语义。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::network::NetworkStatus;
use crate::storage::schema::Table;

/// 同步事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// 一轮同步开始，total 为本轮快照中的队列项数
    SyncStarted { total: usize },
    /// 单个队列项同步成功（进度事件）
    SyncProgress {
        table: Table,
        record_id: String,
        total: usize,
        completed: usize,
    },
    /// 单个队列项同步失败
    SyncItemFailed {
        table: Table,
        record_id: String,
        retries: u32,
        /// 本次失败是否首次越过重试预算
        retries_exhausted: bool,
        error: String,
    },
    /// 一轮同步结束
    SyncCompleted { total: usize, completed: usize },
    /// 网络状态变化
    NetworkStatusChanged { status: NetworkStatus },
    /// 本地有新的待同步变更入队
    MutationQueued { table: Table, record_id: String },
    /// 缓存层提示页面数据可能已过期（stale-while-revalidate 后台刷新完成）
    CacheRefreshed { cache_key: String },
}

impl SyncEvent {
    /// 事件类型名（日志与监听过滤用）
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::SyncStarted { .. } => "sync_started",
            SyncEvent::SyncProgress { .. } => "sync_progress",
            SyncEvent::SyncItemFailed { .. } => "sync_item_failed",
            SyncEvent::SyncCompleted { .. } => "sync_completed",
            SyncEvent::NetworkStatusChanged { .. } => "network_status_changed",
            SyncEvent::MutationQueued { .. } => "mutation_queued",
            SyncEvent::CacheRefreshed { .. } => "cache_refreshed",
        }
    }
}

/// 监听器句柄，用于取消注册
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// 事件管理器
///
/// broadcast 通道容量有限，慢消费者会丢事件（Lagged），
/// 回调监听器则同步执行，不应做耗时操作。
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: RwLock<HashMap<ListenerId, Listener>>,
    next_listener_id: AtomicU64,
}

impl EventManager {
    pub fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(256);
        Arc::new(Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 注册回调监听器，返回句柄用于取消
    pub fn add_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().insert(id, Box::new(callback));
        id
    }

    /// 取消监听器；句柄无效时返回 false
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.write().remove(&id).is_some()
    }

    /// 发布事件：先广播，再依次调用回调监听器
    pub fn emit(&self, event: SyncEvent) {
        debug!("📢 事件: {}", event.event_type());

        // 没有订阅者时 send 返回 Err，属正常情况
        let _ = self.sender.send(event.clone());

        let listeners = self.listeners.read();
        for listener in listeners.values() {
            listener(&event);
        }
    }

    /// 当前回调监听器数量
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }
}
