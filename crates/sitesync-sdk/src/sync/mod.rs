//! 同步引擎 - 待同步队列的重放调度
//!
//! 核心约束：
//! - 同一时刻最多一轮 drain（CAS 互斥，第二次调用直接空手返回）
//! - 离线短路：不在线就不读队列
//! - 快照语义：drain 只处理调用时刻的队列快照，期间新入队的变更等下一轮
//! - 单项失败不中断本轮，严格按 (timestamp, id) 顺序逐项重放
//! - 失败的项永不丢弃：累加 retries / 记录 last_error，等待重试或显式重置

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{EventManager, SyncEvent};
use crate::network::{NetworkMonitor, NetworkStatus};
use crate::remote::RemoteDataService;
use crate::storage::entities::SyncAction;
use crate::storage::StorageManager;

/// 最大重试次数：超过后不再视为常规待同步项，等待显式 retry_failed
pub const MAX_SYNC_RETRIES: u32 = 5;

/// 参考退避表（秒）：供外部调度器安排第 n 次重试的间隔。
/// 引擎自身在一轮 drain 内不做延时，重试间隔由周期定时器 / 网络恢复事件提供。
pub const RETRY_BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(60),
    Duration::from_secs(300),
];

/// 第 attempt 次失败后建议的等待时长（attempt 从 1 起，超表取末值）
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    let idx = (attempt.max(1) as usize - 1).min(RETRY_BACKOFF_SCHEDULE.len() - 1);
    RETRY_BACKOFF_SCHEDULE[idx]
}

/// 一轮 drain 的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// 本轮快照中的项数
    pub total: usize,
    /// 远端确认成功的项数
    pub success: usize,
    /// 本轮失败的项数
    pub failed: usize,
}

/// 对外的同步状态投影
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncEngineStatus {
    pub is_syncing: bool,
    pub network: NetworkStatus,
    /// 队列中的待同步项总数
    pub pending_count: usize,
    /// 已超出重试预算、等待 retry_failed 的项数
    pub exhausted_count: usize,
    /// 最近一轮 drain 的报告；尚未跑过任何一轮时为 None
    pub last_report: Option<SyncReport>,
}

/// 同步引擎
///
/// 依赖通过构造函数显式注入，不持有任何全局状态；
/// 宿主在组合根创建一个实例并自行共享 Arc。
pub struct SyncEngine {
    storage: Arc<StorageManager>,
    remote: Arc<dyn RemoteDataService>,
    network: Arc<NetworkMonitor>,
    events: Arc<EventManager>,
    /// drain 级互斥：true 表示有一轮正在进行
    is_syncing: AtomicBool,
    last_report: parking_lot::Mutex<Option<SyncReport>>,
    shutdown: Arc<Notify>,
    auto_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        storage: Arc<StorageManager>,
        remote: Arc<dyn RemoteDataService>,
        network: Arc<NetworkMonitor>,
        events: Arc<EventManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            remote,
            network,
            events,
            is_syncing: AtomicBool::new(false),
            last_report: parking_lot::Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
            auto_handle: parking_lot::Mutex::new(None),
        })
    }

    /// 执行一轮 drain
    ///
    /// 离线、或已有一轮在进行时，返回空报告且不触碰队列。
    pub async fn sync(&self) -> Result<SyncReport> {
        if !self.network.is_online() {
            debug!("⏸️ 当前离线，跳过本轮同步");
            return Ok(SyncReport::default());
        }

        // CAS 拿锁；拿不到说明另一轮正在进行
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("⏸️ 已有一轮同步在进行，跳过");
            return Ok(SyncReport::default());
        }

        let report = self.drain().await;
        self.is_syncing.store(false, Ordering::Release);
        if let Ok(report) = &report {
            *self.last_report.lock() = Some(*report);
        }
        report
    }

    /// 处理当前队列快照（调用方已持有 is_syncing 锁）
    async fn drain(&self) -> Result<SyncReport> {
        let snapshot = self.storage.queue_items().await?;
        let total = snapshot.len();
        if total == 0 {
            return Ok(SyncReport::default());
        }

        info!("🔄 开始同步，队列 {} 项", total);
        self.events.emit(SyncEvent::SyncStarted { total });

        let mut report = SyncReport {
            total,
            ..Default::default()
        };

        for item in snapshot {
            match self.remote.apply(&item).await {
                Ok(()) => {
                    self.storage.dequeue(&item.id).await?;
                    // delete 的本地行已不存在，无需改状态
                    if item.action != SyncAction::Delete {
                        self.storage.mark_synced(item.table, &item.record_id).await?;
                    }
                    report.success += 1;
                    self.events.emit(SyncEvent::SyncProgress {
                        table: item.table,
                        record_id: item.record_id.clone(),
                        total,
                        completed: report.success,
                    });
                }
                Err(e) => {
                    let error = e.to_string();
                    let retries = self.storage.mark_item_failed(&item.id, &error).await?;
                    // 首次越过预算才发耗尽事件，之后静默累加
                    let exhausted_now = retries == MAX_SYNC_RETRIES + 1;
                    if exhausted_now {
                        warn!(
                            "❌ {}/{} 重试预算耗尽（{} 次）: {}",
                            item.table, item.record_id, retries, error
                        );
                    } else {
                        debug!(
                            "⚠️ {}/{} 同步失败（第 {} 次）: {}",
                            item.table, item.record_id, retries, error
                        );
                    }
                    report.failed += 1;
                    self.events.emit(SyncEvent::SyncItemFailed {
                        table: item.table,
                        record_id: item.record_id.clone(),
                        retries,
                        retries_exhausted: exhausted_now,
                        error,
                    });
                }
            }
        }

        self.storage
            .set_meta(
                "last_sync_at",
                &chrono::Utc::now().timestamp_millis().to_string(),
            )
            .await?;

        info!(
            "✅ 本轮同步完成：成功 {}/{}，失败 {}",
            report.success, report.total, report.failed
        );
        self.events.emit(SyncEvent::SyncCompleted {
            total: report.total,
            completed: report.success,
        });
        Ok(report)
    }

    /// 当前状态投影（结合内存标志与实时队列统计）
    pub async fn get_status(&self) -> Result<SyncEngineStatus> {
        Ok(SyncEngineStatus {
            is_syncing: self.is_syncing.load(Ordering::Acquire),
            network: self.network.current(),
            pending_count: self.storage.queue_len().await?,
            exhausted_count: self.storage.exhausted_len(MAX_SYNC_RETRIES).await?,
            last_report: *self.last_report.lock(),
        })
    }

    /// 重置所有耗尽项并立刻触发一轮 drain
    ///
    /// 返回 (重置条数, 新一轮的报告)。
    pub async fn retry_failed(&self) -> Result<(usize, SyncReport)> {
        let reset = self.storage.reset_exhausted_items(MAX_SYNC_RETRIES).await?;
        if reset > 0 {
            info!("🔁 重置 {} 个失败项，重新同步", reset);
        }
        let report = self.sync().await?;
        Ok((reset, report))
    }

    /// 启动自动同步
    ///
    /// 三个触发源：启动时（在线则立即来一轮）、网络离线→在线跳变、周期定时器。
    pub fn start_auto_sync(self: &Arc<Self>, interval: Duration) {
        let mut guard = self.auto_handle.lock();
        if guard.is_some() {
            return;
        }

        let engine = self.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut network_rx = engine.network.watch();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval 的首个 tick 立即到期，承担"启动时先来一轮"
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.sync().await {
                            warn!("定时同步失败: {}", e);
                        }
                    }
                    changed = network_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let status = *network_rx.borrow_and_update();
                        if status.is_online() {
                            info!("🌐 网络恢复，触发同步");
                            if let Err(e) = engine.sync().await {
                                warn!("网络恢复后同步失败: {}", e);
                            }
                        }
                    }
                    _ = shutdown.notified() => {
                        debug!("自动同步任务退出");
                        break;
                    }
                }
            }
        });

        *guard = Some(handle);
        info!("⏰ 自动同步已启动，间隔 {:?}", interval);
    }

    /// 停止自动同步；未启动时为空操作
    pub fn stop_auto_sync(&self) {
        self.shutdown.notify_waiters();
        if let Some(handle) = self.auto_handle.lock().take() {
            handle.abort();
            info!("⏹️ 自动同步已停止");
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.auto_handle.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::MockRemote;
    use crate::storage::entities::SyncStatus;
    use crate::storage::schema::Table;
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        _guard: TempDir,
        storage: Arc<StorageManager>,
        remote: Arc<MockRemote>,
        network: Arc<NetworkMonitor>,
        events: Arc<EventManager>,
        engine: Arc<SyncEngine>,
    }

    async fn harness() -> Harness {
        let guard = TempDir::new().unwrap();
        let storage = Arc::new(StorageManager::new(guard.path()).await.unwrap());
        let remote = MockRemote::new();
        let events = EventManager::new();
        let network = NetworkMonitor::new(events.clone());
        let engine = SyncEngine::new(
            storage.clone(),
            remote.clone(),
            network.clone(),
            events.clone(),
        );
        Harness {
            _guard: guard,
            storage,
            remote,
            network,
            events,
            engine,
        }
    }

    // 一次 drain 清空队列，报告 success == N
    #[tokio::test]
    async fn test_drain_to_empty() {
        let h = harness().await;
        h.network.report_status(NetworkStatus::Online);

        for i in 0..4 {
            h.storage
                .save_pending(Table::Sites, &format!("s{}", i), json!({"org_id": "o1"}))
                .await
                .unwrap();
        }

        let report = h.engine.sync().await.unwrap();
        assert_eq!(report.total, 4);
        assert_eq!(report.success, 4);
        assert_eq!(report.failed, 0);
        assert_eq!(h.storage.queue_len().await.unwrap(), 0);

        let status = h.engine.get_status().await.unwrap();
        assert_eq!(status.last_report, Some(report));

        // 本地记录全部转为 synced
        for record in h.storage.get_all(Table::Sites).await.unwrap() {
            assert_eq!(record.sync_status, SyncStatus::Synced);
        }
    }

    // 持续失败：MAX+1 轮后 retries == MAX+1，项仍在队列，耗尽事件恰好一次
    #[tokio::test]
    async fn test_bounded_retry_and_single_exhaustion_event() {
        let h = harness().await;
        h.network.report_status(NetworkStatus::Online);
        let mut rx = h.events.subscribe();

        h.storage
            .save_pending(Table::Tenants, "t1", json!({"site_id": "s1"}))
            .await
            .unwrap();
        h.remote.fail_next("t1", u32::MAX);

        for _ in 0..(MAX_SYNC_RETRIES + 1) {
            let report = h.engine.sync().await.unwrap();
            assert_eq!(report.failed, 1);
        }

        let items = h.storage.queue_items().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].retries, MAX_SYNC_RETRIES + 1);
        assert!(items[0].last_error.is_some());

        // 再来两轮，确认不会重复发耗尽事件
        h.engine.sync().await.unwrap();
        h.engine.sync().await.unwrap();

        let mut exhaustion_events = 0;
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::SyncItemFailed {
                retries_exhausted: true,
                ..
            } = event
            {
                exhaustion_events += 1;
            }
        }
        assert_eq!(exhaustion_events, 1);
    }

    // 同一记录多次变更按入队顺序重放
    #[tokio::test]
    async fn test_replay_follows_queue_order() {
        let h = harness().await;
        h.network.report_status(NetworkStatus::Online);

        h.storage
            .save_pending(Table::Tenants, "t1", json!({"site_id": "s1", "v": 1}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        h.storage
            .save_pending(Table::Tenants, "t1", json!({"site_id": "s1", "v": 2}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        h.storage.delete_pending(Table::Tenants, "t1").await.unwrap();

        h.engine.sync().await.unwrap();

        let applied = h.remote.applied.lock();
        assert_eq!(applied.len(), 3);
        assert_eq!(applied[0].action, SyncAction::Create);
        assert_eq!(applied[1].action, SyncAction::Update);
        assert_eq!(applied[2].action, SyncAction::Delete);
    }

    // 第二次并发 sync 空手返回，不触碰队列
    #[tokio::test]
    async fn test_concurrent_sync_is_rejected() {
        let h = harness().await;
        h.network.report_status(NetworkStatus::Online);

        h.storage
            .save_pending(Table::Sites, "s1", json!({"org_id": "o1"}))
            .await
            .unwrap();

        // 手工占住锁模拟一轮进行中
        h.engine
            .is_syncing
            .store(true, std::sync::atomic::Ordering::Release);
        let report = h.engine.sync().await.unwrap();
        assert_eq!(report, SyncReport::default());
        assert_eq!(h.storage.queue_len().await.unwrap(), 1);
        h.engine
            .is_syncing
            .store(false, std::sync::atomic::Ordering::Release);

        // 放开后正常 drain
        let report = h.engine.sync().await.unwrap();
        assert_eq!(report.success, 1);
    }

    // 离线短路：立即返回，队列原样
    #[tokio::test]
    async fn test_offline_short_circuit() {
        let h = harness().await;

        h.storage
            .save_pending(Table::Sites, "s1", json!({"org_id": "o1"}))
            .await
            .unwrap();

        let report = h.engine.sync().await.unwrap();
        assert_eq!(report, SyncReport::default());
        assert_eq!(h.storage.queue_len().await.unwrap(), 1);
        assert!(h.remote.applied.lock().is_empty());
    }

    // retry_failed 重置耗尽项并立即再来一轮
    #[tokio::test]
    async fn test_retry_failed_resets_and_drains() {
        let h = harness().await;
        h.network.report_status(NetworkStatus::Online);

        h.storage
            .save_pending(Table::Hazards, "h1", json!({"assessment_id": "a1"}))
            .await
            .unwrap();
        h.remote.fail_next("h1", u32::MAX);

        for _ in 0..(MAX_SYNC_RETRIES + 1) {
            h.engine.sync().await.unwrap();
        }
        let status = h.engine.get_status().await.unwrap();
        assert_eq!(status.exhausted_count, 1);

        // 远端恢复后重试成功
        h.remote.fail_next("h1", 0);
        let (reset, report) = h.engine.retry_failed().await.unwrap();
        assert_eq!(reset, 1);
        assert_eq!(report.success, 1);
        assert_eq!(h.storage.queue_len().await.unwrap(), 0);
    }

    // 单项失败不影响后续项
    #[tokio::test]
    async fn test_failure_does_not_abort_run() {
        let h = harness().await;
        h.network.report_status(NetworkStatus::Online);

        h.storage
            .save_pending(Table::Sites, "bad", json!({"org_id": "o1"}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        h.storage
            .save_pending(Table::Sites, "good", json!({"org_id": "o1"}))
            .await
            .unwrap();
        h.remote.fail_next("bad", u32::MAX);

        let report = h.engine.sync().await.unwrap();
        assert_eq!(report.success, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(h.remote.applied_record_ids(), vec!["good".to_string()]);
        assert_eq!(h.storage.queue_len().await.unwrap(), 1);
    }

    // 离线入队 → 上线 → 自动同步 → 远端恰好收到一次 → 队列清空 → complete {1,1}
    #[tokio::test]
    async fn test_offline_edit_then_reconnect_scenario() {
        let h = harness().await;
        let mut rx = h.events.subscribe();

        h.storage
            .save_pending(Table::Tenants, "t1", json!({"site_id": "s1", "name": "Alice"}))
            .await
            .unwrap();
        h.storage
            .save_pending(Table::Tenants, "t1", json!({"site_id": "s1", "name": "Alice B"}))
            .await
            .unwrap();
        // 先排干第一条，只留一条 update 待同步
        h.network.report_status(NetworkStatus::Online);
        h.engine.sync().await.unwrap();
        h.network.report_status(NetworkStatus::Offline);
        assert_eq!(h.storage.queue_len().await.unwrap(), 0);

        h.storage
            .save_pending(Table::Tenants, "t1", json!({"site_id": "s1", "name": "Alice C"}))
            .await
            .unwrap();
        h.remote.applied.lock().clear();
        while rx.try_recv().is_ok() {}

        h.engine.start_auto_sync(Duration::from_secs(3600));
        // 启动时离线，首个 tick 会被短路；上线跳变触发真正的 drain
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.network.report_status(NetworkStatus::Online);

        // 等自动同步任务完成本轮
        let mut completed_event = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            while let Ok(event) = rx.try_recv() {
                if let SyncEvent::SyncCompleted { total, completed } = event {
                    completed_event = Some((total, completed));
                }
            }
            if completed_event.is_some() {
                break;
            }
        }

        assert_eq!(completed_event, Some((1, 1)));
        let applied = h.remote.applied.lock();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].action, SyncAction::Update);
        assert_eq!(applied[0].record_id, "t1");
        drop(applied);
        assert_eq!(h.storage.queue_len().await.unwrap(), 0);

        h.engine.stop_auto_sync();
    }

    #[test]
    fn test_backoff_schedule_guideline() {
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff_for_attempt(3), Duration::from_secs(15));
        assert_eq!(backoff_for_attempt(5), Duration::from_secs(300));
        // 超出表长停在最后一档
        assert_eq!(backoff_for_attempt(9), Duration::from_secs(300));
    }
}
