//! 网络状态模块 - 连通性信号源
//!
//! 连通性有两个来源：
//! - 宿主注入：平台（移动端 / 桌面端）的网络回调通过 `report_status` 推送
//! - 主动探测：`ConnectivityProbe` 周期性探测远端健康端点
//!
//! 两者合流到同一个 watch 通道；同步引擎只关心"离线 → 在线"的跳变。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{EventManager, SyncEvent};

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    Offline,
}

impl NetworkStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, NetworkStatus::Online)
    }
}

/// 连通性探测种子 - 平台相关的实际探测逻辑
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// 探测一次当前连通性
    async fn check(&self) -> NetworkStatus;
}

/// 基于 HTTP 的探测：对远端健康端点发 GET，任何成功响应都算在线。
/// 4xx/5xx 也算在线（服务可达，只是业务出错）。
pub struct HttpConnectivityProbe {
    client: reqwest::Client,
    health_url: String,
}

impl HttpConnectivityProbe {
    pub fn new(health_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| crate::error::SiteSyncSDKError::Transport(format!(
                "创建探测客户端失败: {}",
                e
            )))?;
        Ok(Self {
            client,
            health_url: health_url.into(),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpConnectivityProbe {
    async fn check(&self) -> NetworkStatus {
        match self.client.get(&self.health_url).send().await {
            Ok(_) => NetworkStatus::Online,
            Err(e) => {
                debug!("连通性探测失败: {}", e);
                NetworkStatus::Offline
            }
        }
    }
}

/// 网络监视器
///
/// 对外暴露 watch 通道；状态跳变时发布 `NetworkStatusChanged` 事件。
pub struct NetworkMonitor {
    status_tx: watch::Sender<NetworkStatus>,
    events: Arc<EventManager>,
    shutdown: Arc<Notify>,
    poll_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    /// 初始状态为 Offline：宁可先走离线路径，等首个信号确认再上线
    pub fn new(events: Arc<EventManager>) -> Arc<Self> {
        let (status_tx, _) = watch::channel(NetworkStatus::Offline);
        Arc::new(Self {
            status_tx,
            events,
            shutdown: Arc::new(Notify::new()),
            poll_handle: parking_lot::Mutex::new(None),
        })
    }

    /// 当前状态
    pub fn current(&self) -> NetworkStatus {
        *self.status_tx.borrow()
    }

    /// 是否在线
    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// 订阅状态变化
    pub fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.status_tx.subscribe()
    }

    /// 宿主注入的网络状态（平台网络回调直接调用）
    ///
    /// 状态不变时静默；跳变时更新通道并发布事件。
    pub fn report_status(&self, status: NetworkStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });

        if changed {
            match status {
                NetworkStatus::Online => info!("🌐 网络恢复在线"),
                NetworkStatus::Offline => warn!("📴 网络已离线"),
            }
            self.events.emit(SyncEvent::NetworkStatusChanged { status });
        }
    }

    /// 启动周期性探测任务（可选；宿主回调可靠时无需启动）
    pub fn start_probing(
        self: &Arc<Self>,
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
    ) {
        let monitor = self.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let status = probe.check().await;
                        monitor.report_status(status);
                    }
                    _ = shutdown.notified() => {
                        debug!("连通性探测任务退出");
                        break;
                    }
                }
            }
        });

        *self.poll_handle.lock() = Some(handle);
    }

    /// 停止探测任务
    pub fn stop_probing(&self) {
        self.shutdown.notify_waiters();
        if let Some(handle) = self.poll_handle.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 测试用探测：按脚本依次返回状态，耗尽后停在最后一个
    pub struct ScriptedProbe {
        script: Vec<NetworkStatus>,
        cursor: AtomicUsize,
    }

    impl ScriptedProbe {
        pub fn new(script: Vec<NetworkStatus>) -> Arc<Self> {
            Arc::new(Self {
                script,
                cursor: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ConnectivityProbe for ScriptedProbe {
        async fn check(&self) -> NetworkStatus {
            let i = self.cursor.fetch_add(1, Ordering::SeqCst);
            *self
                .script
                .get(i)
                .or_else(|| self.script.last())
                .unwrap_or(&NetworkStatus::Offline)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_report_status_emits_only_on_change() {
        let events = EventManager::new();
        let mut rx = events.subscribe();
        let monitor = NetworkMonitor::new(events);

        assert_eq!(monitor.current(), NetworkStatus::Offline);

        // 重复报告离线不产生事件
        monitor.report_status(NetworkStatus::Offline);
        monitor.report_status(NetworkStatus::Online);
        monitor.report_status(NetworkStatus::Online);
        monitor.report_status(NetworkStatus::Offline);

        let mut transitions = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SyncEvent::NetworkStatusChanged { status } = event {
                transitions.push(status);
            }
        }
        assert_eq!(
            transitions,
            vec![NetworkStatus::Online, NetworkStatus::Offline]
        );
    }

    #[tokio::test]
    async fn test_watch_sees_transition() {
        let monitor = NetworkMonitor::new(EventManager::new());
        let mut rx = monitor.watch();

        monitor.report_status(NetworkStatus::Online);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), NetworkStatus::Online);
        assert!(monitor.is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_loop_reports() {
        let events = EventManager::new();
        let monitor = NetworkMonitor::new(events);
        let probe = testing::ScriptedProbe::new(vec![NetworkStatus::Online]);

        let mut rx = monitor.watch();
        monitor.start_probing(probe, Duration::from_secs(10));

        tokio::time::timeout(Duration::from_secs(60), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(monitor.is_online());

        monitor.stop_probing();
    }
}
