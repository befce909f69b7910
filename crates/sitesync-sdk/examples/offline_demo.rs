//! 离线优先工作流演示
//!
//! 运行：cargo run --example offline_demo
//!
//! 演示内容：离线写入 → 查看待同步状态 → 模拟网络恢复触发同步
//! （远端地址是占位符，同步会失败并累计重试，这正是离线语义的展示）

use serde_json::json;
use sitesync_sdk::{
    NetworkStatus, RestRemoteConfig, SiteSyncConfig, SiteSyncSDK, SyncEvent, Table,
};

#[tokio::main]
async fn main() -> sitesync_sdk::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let data_dir = std::env::temp_dir().join("sitesync-demo");
    let config = SiteSyncConfig::builder(
        &data_dir,
        RestRemoteConfig::new("https://api.sitesync.invalid", "demo-key"),
    )
    .auto_sync_interval(None)
    .build();

    let sdk = SiteSyncSDK::initialize(config).await?;

    let listener = sdk.add_listener(|event: &SyncEvent| {
        println!("事件: {}", event.event_type());
    });

    // 离线写入：立即可读，标记 pending
    sdk.save_record(
        Table::Sites,
        "site-001",
        json!({"org_id": "org-1", "name": "城东仓库", "address": "建设路 88 号"}),
    )
    .await?;
    sdk.save_record(
        Table::Assessments,
        "assess-001",
        json!({"site_id": "site-001", "status": "draft"}),
    )
    .await?;

    let status = sdk.get_sync_status().await?;
    println!(
        "离线状态: 待同步 {} 项, 网络 {:?}",
        status.pending_count, status.network
    );

    for record in sdk.get_all(Table::Sites).await? {
        println!(
            "本地记录 {} [{}]: {}",
            record.id, record.sync_status, record.data["name"]
        );
    }

    // 模拟网络恢复：同步会尝试重放（远端是占位地址，会失败并累计重试）
    sdk.report_network_status(NetworkStatus::Online);
    let report = sdk.sync_now().await?;
    println!(
        "同步报告: 总数 {} 成功 {} 失败 {}",
        report.total, report.success, report.failed
    );

    sdk.remove_listener(listener);
    sdk.shutdown().await?;
    Ok(())
}
