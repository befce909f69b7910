//! 数据实体定义 - 对应数据库表结构
//!
//! 这里定义了本地存储与同步队列使用的核心结构体，用于：
//! - 类型安全的数据传输
//! - 统一的数据表示
//! - 序列化/反序列化支持

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SiteSyncSDKError};
use crate::storage::schema::Table;

/// 记录的本地同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// 与远端一致
    Synced,
    /// 本地乐观写入，尚未确认
    Pending,
    /// 与远端冲突（远端覆盖后标记，由上层决定如何呈现）
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Conflict => "conflict",
        }
    }

    pub fn from_str(s: &str) -> Result<SyncStatus> {
        match s {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            "conflict" => Ok(SyncStatus::Conflict),
            other => Err(SiteSyncSDKError::Database(format!(
                "未知的同步状态: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 实体记录 - 本地持有的权威副本
///
/// `data` 是应用层的完整 JSON 载荷，存储层不解释其内容，
/// 只从中提取该表的索引列字段。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub data: serde_json::Value,
    pub sync_status: SyncStatus,
    /// 毫秒时间戳
    pub updated_at: i64,
}

/// 待重放的变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> Result<SyncAction> {
        match s {
            "create" => Ok(SyncAction::Create),
            "update" => Ok(SyncAction::Update),
            "delete" => Ok(SyncAction::Delete),
            other => Err(SiteSyncSDKError::Database(format!(
                "未知的变更类型: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 同步队列项 - 重放的最小单元
///
/// 不变量：
/// - 队列按 (timestamp, id) 顺序重放，同一记录的多次变更不合并
/// - 只有远端确认成功后才会删除
/// - retries 单调不减，直到删除或显式重置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// 零填充毫秒时间戳 + 随机后缀，字典序与入队顺序一致
    pub id: String,
    pub action: SyncAction,
    pub table: Table,
    pub record_id: String,
    /// create/update 携带完整载荷；delete 为 None
    pub data: Option<serde_json::Value>,
    /// 入队时刻，毫秒时间戳
    pub timestamp: i64,
    /// 已失败的尝试次数
    pub retries: u32,
    /// 最近一次失败的错误信息
    pub last_error: Option<String>,
}

impl SyncQueueItem {
    /// 创建新的队列项（timestamp 取当前时刻）
    pub fn new(
        action: SyncAction,
        table: Table,
        record_id: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        let timestamp = Utc::now().timestamp_millis();
        // 13 位零填充保证 2286 年前字典序 == 数值序；uuid 后缀区分同毫秒入队
        let id = format!("{:013}-{}", timestamp, uuid::Uuid::new_v4().simple());

        Self {
            id,
            action,
            table,
            record_id: record_id.into(),
            data,
            timestamp,
            retries: 0,
            last_error: None,
        }
    }

    /// 是否已耗尽重试预算
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retries > max_retries
    }
}
