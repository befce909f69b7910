//! 存储管理模块 - 本地权威数据 + 同步队列的统一入口
//!
//! 主要功能：
//! - SQLite 连接管理（WAL、迁移、版本校验）
//! - 实体表的读写：UI 永远读写本地，远端只是异步副本
//! - 乐观写入：本地写 + 标记 pending + 入队，一个事务内完成
//! - 元数据键值对（最近同步时间等）
//!
//! 架构说明：
//! - 表集合是封闭的（`schema::Table`），SQL 中的表名/索引列名
//!   全部来自枚举，不接受调用方传入的任意字符串

pub mod entities;
pub mod migrate;
pub mod queue;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, TransactionBehavior};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, SiteSyncSDKError};
use self::entities::{EntityRecord, SyncAction, SyncQueueItem, SyncStatus};
use self::queue::SyncQueueDao;
use self::schema::Table;

/// 存储管理器
///
/// 持有唯一的 SQLite 连接，所有访问都经过异步互斥锁。
/// WAL 模式下单连接串行访问对本 SDK 的写入规模绰绰有余。
pub struct StorageManager {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl StorageManager {
    /// 打开（或创建）本地数据库并完成迁移
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref();
        std::fs::create_dir_all(base_dir)
            .map_err(|e| SiteSyncSDKError::IO(format!("创建数据目录失败: {}", e)))?;

        let db_path = base_dir.join("sitesync.db");
        let mut conn = Connection::open(&db_path)
            .map_err(|e| SiteSyncSDKError::Database(format!("打开数据库失败: {}", e)))?;

        migrate::init_db(&mut conn)?;
        info!("✅ 本地数据库就绪: {:?}", db_path);

        Ok(Self {
            db_path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 数据库文件路径
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, i64)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    }

    fn raw_to_record(raw: (String, String, String, i64)) -> Result<EntityRecord> {
        let (id, data, sync_status, updated_at) = raw;
        Ok(EntityRecord {
            id,
            data: serde_json::from_str(&data)
                .map_err(|e| SiteSyncSDKError::Serialization(format!("解析记录载荷失败: {}", e)))?,
            sync_status: SyncStatus::from_str(&sync_status)?,
            updated_at,
        })
    }

    // ========== 实体表读取 ==========

    /// 读取某表全部记录
    pub async fn get_all(&self, table: Table) -> Result<Vec<EntityRecord>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT id, data, sync_status, updated_at FROM {} ORDER BY updated_at DESC",
            table.name()
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SiteSyncSDKError::Database(format!("查询 {} 失败: {}", table, e)))?;
        let rows = stmt
            .query_map([], Self::row_to_record)
            .map_err(|e| SiteSyncSDKError::Database(format!("查询 {} 失败: {}", table, e)))?;

        let mut records = Vec::new();
        for raw in rows {
            let raw = raw
                .map_err(|e| SiteSyncSDKError::Database(format!("读取 {} 行失败: {}", table, e)))?;
            records.push(Self::raw_to_record(raw)?);
        }
        Ok(records)
    }

    /// 按主键读取单条记录
    pub async fn get_by_id(&self, table: Table, id: &str) -> Result<Option<EntityRecord>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT id, data, sync_status, updated_at FROM {} WHERE id = ?1",
            table.name()
        );
        let raw = conn
            .query_row(&sql, [id], Self::row_to_record)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(SiteSyncSDKError::Database(format!(
                    "查询 {} 失败: {}",
                    table, other
                ))),
            })?;
        raw.map(Self::raw_to_record).transpose()
    }

    /// 按索引列读取（sites 按 org_id、assessments/tenants 按 site_id 等）
    pub async fn get_by_index(&self, table: Table, value: &str) -> Result<Vec<EntityRecord>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT id, data, sync_status, updated_at FROM {} WHERE {} = ?1 ORDER BY updated_at DESC",
            table.name(),
            table.index_column()
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| SiteSyncSDKError::Database(format!("查询 {} 失败: {}", table, e)))?;
        let rows = stmt
            .query_map([value], Self::row_to_record)
            .map_err(|e| SiteSyncSDKError::Database(format!("查询 {} 失败: {}", table, e)))?;

        let mut records = Vec::new();
        for raw in rows {
            let raw = raw
                .map_err(|e| SiteSyncSDKError::Database(format!("读取 {} 行失败: {}", table, e)))?;
            records.push(Self::raw_to_record(raw)?);
        }
        Ok(records)
    }

    /// 记录是否存在（用于区分 create / update）
    pub async fn exists(&self, table: Table, id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT COUNT(*) > 0 FROM {} WHERE id = ?1", table.name());
        conn.query_row(&sql, [id], |row| row.get(0))
            .map_err(|e| SiteSyncSDKError::Database(format!("查询 {} 失败: {}", table, e)))
    }

    // ========== 实体表写入 ==========

    fn upsert_in_tx(
        conn: &Connection,
        table: Table,
        id: &str,
        data: &serde_json::Value,
        status: SyncStatus,
        updated_at: i64,
    ) -> Result<()> {
        // 索引列值从载荷中提取，载荷缺失时为 NULL（不入索引）
        let index_value = data
            .get(table.index_column())
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let data_str = serde_json::to_string(data)
            .map_err(|e| SiteSyncSDKError::Serialization(format!("序列化记录失败: {}", e)))?;

        let sql = format!(
            "INSERT OR REPLACE INTO {} (id, {}, data, sync_status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            table.name(),
            table.index_column()
        );
        conn.execute(
            &sql,
            params![id, index_value, data_str, status.as_str(), updated_at],
        )
        .map_err(|e| SiteSyncSDKError::Database(format!("写入 {} 失败: {}", table, e)))?;
        Ok(())
    }

    /// 乐观写入：本地 upsert（标记 pending）+ 变更入队，同一事务
    ///
    /// 返回入队的队列项（含队列项 id，便于上层追踪）。
    pub async fn save_pending(
        &self,
        table: Table,
        id: &str,
        data: serde_json::Value,
    ) -> Result<SyncQueueItem> {
        let mut conn = self.conn.lock().await;

        let exists_sql = format!("SELECT COUNT(*) > 0 FROM {} WHERE id = ?1", table.name());
        let exists: bool = conn
            .query_row(&exists_sql, [id], |row| row.get(0))
            .map_err(|e| SiteSyncSDKError::Database(format!("查询 {} 失败: {}", table, e)))?;
        let action = if exists {
            SyncAction::Update
        } else {
            SyncAction::Create
        };

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| SiteSyncSDKError::Database(format!("开启事务失败: {}", e)))?;

        let now = Utc::now().timestamp_millis();
        Self::upsert_in_tx(&tx, table, id, &data, SyncStatus::Pending, now)?;

        let item = SyncQueueItem::new(action, table, id, Some(data));
        SyncQueueDao::add(&tx, &item)?;

        tx.commit()
            .map_err(|e| SiteSyncSDKError::Database(format!("提交事务失败: {}", e)))?;

        debug!("📝 本地写入 {}/{} ({})", table, id, action);
        Ok(item)
    }

    /// 乐观删除：本地删除 + delete 变更入队，同一事务
    pub async fn delete_pending(&self, table: Table, id: &str) -> Result<SyncQueueItem> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| SiteSyncSDKError::Database(format!("开启事务失败: {}", e)))?;

        let sql = format!("DELETE FROM {} WHERE id = ?1", table.name());
        tx.execute(&sql, [id])
            .map_err(|e| SiteSyncSDKError::Database(format!("删除 {} 记录失败: {}", table, e)))?;

        let item = SyncQueueItem::new(SyncAction::Delete, table, id, None);
        SyncQueueDao::add(&tx, &item)?;

        tx.commit()
            .map_err(|e| SiteSyncSDKError::Database(format!("提交事务失败: {}", e)))?;

        debug!("🗑️ 本地删除 {}/{}", table, id);
        Ok(item)
    }

    /// 远端确认后把记录标记为 synced
    pub async fn mark_synced(&self, table: Table, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "UPDATE {} SET sync_status = ?2, updated_at = ?3 WHERE id = ?1",
            table.name()
        );
        conn.execute(
            &sql,
            params![id, SyncStatus::Synced.as_str(), Utc::now().timestamp_millis()],
        )
        .map_err(|e| SiteSyncSDKError::Database(format!("更新同步状态失败: {}", e)))?;
        Ok(())
    }

    /// 批量写入远端拉取的数据（synced 状态，单事务）
    ///
    /// 用于初始全量拉取 / 服务端推送落库，不入同步队列。
    pub async fn put_synced_batch(
        &self,
        table: Table,
        records: Vec<(String, serde_json::Value)>,
    ) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| SiteSyncSDKError::Database(format!("开启事务失败: {}", e)))?;

        let now = Utc::now().timestamp_millis();
        let count = records.len();
        for (id, data) in records {
            Self::upsert_in_tx(&tx, table, &id, &data, SyncStatus::Synced, now)?;
        }

        tx.commit()
            .map_err(|e| SiteSyncSDKError::Database(format!("提交事务失败: {}", e)))?;

        debug!("📥 批量落库 {} x{}", table, count);
        Ok(count)
    }

    /// 清空某表（不触碰同步队列）
    pub async fn clear_table(&self, table: Table) -> Result<()> {
        let conn = self.conn.lock().await;
        let sql = format!("DELETE FROM {}", table.name());
        conn.execute(&sql, [])
            .map_err(|e| SiteSyncSDKError::Database(format!("清空 {} 失败: {}", table, e)))?;
        Ok(())
    }

    // ========== 元数据 ==========

    /// 写入元数据键值对
    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, Utc::now().timestamp_millis()],
        )
        .map_err(|e| SiteSyncSDKError::Database(format!("写入元数据失败: {}", e)))?;
        Ok(())
    }

    /// 读取元数据
    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(SiteSyncSDKError::Database(format!(
                "读取元数据失败: {}",
                other
            ))),
        })
    }

    // ========== 同步队列 ==========

    /// 按重放顺序读取全部队列项
    pub async fn queue_items(&self) -> Result<Vec<SyncQueueItem>> {
        let conn = self.conn.lock().await;
        SyncQueueDao::list(&conn)
    }

    /// 出队（远端确认成功）
    pub async fn dequeue(&self, item_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        SyncQueueDao::remove(&conn, item_id)
    }

    /// 记录一次失败，返回累计失败次数
    pub async fn mark_item_failed(&self, item_id: &str, error: &str) -> Result<u32> {
        let conn = self.conn.lock().await;
        SyncQueueDao::mark_failed(&conn, item_id, error)
    }

    /// 重置所有超出重试预算的队列项，返回重置条数
    pub async fn reset_exhausted_items(&self, max_retries: u32) -> Result<usize> {
        let conn = self.conn.lock().await;
        SyncQueueDao::reset_exhausted(&conn, max_retries)
    }

    /// 队列长度
    pub async fn queue_len(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        SyncQueueDao::count(&conn)
    }

    /// 超出重试预算的队列项数
    pub async fn exhausted_len(&self, max_retries: u32) -> Result<usize> {
        let conn = self.conn.lock().await;
        SyncQueueDao::count_exhausted(&conn, max_retries)
    }

    /// 清空同步队列
    pub async fn clear_queue(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        SyncQueueDao::clear(&conn)
    }

    /// 清空全部本地数据（登出时使用）：实体表 + 队列 + 元数据
    pub async fn clear_all(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        for table in schema::ALL_TABLES {
            let sql = format!("DELETE FROM {}", table.name());
            conn.execute(&sql, [])
                .map_err(|e| SiteSyncSDKError::Database(format!("清空 {} 失败: {}", table, e)))?;
        }
        SyncQueueDao::clear(&conn)?;
        conn.execute("DELETE FROM metadata", [])
            .map_err(|e| SiteSyncSDKError::Database(format!("清空元数据失败: {}", e)))?;
        info!("🧹 本地数据已全部清空");
        Ok(())
    }
}
