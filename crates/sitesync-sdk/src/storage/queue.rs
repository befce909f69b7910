//! 同步队列 DAO - sync_queue 表的持久化操作
//!
//! 队列语义：
//! - FIFO：按 (timestamp, id) 升序重放，乱序重放会破坏 create→update→delete 依赖
//! - 只有远端确认成功才出队；失败只累加 retries / 记录 last_error
//! - 队列独立于实体表：实体行被远端覆盖不影响已入队的变更

use rusqlite::{params, Connection, Row};

use crate::error::{Result, SiteSyncSDKError};
use crate::storage::entities::{SyncAction, SyncQueueItem};
use crate::storage::schema::Table;

/// sync_queue 表的数据访问对象。
/// 无状态：连接由 StorageManager 持有并在锁内传入。
pub struct SyncQueueDao;

/// 一行原始数据：action/table_name/data 的解析放到 rusqlite 回调外完成
type RawRow = (
    String,         // id
    String,         // action
    String,         // table_name
    String,         // record_id
    Option<String>, // data
    i64,            // timestamp
    u32,            // retries
    Option<String>, // last_error
);

impl SyncQueueDao {
    fn row_to_raw(row: &Row<'_>) -> rusqlite::Result<RawRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
        ))
    }

    fn raw_to_item(raw: RawRow) -> Result<SyncQueueItem> {
        let (id, action, table_name, record_id, data, timestamp, retries, last_error) = raw;
        let data = data
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| SiteSyncSDKError::Serialization(format!("解析队列载荷失败: {}", e)))?;

        Ok(SyncQueueItem {
            id,
            action: SyncAction::from_str(&action)?,
            table: Table::from_name(&table_name)?,
            record_id,
            data,
            timestamp,
            retries,
            last_error,
        })
    }

    /// 入队一个变更
    pub fn add(conn: &Connection, item: &SyncQueueItem) -> Result<()> {
        let data = item
            .data
            .as_ref()
            .map(|v| serde_json::to_string(v))
            .transpose()
            .map_err(|e| SiteSyncSDKError::Serialization(format!("序列化队列载荷失败: {}", e)))?;

        conn.execute(
            "INSERT INTO sync_queue (id, action, table_name, record_id, data, timestamp, retries, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                item.id,
                item.action.as_str(),
                item.table.name(),
                item.record_id,
                data,
                item.timestamp,
                item.retries,
                item.last_error,
            ],
        )
        .map_err(|e| SiteSyncSDKError::Database(format!("写入同步队列失败: {}", e)))?;
        Ok(())
    }

    /// 按重放顺序返回全部队列项
    pub fn list(conn: &Connection) -> Result<Vec<SyncQueueItem>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, action, table_name, record_id, data, timestamp, retries, last_error
                 FROM sync_queue ORDER BY timestamp ASC, id ASC",
            )
            .map_err(|e| SiteSyncSDKError::Database(format!("查询同步队列失败: {}", e)))?;

        let rows = stmt
            .query_map([], Self::row_to_raw)
            .map_err(|e| SiteSyncSDKError::Database(format!("查询同步队列失败: {}", e)))?;

        let mut items = Vec::new();
        for raw in rows {
            let raw =
                raw.map_err(|e| SiteSyncSDKError::Database(format!("读取队列行失败: {}", e)))?;
            items.push(Self::raw_to_item(raw)?);
        }
        Ok(items)
    }

    /// 出队（远端确认成功后调用）
    pub fn remove(conn: &Connection, item_id: &str) -> Result<()> {
        conn.execute("DELETE FROM sync_queue WHERE id = ?1", [item_id])
            .map_err(|e| SiteSyncSDKError::Database(format!("删除队列项失败: {}", e)))?;
        Ok(())
    }

    /// 记录一次失败：retries + 1，并更新 last_error
    pub fn mark_failed(conn: &Connection, item_id: &str, error: &str) -> Result<u32> {
        conn.execute(
            "UPDATE sync_queue SET retries = retries + 1, last_error = ?2 WHERE id = ?1",
            params![item_id, error],
        )
        .map_err(|e| SiteSyncSDKError::Database(format!("更新队列失败计数失败: {}", e)))?;

        let retries: u32 = conn
            .query_row(
                "SELECT retries FROM sync_queue WHERE id = ?1",
                [item_id],
                |row| row.get(0),
            )
            .map_err(|e| SiteSyncSDKError::Database(format!("读取重试次数失败: {}", e)))?;
        Ok(retries)
    }

    /// 重置所有超出重试预算的项（retries 清零、清除 last_error）
    /// 返回重置的条数
    pub fn reset_exhausted(conn: &Connection, max_retries: u32) -> Result<usize> {
        let changed = conn
            .execute(
                "UPDATE sync_queue SET retries = 0, last_error = NULL WHERE retries > ?1",
                [max_retries],
            )
            .map_err(|e| SiteSyncSDKError::Database(format!("重置失败队列项失败: {}", e)))?;
        Ok(changed)
    }

    /// 队列长度
    pub fn count(conn: &Connection) -> Result<usize> {
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_queue", [], |row| row.get(0))
            .map_err(|e| SiteSyncSDKError::Database(format!("统计队列长度失败: {}", e)))?;
        Ok(count as usize)
    }

    /// 超出重试预算的项数
    pub fn count_exhausted(conn: &Connection, max_retries: u32) -> Result<usize> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE retries > ?1",
                [max_retries],
                |row| row.get(0),
            )
            .map_err(|e| SiteSyncSDKError::Database(format!("统计失败队列项失败: {}", e)))?;
        Ok(count as usize)
    }

    /// 清空整个队列（登出 / 重置本地数据时使用）
    pub fn clear(conn: &Connection) -> Result<()> {
        conn.execute("DELETE FROM sync_queue", [])
            .map_err(|e| SiteSyncSDKError::Database(format!("清空同步队列失败: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrate;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_test_db() -> (TempDir, Connection) {
        let temp_dir = TempDir::new().unwrap();
        let mut conn = Connection::open(temp_dir.path().join("queue.db")).unwrap();
        migrate::init_db(&mut conn).unwrap();
        (temp_dir, conn)
    }

    #[test]
    fn test_add_and_list_preserves_order() {
        let (_guard, conn) = open_test_db();

        let first = SyncQueueItem::new(
            SyncAction::Create,
            Table::Tenants,
            "t1",
            Some(json!({"name": "Alice"})),
        );
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = SyncQueueItem::new(
            SyncAction::Update,
            Table::Tenants,
            "t1",
            Some(json!({"name": "Alice B"})),
        );
        std::thread::sleep(std::time::Duration::from_millis(2));
        let third = SyncQueueItem::new(SyncAction::Delete, Table::Tenants, "t1", None);

        // 乱序写入，读取必须按时间顺序
        SyncQueueDao::add(&conn, &third).unwrap();
        SyncQueueDao::add(&conn, &first).unwrap();
        SyncQueueDao::add(&conn, &second).unwrap();

        let items = SyncQueueDao::list(&conn).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].id, first.id);
        assert_eq!(items[1].id, second.id);
        assert_eq!(items[2].id, third.id);
        assert_eq!(items[0].action, SyncAction::Create);
        assert_eq!(items[2].data, None);
    }

    #[test]
    fn test_remove_only_deletes_target() {
        let (_guard, conn) = open_test_db();

        let keep = SyncQueueItem::new(SyncAction::Create, Table::Sites, "s1", Some(json!({})));
        let gone = SyncQueueItem::new(SyncAction::Create, Table::Sites, "s2", Some(json!({})));
        SyncQueueDao::add(&conn, &keep).unwrap();
        SyncQueueDao::add(&conn, &gone).unwrap();

        SyncQueueDao::remove(&conn, &gone.id).unwrap();

        let items = SyncQueueDao::list(&conn).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, keep.id);
    }

    #[test]
    fn test_mark_failed_increments_and_records_error() {
        let (_guard, conn) = open_test_db();

        let item = SyncQueueItem::new(SyncAction::Update, Table::Hazards, "h1", Some(json!({})));
        SyncQueueDao::add(&conn, &item).unwrap();

        let retries = SyncQueueDao::mark_failed(&conn, &item.id, "网络超时").unwrap();
        assert_eq!(retries, 1);
        let retries = SyncQueueDao::mark_failed(&conn, &item.id, "HTTP 500").unwrap();
        assert_eq!(retries, 2);

        let items = SyncQueueDao::list(&conn).unwrap();
        assert_eq!(items[0].retries, 2);
        assert_eq!(items[0].last_error.as_deref(), Some("HTTP 500"));
    }

    #[test]
    fn test_reset_exhausted_only_touches_over_budget() {
        let (_guard, conn) = open_test_db();

        let mut exhausted =
            SyncQueueItem::new(SyncAction::Create, Table::Actions, "a1", Some(json!({})));
        exhausted.retries = 6;
        exhausted.last_error = Some("持续失败".to_string());
        let fresh = SyncQueueItem::new(SyncAction::Create, Table::Actions, "a2", Some(json!({})));

        SyncQueueDao::add(&conn, &exhausted).unwrap();
        SyncQueueDao::add(&conn, &fresh).unwrap();

        assert_eq!(SyncQueueDao::count_exhausted(&conn, 5).unwrap(), 1);
        let reset = SyncQueueDao::reset_exhausted(&conn, 5).unwrap();
        assert_eq!(reset, 1);
        assert_eq!(SyncQueueDao::count_exhausted(&conn, 5).unwrap(), 0);

        let items = SyncQueueDao::list(&conn).unwrap();
        let restored = items.iter().find(|i| i.record_id == "a1").unwrap();
        assert_eq!(restored.retries, 0);
        assert_eq!(restored.last_error, None);
    }

    #[test]
    fn test_clear_empties_queue() {
        let (_guard, conn) = open_test_db();

        for i in 0..4 {
            let item = SyncQueueItem::new(
                SyncAction::Create,
                Table::Sites,
                format!("s{}", i),
                Some(json!({})),
            );
            SyncQueueDao::add(&conn, &item).unwrap();
        }
        assert_eq!(SyncQueueDao::count(&conn).unwrap(), 4);

        SyncQueueDao::clear(&conn).unwrap();
        assert_eq!(SyncQueueDao::count(&conn).unwrap(), 0);
    }
}
