//! 数据库迁移与初始化 - 由 refinery 自动管理
//!
//! 设计原则：
//! - Migration 版本 = migrations 文件顺序，新增迁移只需在 migrations/
//!   添加 V{n}__{name}.sql，编译期自动嵌入、自动执行。
//! - 迁移只增不删：允许建新表/新索引，禁止隐式删除既有数据。
//! - 统一入口 `init_db`：pragmas → migrate → 版本校验，幂等，可重复调用。

mod embedded {
    use refinery::embed_migrations;

    embed_migrations!("./migrations");
}

use rusqlite::Connection;

use crate::error::{Result, SiteSyncSDKError};
use crate::version::SDK_DB_VERSION;

/// refinery 使用的 migration 历史表名（与 refinery 默认一致，用于版本校验）
const REFINERY_TABLE: &str = "refinery_schema_history";

/// 离线优先场景推荐 PRAGMA：WAL、NORMAL 同步、外键、内存临时表
const OFFLINE_PRAGMAS: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA foreign_keys=ON;
PRAGMA temp_store=MEMORY;
";

/// 开启必备 pragmas（写入性能、崩溃安全、少锁冲突）
pub fn enable_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(OFFLINE_PRAGMAS.trim())
        .map_err(|e| SiteSyncSDKError::Database(format!("设置 PRAGMA 失败: {}", e)))?;
    Ok(())
}

/// 执行内置 migrations（编译期嵌入，自动按版本顺序执行）
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    embedded::migrations::runner()
        .run(conn)
        .map_err(|e| SiteSyncSDKError::Migration(format!("执行 migration 失败: {}", e)))?;
    Ok(())
}

/// 读取 refinery 表中当前数据库的 migration 版本；无表或空表返回 None
fn get_db_migration_version(conn: &Connection) -> Result<Option<i64>> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
            [REFINERY_TABLE],
            |row| row.get(0),
        )
        .map_err(|e| SiteSyncSDKError::Database(format!("查询 {} 失败: {}", REFINERY_TABLE, e)))?;

    if !exists {
        return Ok(None);
    }

    let version: Option<i64> = conn
        .query_row(
            &format!("SELECT MAX(version) FROM {}", REFINERY_TABLE),
            [],
            |row| row.get::<_, Option<i64>>(0),
        )
        .map_err(|e| SiteSyncSDKError::Database(format!("读取 migration 版本失败: {}", e)))?;

    Ok(version.filter(|&v| v > 0))
}

/// 强制版本校验：若 DB 版本 > 当前 SDK 支持的最高版本，拒绝使用
/// （防 downgrade 后 schema 不兼容）
fn check_db_version(conn: &Connection) -> Result<()> {
    let db_version = get_db_migration_version(conn)?;
    let Some(v) = db_version else { return Ok(()); };
    if v > SDK_DB_VERSION {
        return Err(SiteSyncSDKError::Database(format!(
            "数据库版本 {} 高于当前 SDK 支持的最高版本 {}，请升级 SDK 后再打开",
            v, SDK_DB_VERSION
        )));
    }
    Ok(())
}

/// 统一初始化入口：先开 pragmas，再执行 migrations，最后做版本校验。
/// 调用方只需在打开连接后调用一次，避免忘记 migrate 或多处初始化。
pub fn init_db(conn: &mut Connection) -> Result<()> {
    enable_pragmas(conn)?;
    run_migrations(conn)?;
    check_db_version(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_db_creates_all_tables() {
        let temp_dir = TempDir::new().unwrap();
        let mut conn = Connection::open(temp_dir.path().join("test.db")).unwrap();

        init_db(&mut conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();

        for expected in [
            "sites",
            "assessments",
            "tenants",
            "hazards",
            "actions",
            "sync_queue",
            "metadata",
        ] {
            assert!(tables.contains(&expected.to_string()), "缺少表 {}", expected);
        }
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let mut conn = Connection::open(&db_path).unwrap();
        init_db(&mut conn).unwrap();

        // 写入一条数据后重新初始化，数据必须保留
        conn.execute(
            "INSERT INTO sites (id, org_id, data, sync_status, updated_at)
             VALUES ('s1', 'o1', '{}', 'synced', 0)",
            [],
        )
        .unwrap();
        drop(conn);

        let mut conn = Connection::open(&db_path).unwrap();
        init_db(&mut conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sites", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
