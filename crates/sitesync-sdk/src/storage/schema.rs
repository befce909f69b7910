//! 表注册 - 封闭的表标识枚举
//!
//! 所有实体表在此枚举中静态注册，带各自的索引列定义。
//! 不允许用任意字符串访问表；`from_name` 仅用于反序列化已持久化的队列项。

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SiteSyncSDKError};

/// 实体表标识（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Sites,
    Assessments,
    Tenants,
    Hazards,
    Actions,
}

/// 全部实体表，按固定顺序（用于全量清理等遍历场景）
pub const ALL_TABLES: [Table; 5] = [
    Table::Sites,
    Table::Assessments,
    Table::Tenants,
    Table::Hazards,
    Table::Actions,
];

impl Table {
    /// 数据库中的表名
    pub fn name(&self) -> &'static str {
        match self {
            Table::Sites => "sites",
            Table::Assessments => "assessments",
            Table::Tenants => "tenants",
            Table::Hazards => "hazards",
            Table::Actions => "actions",
        }
    }

    /// 该表的外键式索引列（每表恰好一个，列值从 JSON 载荷同名字段提取）
    pub fn index_column(&self) -> &'static str {
        match self {
            Table::Sites => "org_id",
            Table::Assessments => "site_id",
            Table::Tenants => "site_id",
            Table::Hazards => "assessment_id",
            Table::Actions => "assessment_id",
        }
    }

    /// 从持久化的表名恢复标识；未知表名说明数据来自更高版本的 SDK，报错而非猜测
    pub fn from_name(name: &str) -> Result<Table> {
        match name {
            "sites" => Ok(Table::Sites),
            "assessments" => Ok(Table::Assessments),
            "tenants" => Ok(Table::Tenants),
            "hazards" => Ok(Table::Hazards),
            "actions" => Ok(Table::Actions),
            other => Err(SiteSyncSDKError::Database(format!(
                "未知的表名: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_roundtrip() {
        for table in ALL_TABLES {
            assert_eq!(Table::from_name(table.name()).unwrap(), table);
        }
    }

    #[test]
    fn test_unknown_table_rejected() {
        assert!(Table::from_name("invoices").is_err());
    }

    #[test]
    fn test_index_columns() {
        assert_eq!(Table::Assessments.index_column(), "site_id");
        assert_eq!(Table::Hazards.index_column(), "assessment_id");
    }
}
