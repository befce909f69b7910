//! 编译期扫描 migrations/ 目录，取 V{n}__*.sql 的最大版本号，
//! 输出为 SDK_DB_VERSION 环境变量（参见 src/version.rs）。

use std::fs;
use std::path::Path;

fn main() {
    println!("cargo:rerun-if-changed=migrations");

    let mut max_version: i64 = 0;
    let dir = Path::new("migrations");
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // 文件名约定：V{version}__{name}.sql
            if let Some(rest) = name.strip_prefix('V') {
                if let Some((version, _)) = rest.split_once("__") {
                    if let Ok(v) = version.parse::<i64>() {
                        if v > max_version {
                            max_version = v;
                        }
                    }
                }
            }
        }
    }

    println!("cargo:rustc-env=SDK_DB_VERSION={}", max_version);
}
