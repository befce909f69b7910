//! 缓存模块 - 后台请求拦截层的持久缓存
//!
//! 职责：
//! - 请求分类：静态资源 / API / 导航 / 其他 / 排除
//! - sled 持久缓存：静态与动态两棵树，带代际命名与过期代际清理
//! - 缓存条目用 bincode 序列化，key 为 URL 的 SHA-256 十六进制
//!
//! 远端数据服务自身的域名永远排除在拦截之外，写操作与鉴权必须直连网络。

pub mod strategy;
pub mod worker;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Result, SiteSyncSDKError};

/// 缓存代际：升级缓存布局时递增，旧代际在激活时整树删除
pub const CACHE_GENERATION: u32 = 1;

/// 缓存树类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// 静态资源（应用外壳、脚本、样式、图标）
    Static,
    /// 动态内容（API 响应、页面）
    Dynamic,
}

impl CacheKind {
    /// 当前代际的树名
    pub fn tree_name(&self) -> String {
        match self {
            CacheKind::Static => format!("static-v{}", CACHE_GENERATION),
            CacheKind::Dynamic => format!("dynamic-v{}", CACHE_GENERATION),
        }
    }
}

/// 缓存中的响应快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// 写入时刻，毫秒时间戳
    pub stored_at: i64,
}

impl CachedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.as_str())
    }
}

/// 请求类别，决定使用哪种缓存策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCategory {
    /// 静态资源 → cache-first
    StaticAsset,
    /// API 请求 → network-first（失败回退缓存，再失败返回 JSON 离线响应）
    Api,
    /// 页面导航 → network-first（离线时返回纯文本离线页）
    Navigation,
    /// 其他 → stale-while-revalidate
    Other,
    /// 不拦截：直连网络
    Excluded,
}

/// 静态资源扩展名（与预缓存种子列表同源）
const STATIC_EXTENSIONS: [&str; 10] = [
    ".js", ".css", ".png", ".jpg", ".jpeg", ".svg", ".ico", ".woff", ".woff2", ".webmanifest",
];

impl RequestCategory {
    /// 请求分类
    ///
    /// 排除规则优先：非 GET、非 http(s)、远端数据服务自己的域名。
    pub fn classify(method: &str, url: &str, remote_host: Option<&str>) -> RequestCategory {
        if !method.eq_ignore_ascii_case("GET") {
            return RequestCategory::Excluded;
        }
        let Ok(parsed) = reqwest::Url::parse(url) else {
            return RequestCategory::Excluded;
        };
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return RequestCategory::Excluded;
        }
        if let (Some(host), Some(remote)) = (parsed.host_str(), remote_host) {
            if host.eq_ignore_ascii_case(remote) {
                return RequestCategory::Excluded;
            }
        }

        let path = parsed.path().to_ascii_lowercase();
        if STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
            return RequestCategory::StaticAsset;
        }
        if path.starts_with("/api/") {
            return RequestCategory::Api;
        }
        // 无扩展名的 GET 视为页面导航
        if !path.rsplit('/').next().unwrap_or("").contains('.') {
            return RequestCategory::Navigation;
        }
        RequestCategory::Other
    }

    /// 该类别对应的缓存树
    pub fn cache_kind(&self) -> CacheKind {
        match self {
            RequestCategory::StaticAsset => CacheKind::Static,
            _ => CacheKind::Dynamic,
        }
    }
}

/// URL → 缓存键（SHA-256 十六进制，规避 sled key 中的特殊字符与长度问题）
pub fn cache_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

/// sled 持久缓存
pub struct RequestCache {
    db: sled::Db,
    static_tree: sled::Tree,
    dynamic_tree: sled::Tree,
}

impl RequestCache {
    /// 打开（或创建）缓存库
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| SiteSyncSDKError::KvStore(format!("打开缓存库失败: {}", e)))?;
        let static_tree = db
            .open_tree(CacheKind::Static.tree_name())
            .map_err(|e| SiteSyncSDKError::KvStore(format!("打开静态缓存树失败: {}", e)))?;
        let dynamic_tree = db
            .open_tree(CacheKind::Dynamic.tree_name())
            .map_err(|e| SiteSyncSDKError::KvStore(format!("打开动态缓存树失败: {}", e)))?;
        Ok(Self {
            db,
            static_tree,
            dynamic_tree,
        })
    }

    fn tree(&self, kind: CacheKind) -> &sled::Tree {
        match kind {
            CacheKind::Static => &self.static_tree,
            CacheKind::Dynamic => &self.dynamic_tree,
        }
    }

    /// 读取缓存条目
    pub fn get(&self, kind: CacheKind, url: &str) -> Result<Option<CachedResponse>> {
        let bytes = self
            .tree(kind)
            .get(cache_key(url))
            .map_err(|e| SiteSyncSDKError::KvStore(format!("读取缓存失败: {}", e)))?;
        match bytes {
            Some(bytes) => {
                let resp = bincode::deserialize(&bytes).map_err(|e| {
                    SiteSyncSDKError::Serialization(format!("解析缓存条目失败: {}", e))
                })?;
                Ok(Some(resp))
            }
            None => Ok(None),
        }
    }

    /// 写入缓存条目
    pub fn put(&self, kind: CacheKind, url: &str, response: &CachedResponse) -> Result<()> {
        let bytes = bincode::serialize(response)
            .map_err(|e| SiteSyncSDKError::Serialization(format!("序列化缓存条目失败: {}", e)))?;
        self.tree(kind)
            .insert(cache_key(url), bytes)
            .map_err(|e| SiteSyncSDKError::KvStore(format!("写入缓存失败: {}", e)))?;
        debug!("💾 缓存写入 [{:?}] {}", kind, url);
        Ok(())
    }

    /// 激活清理：删除当前代际之外的所有缓存树
    pub fn cleanup_old_generations(&self) -> Result<usize> {
        let keep = [CacheKind::Static.tree_name(), CacheKind::Dynamic.tree_name()];
        let mut dropped = 0;
        for name in self.db.tree_names() {
            let name_str = String::from_utf8_lossy(&name).to_string();
            // sled 的默认树不参与代际管理
            if name_str == "__sled__default" || keep.contains(&name_str) {
                continue;
            }
            if name_str.starts_with("static-v") || name_str.starts_with("dynamic-v") {
                self.db
                    .drop_tree(&name)
                    .map_err(|e| SiteSyncSDKError::KvStore(format!("删除旧缓存树失败: {}", e)))?;
                info!("🧹 清理过期缓存代际: {}", name_str);
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    /// 清空当前代际的全部缓存（CLEAR_CACHE 命令）
    pub fn clear_all(&self) -> Result<()> {
        self.static_tree
            .clear()
            .map_err(|e| SiteSyncSDKError::KvStore(format!("清空静态缓存失败: {}", e)))?;
        self.dynamic_tree
            .clear()
            .map_err(|e| SiteSyncSDKError::KvStore(format!("清空动态缓存失败: {}", e)))?;
        info!("🧹 全部缓存已清空");
        Ok(())
    }

    /// 条目数（静态 + 动态）
    pub fn len(&self) -> usize {
        self.static_tree.len() + self.dynamic_tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
