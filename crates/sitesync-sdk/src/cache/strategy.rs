//! 缓存策略 - 纯函数决策层
//!
//! 策略本身不做任何 I/O：
//! - `plan` 根据缓存命中情况给出执行计划（是否需要网络）
//! - `settle` 根据网络结果给出最终响应与是否回写缓存
//!
//! worker 负责按计划执行实际的缓存读写与网络请求，
//! 这样三种策略的全部分支都可以在同步测试里穷举。

use chrono::Utc;

use super::{CachedResponse, RequestCategory};

/// 缓存策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    /// 静态资源：缓存命中直接用，未命中才走网络
    CacheFirst,
    /// API / 导航：先网络，失败回退缓存
    NetworkFirst,
    /// 其他：先用缓存，后台刷新
    StaleWhileRevalidate,
}

impl CacheStrategy {
    /// 类别 → 策略映射；Excluded 不应到达这里
    pub fn for_category(category: RequestCategory) -> CacheStrategy {
        match category {
            RequestCategory::StaticAsset => CacheStrategy::CacheFirst,
            RequestCategory::Api | RequestCategory::Navigation => CacheStrategy::NetworkFirst,
            RequestCategory::Other | RequestCategory::Excluded => {
                CacheStrategy::StaleWhileRevalidate
            }
        }
    }
}

/// plan 的输出：worker 按此执行
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchPlan {
    /// 直接返回缓存，不碰网络
    ServeCached(CachedResponse),
    /// 必须走网络；fallback 为失败时可回退的缓存副本
    NeedNetwork { fallback: Option<CachedResponse> },
    /// 先返回缓存，同时在后台刷新
    ServeCachedAndRevalidate(CachedResponse),
}

/// settle 的输出
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    /// 最终交给调用方的响应
    pub response: CachedResponse,
    /// 是否把该响应写回缓存
    pub store: bool,
    /// 是否为合成的离线响应（非真实网络/缓存数据）
    pub synthetic: bool,
}

/// 第一阶段：根据策略与缓存命中情况决定执行计划
pub fn plan(strategy: CacheStrategy, cached: Option<CachedResponse>) -> FetchPlan {
    match (strategy, cached) {
        (CacheStrategy::CacheFirst, Some(hit)) => FetchPlan::ServeCached(hit),
        (CacheStrategy::CacheFirst, None) => FetchPlan::NeedNetwork { fallback: None },
        (CacheStrategy::NetworkFirst, cached) => FetchPlan::NeedNetwork { fallback: cached },
        (CacheStrategy::StaleWhileRevalidate, Some(hit)) => {
            FetchPlan::ServeCachedAndRevalidate(hit)
        }
        (CacheStrategy::StaleWhileRevalidate, None) => FetchPlan::NeedNetwork { fallback: None },
    }
}

/// 第二阶段：网络结果出来后决定最终响应
///
/// `network` 为 None 表示网络层面失败（连不上 / 超时）。
/// 注意只有 2xx 响应才回写缓存，错误响应不污染缓存。
pub fn settle(
    category: RequestCategory,
    fallback: Option<CachedResponse>,
    network: Option<CachedResponse>,
) -> Settled {
    match network {
        Some(resp) => {
            let store = resp.is_success();
            Settled {
                response: resp,
                store,
                synthetic: false,
            }
        }
        None => match fallback {
            Some(cached) => Settled {
                response: cached,
                store: false,
                synthetic: false,
            },
            None => Settled {
                response: synthetic_offline_response(category),
                store: false,
                synthetic: true,
            },
        },
    }
}

/// 合成离线响应：API 给结构化 JSON，导航给纯文本页，其余 504
pub fn synthetic_offline_response(category: RequestCategory) -> CachedResponse {
    let stored_at = Utc::now().timestamp_millis();
    match category {
        RequestCategory::Api => CachedResponse {
            status: 503,
            headers: vec![(
                "content-type".to_string(),
                "application/json".to_string(),
            )],
            body: r#"{"error":"offline","message":"网络不可用，请稍后重试"}"#.as_bytes().to_vec(),
            stored_at,
        },
        RequestCategory::Navigation => CachedResponse {
            status: 503,
            headers: vec![(
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: "当前处于离线状态，页面尚未缓存".as_bytes().to_vec(),
            stored_at,
        },
        _ => CachedResponse {
            status: 504,
            headers: vec![(
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: b"Gateway Timeout".to_vec(),
            stored_at,
        },
    }
}
