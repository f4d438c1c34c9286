// 并发策略协商

use crate::storage::StorageApi;
use crate::uploader::error::describe;
use crate::uploader::UploadError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// 并发策略（每个会话协商一次，之后不变）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyPolicy {
    /// 同时在途的最大分片数（≥ 1）
    pub concurrency_limit: usize,
    /// 分片大小（> 0）
    pub chunk_size: u64,
}

/// 并发策略顾问
pub struct ConcurrencyAdvisor {
    api: Arc<dyn StorageApi>,
}

impl ConcurrencyAdvisor {
    pub fn new(api: Arc<dyn StorageApi>) -> Self {
        Self { api }
    }

    /// 向远端协商并发策略，size_hint 为文件字节数
    ///
    /// 网络错误、非 2xx 或策略不合法都视为 PolicyUnavailable，不重试
    pub async fn negotiate(&self, size_hint: u64) -> Result<ConcurrencyPolicy, UploadError> {
        let response = self
            .api
            .negotiate_concurrency(size_hint)
            .await
            .map_err(|e| {
                warn!("并发策略协商失败: {}", describe(&e));
                UploadError::PolicyUnavailable(describe(&e))
            })?;

        if response.concurrency_limit < 1 || response.chunk_size == 0 {
            warn!(
                "并发策略不合法: concurrency_limit={}, chunk_size={}",
                response.concurrency_limit, response.chunk_size
            );
            return Err(UploadError::PolicyUnavailable(format!(
                "策略不合法: concurrency_limit={}, chunk_size={}",
                response.concurrency_limit, response.chunk_size
            )));
        }

        info!(
            "并发策略协商完成: size_hint={}, concurrency_limit={}, chunk_size={}",
            size_hint, response.concurrency_limit, response.chunk_size
        );

        Ok(ConcurrencyPolicy {
            concurrency_limit: response.concurrency_limit,
            chunk_size: response.chunk_size,
        })
    }
}
