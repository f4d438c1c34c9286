// 存储 API 模块
//
// 上传引擎只通过 StorageApi 与远端交互：
// - 并发策略协商
// - 分片会话的初始化 / 完成 / 放弃
// - 分片预签名 URL 与分片 PUT
// - 存储对象注册

pub mod client;
pub mod types;

pub use client::StorageClient;
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// 字节进度回调
///
/// PUT 过程中每交给 HTTP 层一段数据就调用一次，参数为该段字节数
pub type ByteProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// 远端存储协作方接口
#[async_trait]
pub trait StorageApi: Send + Sync {
    /// 根据大小提示获取并发策略
    async fn negotiate_concurrency(&self, size_hint: u64) -> Result<ConcurrencyLimitResponse>;

    /// 初始化分片会话，返回 upload_id
    async fn initiate_session(&self, file_key: &str) -> Result<String>;

    /// 获取单个分片的预签名上传 URL
    async fn presigned_part_url(
        &self,
        file_key: &str,
        part_number: u32,
        upload_id: &str,
    ) -> Result<String>;

    /// 把分片数据 PUT 到预签名 URL，返回 ETag
    async fn put_part(&self, url: &str, payload: Bytes, on_progress: ByteProgressFn)
        -> Result<String>;

    /// 完成分片会话（parts 已按序号升序）
    async fn complete_session(
        &self,
        file_key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()>;

    /// 注册存储对象，使其可被检索
    async fn register_object(&self, file_key: &str, name: &str) -> Result<()>;

    /// 放弃分片会话（尽力而为）
    async fn abort_session(&self, file_key: &str, upload_id: &str) -> Result<()>;
}
