// 存储 API 数据类型

use serde::{Deserialize, Serialize};

/// 并发策略响应（/storage/concurrency_limit）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConcurrencyLimitResponse {
    /// 同时上传的最大分片数
    pub concurrency_limit: usize,
    /// 分片大小（字节）
    pub chunk_size: u64,
}

/// 初始化分片上传请求
#[derive(Debug, Clone, Serialize)]
pub struct InitiateMultipartRequest<'a> {
    pub s3_key: &'a str,
}

/// 初始化分片上传响应
#[derive(Debug, Clone, Deserialize)]
pub struct InitiateMultipartResponse {
    /// 远端分片会话 ID
    pub upload_id: String,
}

/// 预签名 URL 查询参数
#[derive(Debug, Clone, Serialize)]
pub struct PresignedPartQuery<'a> {
    pub s3_key: &'a str,
    pub part_number: u32,
    pub upload_id: &'a str,
}

/// 预签名 URL 响应
#[derive(Debug, Clone, Deserialize)]
pub struct PresignedUrlResponse {
    pub url: String,
}

/// 已完成的分片（用于 complete_multipart_upload）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletedPart {
    /// 分片序号（从 1 开始）
    pub part_number: u32,
    /// 存储后端返回的实体标签
    pub etag: String,
}

/// 完成分片上传请求
#[derive(Debug, Clone, Serialize)]
pub struct CompleteMultipartRequest<'a> {
    pub s3_key: &'a str,
    pub upload_id: &'a str,
    /// 必须按 part_number 升序
    pub parts: &'a [CompletedPart],
}

/// 放弃分片上传请求
#[derive(Debug, Clone, Serialize)]
pub struct AbortMultipartRequest<'a> {
    pub s3_key: &'a str,
    pub upload_id: &'a str,
}

/// 注册存储对象请求（POST /storage）
#[derive(Debug, Clone, Serialize)]
pub struct RegisterObjectRequest<'a> {
    pub storage_object: StorageObjectPayload<'a>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageObjectPayload<'a> {
    pub name: &'a str,
    pub s3_key: &'a str,
}

/// 远端存储对象（GET /storage 列表项）
///
/// 服务端字段并不稳定，除 id 外全部可选
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageObject {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub s3_key: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl StorageObject {
    /// 显示名称（没有 name 时退回到 s3_key）
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.s3_key.as_deref())
            .unwrap_or("Unknown File")
    }
}

/// 删除存储对象结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeleteObjectResult {
    pub success: bool,
    pub object_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// id 可能是字符串或数字，需要同时支持两种格式
fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(u64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}
