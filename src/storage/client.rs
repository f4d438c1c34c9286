// 存储 API 客户端实现

use crate::config::ApiConfig;
use crate::storage::{
    AbortMultipartRequest, ByteProgressFn, CompleteMultipartRequest, CompletedPart,
    ConcurrencyLimitResponse, DeleteObjectResult, InitiateMultipartRequest,
    InitiateMultipartResponse, PresignedPartQuery, PresignedUrlResponse, RegisterObjectRequest,
    StorageApi, StorageObject, StorageObjectPayload,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use reqwest::{Body, Client, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// PUT 分片时默认的流式切片大小: 64KB
pub const DEFAULT_STREAM_SLICE_SIZE: usize = 64 * 1024;

/// 存储 API 客户端
#[derive(Debug, Clone)]
pub struct StorageClient {
    /// HTTP客户端
    client: Client,
    /// API 根地址（不带末尾斜杠）
    base_url: String,
    /// Bearer 访问令牌
    access_token: String,
    /// 分片 PUT 是否也携带访问令牌（预签名 URL 自带授权，默认不带）
    auth_part_uploads: bool,
    /// 分片流式发送的切片大小
    stream_slice_size: usize,
}

impl StorageClient {
    /// 创建新的存储客户端
    ///
    /// # 参数
    /// * `config` - API 配置
    /// * `access_token` - 访问令牌（获取与刷新由外部负责）
    pub fn new(config: &ApiConfig, access_token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        info!(
            "初始化存储客户端: base_url={}, timeout={}s",
            base_url, config.timeout_secs
        );

        Ok(Self {
            client,
            base_url,
            access_token: access_token.into(),
            auth_part_uploads: config.auth_part_uploads,
            stream_slice_size: DEFAULT_STREAM_SLICE_SIZE,
        })
    }

    /// 设置流式切片大小（最小 1 字节）
    pub fn with_stream_slice_size(mut self, slice_size: usize) -> Self {
        self.stream_slice_size = slice_size.max(1);
        self
    }

    /// API 根地址
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    /// 非 2xx 响应统一转为错误（带上响应体，便于排查）
    async fn ensure_success(response: Response, action: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        error!("{}失败: status={}, body={}", action, status, body);
        anyhow::bail!("{}失败: status={}, body={}", action, status, body)
    }

    /// 列出远端存储对象
    pub async fn list_objects(&self) -> Result<Vec<StorageObject>> {
        let response = self
            .client
            .get(self.endpoint("storage"))
            .header("Authorization", self.bearer())
            .send()
            .await
            .context("获取存储对象列表请求失败")?;
        let response = Self::ensure_success(response, "获取存储对象列表").await?;

        let json: Value = response.json().await.context("解析存储对象列表失败")?;

        // 列表可能直接是数组，也可能包在 storage_objects / data 字段里
        let items = match json {
            Value::Array(items) => items,
            Value::Object(mut map) => match map
                .remove("storage_objects")
                .or_else(|| map.remove("data"))
            {
                Some(Value::Array(items)) => items,
                _ => anyhow::bail!("存储对象列表格式错误"),
            },
            _ => anyhow::bail!("存储对象列表格式错误"),
        };

        let mut objects = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<StorageObject>(item) {
                Ok(object) => objects.push(object),
                Err(e) => warn!("跳过无法解析的存储对象: {}", e),
            }
        }

        info!("获取存储对象列表成功: {} 个", objects.len());
        Ok(objects)
    }

    /// 删除远端存储对象
    ///
    /// 失败不返回 Err，而是在结果里标记 success=false
    pub async fn delete_object(&self, object_id: &str) -> DeleteObjectResult {
        let result = self
            .client
            .delete(self.endpoint(&format!("storage/{}", object_id)))
            .header("Authorization", self.bearer())
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!("删除存储对象请求失败: id={}, 错误: {}", object_id, e);
                return DeleteObjectResult {
                    success: false,
                    object_id: object_id.to_string(),
                    file_name: None,
                    error: Some(e.to_string()),
                };
            }
        };

        let status = response.status();
        let json: Value = response.json().await.unwrap_or(Value::Null);

        if status.as_u16() == 200 || status.as_u16() == 204 {
            let file_name = json["name"]
                .as_str()
                .unwrap_or("Unknown File")
                .to_string();
            info!("删除存储对象成功: id={}, name={}", object_id, file_name);
            DeleteObjectResult {
                success: true,
                object_id: object_id.to_string(),
                file_name: Some(file_name),
                error: None,
            }
        } else {
            let message = json["message"]
                .as_str()
                .unwrap_or("Unknown error")
                .to_string();
            warn!(
                "删除存储对象失败: id={}, status={}, message={}",
                object_id, status, message
            );
            DeleteObjectResult {
                success: false,
                object_id: object_id.to_string(),
                file_name: None,
                error: Some(message),
            }
        }
    }

    /// 把分片数据切成小段的流式 Body，每段被 HTTP 层取走时回报进度
    fn progress_body(&self, payload: Bytes, on_progress: ByteProgressFn) -> Body {
        if payload.is_empty() {
            return Body::from(payload);
        }

        let slice_size = self.stream_slice_size;
        let slices: Vec<Bytes> = (0..payload.len())
            .step_by(slice_size)
            .map(|start| payload.slice(start..(start + slice_size).min(payload.len())))
            .collect();

        let stream = futures::stream::iter(slices.into_iter().map(move |slice| {
            on_progress(slice.len() as u64);
            Ok::<Bytes, std::io::Error>(slice)
        }));

        Body::wrap_stream(stream)
    }
}

#[async_trait]
impl StorageApi for StorageClient {
    async fn negotiate_concurrency(&self, size_hint: u64) -> Result<ConcurrencyLimitResponse> {
        debug!("协商并发策略: size_hint={}", size_hint);

        let response = self
            .client
            .get(self.endpoint("storage/concurrency_limit"))
            .query(&[("size_hint", size_hint)])
            .header("Authorization", self.bearer())
            .send()
            .await
            .context("并发策略请求发送失败")?;
        let response = Self::ensure_success(response, "获取并发策略").await?;

        let policy: ConcurrencyLimitResponse =
            response.json().await.context("解析并发策略响应失败")?;

        info!(
            "并发策略: concurrency_limit={}, chunk_size={}",
            policy.concurrency_limit, policy.chunk_size
        );
        Ok(policy)
    }

    async fn initiate_session(&self, file_key: &str) -> Result<String> {
        let response = self
            .client
            .post(self.endpoint("storage/initiate_multipart_upload"))
            .header("Authorization", self.bearer())
            .json(&InitiateMultipartRequest { s3_key: file_key })
            .send()
            .await
            .context("初始化分片上传请求发送失败")?;
        let response = Self::ensure_success(response, "初始化分片上传").await?;

        let body: InitiateMultipartResponse =
            response.json().await.context("解析初始化分片上传响应失败")?;
        if body.upload_id.is_empty() {
            anyhow::bail!("初始化分片上传失败：未获取到 upload_id");
        }

        info!("初始化分片上传成功: key={}, upload_id={}", file_key, body.upload_id);
        Ok(body.upload_id)
    }

    async fn presigned_part_url(
        &self,
        file_key: &str,
        part_number: u32,
        upload_id: &str,
    ) -> Result<String> {
        let response = self
            .client
            .get(self.endpoint("storage/presigned_url_for_part"))
            .query(&PresignedPartQuery {
                s3_key: file_key,
                part_number,
                upload_id,
            })
            .header("Authorization", self.bearer())
            .send()
            .await
            .context("预签名 URL 请求发送失败")?;
        let response = Self::ensure_success(response, "获取预签名 URL").await?;

        let body: PresignedUrlResponse =
            response.json().await.context("解析预签名 URL 响应失败")?;

        debug!("[分片#{}] 获取预签名 URL 成功", part_number);
        Ok(body.url)
    }

    async fn put_part(
        &self,
        url: &str,
        payload: Bytes,
        on_progress: ByteProgressFn,
    ) -> Result<String> {
        let content_length = payload.len() as u64;

        let mut request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, content_length);
        if self.auth_part_uploads {
            request = request.header("Authorization", self.bearer());
        }

        let response = request
            .body(self.progress_body(payload, on_progress))
            .send()
            .await
            .context("上传分片请求发送失败")?;
        let response = Self::ensure_success(response, "上传分片").await?;

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .context("上传分片响应缺少 ETag")?;

        Ok(etag)
    }

    async fn complete_session(
        &self,
        file_key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        info!(
            "完成分片上传: key={}, upload_id={}, parts={}",
            file_key,
            upload_id,
            parts.len()
        );

        let response = self
            .client
            .post(self.endpoint("storage/complete_multipart_upload"))
            .header("Authorization", self.bearer())
            .json(&CompleteMultipartRequest {
                s3_key: file_key,
                upload_id,
                parts,
            })
            .send()
            .await
            .context("完成分片上传请求发送失败")?;
        Self::ensure_success(response, "完成分片上传").await?;

        Ok(())
    }

    async fn register_object(&self, file_key: &str, name: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint("storage"))
            .header("Authorization", self.bearer())
            .json(&RegisterObjectRequest {
                storage_object: StorageObjectPayload {
                    name,
                    s3_key: file_key,
                },
            })
            .send()
            .await
            .context("注册存储对象请求发送失败")?;
        Self::ensure_success(response, "注册存储对象").await?;

        info!("存储对象注册成功: {}", name);
        Ok(())
    }

    async fn abort_session(&self, file_key: &str, upload_id: &str) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint("storage/abort_multipart_upload"))
            .header("Authorization", self.bearer())
            .json(&AbortMultipartRequest {
                s3_key: file_key,
                upload_id,
            })
            .send()
            .await
            .context("放弃分片上传请求发送失败")?;
        Self::ensure_success(response, "放弃分片上传").await?;

        info!("已放弃分片上传: key={}, upload_id={}", file_key, upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_client(server: &MockServer) -> StorageClient {
        let config = ApiConfig {
            base_url: format!("{}/api/v2/", server.uri()),
            ..ApiConfig::default()
        };
        StorageClient::new(&config, "test-token").unwrap()
    }

    #[tokio::test]
    async fn test_negotiate_concurrency() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/storage/concurrency_limit"))
            .and(query_param("size_hint", "12582912"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "concurrency_limit": 2,
                "chunk_size": 5242880
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = create_test_client(&server);
        let policy = client.negotiate_concurrency(12 * 1024 * 1024).await.unwrap();

        assert_eq!(policy.concurrency_limit, 2);
        assert_eq!(policy.chunk_size, 5 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_negotiate_concurrency_non_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/storage/concurrency_limit"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let client = create_test_client(&server);
        let err = client.negotiate_concurrency(1024).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_initiate_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/storage/initiate_multipart_upload"))
            .and(body_json(serde_json::json!({ "s3_key": "video.mp4" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "upload_id": "mpu-123" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = create_test_client(&server);
        let upload_id = client.initiate_session("video.mp4").await.unwrap();
        assert_eq!(upload_id, "mpu-123");
    }

    #[tokio::test]
    async fn test_presigned_part_url_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/storage/presigned_url_for_part"))
            .and(query_param("s3_key", "video.mp4"))
            .and(query_param("part_number", "3"))
            .and(query_param("upload_id", "mpu-123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "url": "https://bucket/p3" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = create_test_client(&server);
        let url = client
            .presigned_part_url("video.mp4", 3, "mpu-123")
            .await
            .unwrap();
        assert_eq!(url, "https://bucket/p3");
    }

    #[tokio::test]
    async fn test_put_part_reports_progress_and_etag() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/part-1"))
            .and(header("Content-Type", "application/octet-stream"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"etag-1\""))
            .expect(1)
            .mount(&server)
            .await;

        let client = create_test_client(&server).with_stream_slice_size(1000);
        let reported = Arc::new(AtomicU64::new(0));
        let reported_clone = reported.clone();
        let on_progress: ByteProgressFn = Arc::new(move |n: u64| {
            reported_clone.fetch_add(n, Ordering::SeqCst);
        });

        let payload = Bytes::from(vec![7u8; 4500]);
        let url = format!("{}/bucket/part-1", server.uri());
        let etag = client.put_part(&url, payload, on_progress).await.unwrap();

        assert_eq!(etag, "\"etag-1\"");
        assert_eq!(reported.load(Ordering::SeqCst), 4500);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests[0].body.len(), 4500);
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_put_part_missing_etag() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = create_test_client(&server);
        let url = format!("{}/bucket/part-1", server.uri());
        let err = client
            .put_part(&url, Bytes::from_static(b"abc"), Arc::new(|_: u64| {}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ETag"));
    }

    #[tokio::test]
    async fn test_complete_and_register() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/storage/complete_multipart_upload"))
            .and(body_json(serde_json::json!({
                "s3_key": "a.bin",
                "upload_id": "mpu-1",
                "parts": [
                    { "part_number": 1, "etag": "e1" },
                    { "part_number": 2, "etag": "e2" }
                ]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/storage"))
            .and(body_json(serde_json::json!({
                "storage_object": { "name": "a.bin", "s3_key": "a.bin" }
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = create_test_client(&server);
        let parts = vec![
            CompletedPart {
                part_number: 1,
                etag: "e1".to_string(),
            },
            CompletedPart {
                part_number: 2,
                etag: "e2".to_string(),
            },
        ];
        client.complete_session("a.bin", "mpu-1", &parts).await.unwrap();
        client.register_object("a.bin", "a.bin").await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_session_non_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/storage/abort_multipart_upload"))
            .and(header("Authorization", "Bearer test-token"))
            .and(body_json(serde_json::json!({ "s3_key": "a.bin", "upload_id": "mpu-1" })))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let client = create_test_client(&server);
        assert!(client.abort_session("a.bin", "mpu-1").await.is_err());
    }

    #[tokio::test]
    async fn test_list_and_delete_objects() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/storage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "id": 1, "name": "a.bin" },
                { "id": "2", "s3_key": "b.bin" }
            ])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v2/storage/1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "name": "a.bin" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v2/storage/9"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_json(serde_json::json!({ "message": "not found" })),
            )
            .mount(&server)
            .await;

        let client = create_test_client(&server);
        let objects = client.list_objects().await.unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1].display_name(), "b.bin");

        let deleted = client.delete_object("1").await;
        assert!(deleted.success);
        assert_eq!(deleted.file_name.as_deref(), Some("a.bin"));

        let missing = client.delete_object("9").await;
        assert!(!missing.success);
        assert_eq!(missing.error.as_deref(), Some("not found"));
    }
}
