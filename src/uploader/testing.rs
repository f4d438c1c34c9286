// 测试用内存存储后端

use crate::storage::{ByteProgressFn, CompletedPart, ConcurrencyLimitResponse, StorageApi};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteCall {
    pub file_key: String,
    pub upload_id: String,
    pub parts: Vec<CompletedPart>,
}

#[derive(Default)]
struct Calls {
    size_hints: Vec<u64>,
    initiated: Vec<String>,
    presigned: Vec<u32>,
    puts: Vec<(u32, Bytes)>,
    completed: Vec<CompleteCall>,
    registered: Vec<(String, String)>,
    aborted: Vec<(String, String)>,
}

#[derive(Default)]
struct Faults {
    negotiate: bool,
    initiate: bool,
    complete: bool,
    register: bool,
    abort: bool,
    presign_parts: HashSet<u32>,
    put_parts: HashSet<u32>,
    put_delays: HashMap<u32, Duration>,
}

/// 记录所有调用的 StorageApi 替身
pub struct MockStorage {
    policy: ConcurrencyLimitResponse,
    calls: Mutex<Calls>,
    faults: Mutex<Faults>,
    /// 为 true 时 PUT 永不返回（等待取消）
    stall_puts: AtomicBool,
    finished_puts: AtomicUsize,
    /// 第 N 个 PUT 完成后触发取消
    cancel_after_puts: Mutex<Option<(usize, CancellationToken)>>,
}

impl MockStorage {
    pub fn new(concurrency_limit: usize, chunk_size: u64) -> Self {
        Self {
            policy: ConcurrencyLimitResponse {
                concurrency_limit,
                chunk_size,
            },
            calls: Mutex::new(Calls::default()),
            faults: Mutex::new(Faults::default()),
            stall_puts: AtomicBool::new(false),
            finished_puts: AtomicUsize::new(0),
            cancel_after_puts: Mutex::new(None),
        }
    }

    pub fn fail_negotiate(&self) {
        self.faults.lock().negotiate = true;
    }

    pub fn fail_initiate(&self) {
        self.faults.lock().initiate = true;
    }

    pub fn fail_complete(&self) {
        self.faults.lock().complete = true;
    }

    pub fn fail_register(&self) {
        self.faults.lock().register = true;
    }

    pub fn fail_abort(&self) {
        self.faults.lock().abort = true;
    }

    pub fn fail_presign_for(&self, part_number: u32) {
        self.faults.lock().presign_parts.insert(part_number);
    }

    pub fn fail_put_for(&self, part_number: u32) {
        self.faults.lock().put_parts.insert(part_number);
    }

    pub fn delay_put_for(&self, part_number: u32, delay: Duration) {
        self.faults.lock().put_delays.insert(part_number, delay);
    }

    pub fn stall_puts(&self) {
        self.stall_puts.store(true, Ordering::SeqCst);
    }

    pub fn cancel_after_puts(&self, count: usize, token: CancellationToken) {
        *self.cancel_after_puts.lock() = Some((count, token));
    }

    pub fn size_hints(&self) -> Vec<u64> {
        self.calls.lock().size_hints.clone()
    }

    pub fn initiated(&self) -> Vec<String> {
        self.calls.lock().initiated.clone()
    }

    pub fn presigned(&self) -> Vec<u32> {
        self.calls.lock().presigned.clone()
    }

    /// 已成功 PUT 的分片序号（按完成顺序）
    pub fn put_parts(&self) -> Vec<u32> {
        self.calls.lock().puts.iter().map(|(n, _)| *n).collect()
    }

    /// 按分片序号拼接出的完整内容
    pub fn assembled_payload(&self) -> Vec<u8> {
        let mut puts = self.calls.lock().puts.clone();
        puts.sort_by_key(|(n, _)| *n);
        puts.into_iter().flat_map(|(_, b)| b.to_vec()).collect()
    }

    pub fn completed(&self) -> Vec<CompleteCall> {
        self.calls.lock().completed.clone()
    }

    pub fn registered(&self) -> Vec<(String, String)> {
        self.calls.lock().registered.clone()
    }

    pub fn aborted(&self) -> Vec<(String, String)> {
        self.calls.lock().aborted.clone()
    }

    fn part_from_url(url: &str) -> u32 {
        url.rsplit('/')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

#[async_trait]
impl StorageApi for MockStorage {
    async fn negotiate_concurrency(&self, size_hint: u64) -> Result<ConcurrencyLimitResponse> {
        self.calls.lock().size_hints.push(size_hint);
        if self.faults.lock().negotiate {
            anyhow::bail!("获取并发策略失败: status=503");
        }
        Ok(self.policy)
    }

    async fn initiate_session(&self, file_key: &str) -> Result<String> {
        self.calls.lock().initiated.push(file_key.to_string());
        if self.faults.lock().initiate {
            anyhow::bail!("初始化分片上传失败: status=500");
        }
        Ok(format!("mpu-{}", file_key))
    }

    async fn presigned_part_url(
        &self,
        file_key: &str,
        part_number: u32,
        _upload_id: &str,
    ) -> Result<String> {
        self.calls.lock().presigned.push(part_number);
        if self.faults.lock().presign_parts.contains(&part_number) {
            anyhow::bail!("获取预签名 URL 失败: status=403");
        }
        Ok(format!("https://bucket.mock/{}/{}", file_key, part_number))
    }

    async fn put_part(
        &self,
        url: &str,
        payload: Bytes,
        on_progress: ByteProgressFn,
    ) -> Result<String> {
        let part_number = Self::part_from_url(url);

        if self.stall_puts.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }

        let (delay, fail) = {
            let faults = self.faults.lock();
            (
                faults.put_delays.get(&part_number).copied(),
                faults.put_parts.contains(&part_number),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            anyhow::bail!("上传分片失败: status=500");
        }

        on_progress(payload.len() as u64);
        self.calls.lock().puts.push((part_number, payload));

        let finished = self.finished_puts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((count, token)) = self.cancel_after_puts.lock().as_ref() {
            if finished >= *count {
                token.cancel();
            }
        }

        Ok(format!("\"etag-{}\"", part_number))
    }

    async fn complete_session(
        &self,
        file_key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<()> {
        self.calls.lock().completed.push(CompleteCall {
            file_key: file_key.to_string(),
            upload_id: upload_id.to_string(),
            parts: parts.to_vec(),
        });
        if self.faults.lock().complete {
            anyhow::bail!("完成分片上传失败: status=500");
        }
        Ok(())
    }

    async fn register_object(&self, file_key: &str, name: &str) -> Result<()> {
        self.calls
            .lock()
            .registered
            .push((file_key.to_string(), name.to_string()));
        if self.faults.lock().register {
            anyhow::bail!("注册存储对象失败: status=422");
        }
        Ok(())
    }

    async fn abort_session(&self, file_key: &str, upload_id: &str) -> Result<()> {
        self.calls
            .lock()
            .aborted
            .push((file_key.to_string(), upload_id.to_string()));
        if self.faults.lock().abort {
            anyhow::bail!("放弃分片上传失败: status=500");
        }
        Ok(())
    }
}
