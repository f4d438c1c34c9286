// 分片传输
//
// 单个分片的完整流程：
// 1. 定位读取分片数据（阻塞线程池）
// 2. 获取预签名 URL
// 3. 流式 PUT，边发送边回报进度
// 4. 取 ETag
// 5. 可选的事后限速：分片耗时短于 length / max_bps 时补足差值

use crate::storage::{ByteProgressFn, CompletedPart, StorageApi};
use crate::uploader::error::describe;
use crate::uploader::{ProgressAggregator, UploadError, UploadPart};
use bytes::Bytes;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 上传源文件
///
/// 每个会话只打开一次，所有分片任务共享同一个句柄做定位读取
#[derive(Debug, Clone)]
pub struct SourceFile {
    file: Arc<File>,
    len: u64,
}

impl SourceFile {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let file = File::open(&path)?;
            let len = file.metadata()?.len();
            Ok::<_, io::Error>(Self {
                file: Arc::new(file),
                len,
            })
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 读取分片的全部字节，不足时返回 ShortRead
    pub async fn read_part(&self, part: UploadPart) -> Result<Bytes, UploadError> {
        if part.length == 0 {
            return Ok(Bytes::new());
        }

        let file = self.file.clone();
        let length = usize::try_from(part.length).map_err(|_| {
            UploadError::InvalidInput(format!("分片#{} 长度超出内存寻址范围", part.part_number))
        })?;

        let read = tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; length];
            let filled = read_full_at(&file, &mut buffer, part.offset)?;
            buffer.truncate(filled);
            Ok::<_, io::Error>(buffer)
        })
        .await;

        let buffer = match read {
            Ok(Ok(buffer)) => buffer,
            Ok(Err(e)) => {
                return Err(UploadError::PartUploadFailed {
                    part_number: part.part_number,
                    message: format!("读取分片数据失败: {}", e),
                })
            }
            Err(e) => {
                return Err(UploadError::PartUploadFailed {
                    part_number: part.part_number,
                    message: format!("读取任务异常: {}", e),
                })
            }
        };

        if buffer.len() as u64 != part.length {
            return Err(UploadError::ShortRead {
                part_number: part.part_number,
                expected: part.length,
                actual: buffer.len() as u64,
            });
        }

        debug!(
            "读取分片 #{}: bytes={}-{}, 大小={} bytes",
            part.part_number,
            part.offset,
            part.offset + part.length - 1,
            buffer.len()
        );
        Ok(Bytes::from(buffer))
    }
}

/// 从 offset 起尽量填满 buf，返回实际读取字节数（遇到 EOF 提前结束）
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match positional_read(file, &mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(unix)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// 分片传输器（一个会话一个）
pub struct PartTransport {
    api: Arc<dyn StorageApi>,
    file_key: String,
    progress: Arc<ProgressAggregator>,
    /// None 表示不限速
    max_upload_speed_bps: Option<u64>,
}

impl PartTransport {
    pub fn new(
        api: Arc<dyn StorageApi>,
        file_key: impl Into<String>,
        progress: Arc<ProgressAggregator>,
        max_upload_speed_bps: Option<u64>,
    ) -> Self {
        Self {
            api,
            file_key: file_key.into(),
            progress,
            max_upload_speed_bps: max_upload_speed_bps.filter(|bps| *bps > 0),
        }
    }

    /// 上传单个分片，返回 (序号, ETag)
    pub async fn upload_part(
        &self,
        source: &SourceFile,
        part: UploadPart,
        upload_id: &str,
        cancel_token: &CancellationToken,
    ) -> Result<CompletedPart, UploadError> {
        if cancel_token.is_cancelled() {
            return Err(UploadError::Canceled);
        }
        let started = Instant::now();
        let part_number = part.part_number;

        let payload = source.read_part(part).await?;

        let url = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return Err(UploadError::Canceled),
            result = self.api.presigned_part_url(&self.file_key, part_number, upload_id) => {
                result.map_err(|e| UploadError::PresignFailed {
                    part_number,
                    message: describe(&e),
                })?
            }
        };

        let progress = self.progress.clone();
        let on_progress: ByteProgressFn = Arc::new(move |n: u64| progress.on_bytes(part_number, n));

        let etag = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => return Err(UploadError::Canceled),
            result = self.api.put_part(&url, payload, on_progress) => {
                result.map_err(|e| UploadError::PartUploadFailed {
                    part_number,
                    message: describe(&e),
                })?
            }
        };

        debug!(
            "[分片#{}] 上传完成: {} bytes, 耗时 {:?}, etag={}",
            part_number,
            part.length,
            started.elapsed(),
            etag
        );

        if let Some(delay) = self.throttle_delay(part.length, started.elapsed()) {
            debug!("[分片#{}] 限速等待 {:?}", part_number, delay);
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => return Err(UploadError::Canceled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Ok(CompletedPart { part_number, etag })
    }

    /// 按 length / max_bps 计算的最短耗时减去实际耗时
    fn throttle_delay(&self, length: u64, elapsed: Duration) -> Option<Duration> {
        let bps = self.max_upload_speed_bps?;
        let min_duration = Duration::from_secs_f64(length as f64 / bps as f64);
        min_duration.checked_sub(elapsed).filter(|d| !d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::testing::MockStorage;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_source(content: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content).unwrap();
        file.flush().unwrap();
        file
    }

    fn part(part_number: u32, offset: u64, length: u64) -> UploadPart {
        UploadPart {
            part_number,
            offset,
            length,
        }
    }

    #[tokio::test]
    async fn test_read_part_positional() {
        let content: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let file = temp_source(&content);
        let source = SourceFile::open(file.path()).await.unwrap();
        assert_eq!(source.len(), 10_000);

        let data = source.read_part(part(2, 4096, 4096)).await.unwrap();
        assert_eq!(&data[..], &content[4096..8192]);

        let empty = source.read_part(part(1, 0, 0)).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_read_part_short_read() {
        let file = temp_source(&[1u8; 100]);
        let source = SourceFile::open(file.path()).await.unwrap();

        let err = source.read_part(part(1, 50, 100)).await.unwrap_err();
        assert_eq!(
            err,
            UploadError::ShortRead {
                part_number: 1,
                expected: 100,
                actual: 50
            }
        );
    }

    #[tokio::test]
    async fn test_upload_part_success_reports_progress() {
        let file = temp_source(&[9u8; 2048]);
        let source = SourceFile::open(file.path()).await.unwrap();
        let mock = Arc::new(MockStorage::new(1, 1024));
        let progress = Arc::new(ProgressAggregator::new(2048));
        let transport = PartTransport::new(mock.clone(), "a.bin", progress.clone(), None);

        let completed = transport
            .upload_part(&source, part(2, 1024, 1024), "mpu-a.bin", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(completed.part_number, 2);
        assert_eq!(completed.etag, "\"etag-2\"");
        assert_eq!(progress.uploaded_bytes(), 1024);
        assert_eq!(mock.presigned(), vec![2]);
    }

    #[tokio::test]
    async fn test_upload_part_presign_failure() {
        let file = temp_source(&[0u8; 10]);
        let source = SourceFile::open(file.path()).await.unwrap();
        let mock = Arc::new(MockStorage::new(1, 10));
        mock.fail_presign_for(1);
        let transport =
            PartTransport::new(mock.clone(), "a.bin", Arc::new(ProgressAggregator::new(10)), None);

        let err = transport
            .upload_part(&source, part(1, 0, 10), "mpu", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::PresignFailed { part_number: 1, .. }));
        assert!(mock.put_parts().is_empty());
    }

    #[tokio::test]
    async fn test_upload_part_put_failure() {
        let file = temp_source(&[0u8; 10]);
        let source = SourceFile::open(file.path()).await.unwrap();
        let mock = Arc::new(MockStorage::new(1, 10));
        mock.fail_put_for(1);
        let transport =
            PartTransport::new(mock, "a.bin", Arc::new(ProgressAggregator::new(10)), None);

        let err = transport
            .upload_part(&source, part(1, 0, 10), "mpu", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::PartUploadFailed { part_number: 1, .. }));
    }

    #[tokio::test]
    async fn test_upload_part_canceled_while_in_flight() {
        let file = temp_source(&[0u8; 10]);
        let source = SourceFile::open(file.path()).await.unwrap();
        let mock = Arc::new(MockStorage::new(1, 10));
        mock.stall_puts();
        let transport =
            PartTransport::new(mock.clone(), "a.bin", Arc::new(ProgressAggregator::new(10)), None);

        let token = CancellationToken::new();
        let canceler = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceler.cancel();
        });

        let err = transport
            .upload_part(&source, part(1, 0, 10), "mpu", &token)
            .await
            .unwrap_err();
        assert_eq!(err, UploadError::Canceled);
        assert!(mock.put_parts().is_empty());
    }

    #[tokio::test]
    async fn test_upload_part_canceled_before_start() {
        let file = temp_source(&[0u8; 10]);
        let source = SourceFile::open(file.path()).await.unwrap();
        let mock = Arc::new(MockStorage::new(1, 10));
        let transport =
            PartTransport::new(mock.clone(), "a.bin", Arc::new(ProgressAggregator::new(10)), None);

        let token = CancellationToken::new();
        token.cancel();
        let err = transport
            .upload_part(&source, part(1, 0, 10), "mpu", &token)
            .await
            .unwrap_err();
        assert_eq!(err, UploadError::Canceled);
        assert!(mock.presigned().is_empty());
    }

    #[tokio::test]
    async fn test_soft_throttle_delays_fast_part() {
        let file = temp_source(&[0u8; 200]);
        let source = SourceFile::open(file.path()).await.unwrap();
        let mock = Arc::new(MockStorage::new(1, 200));
        // 200 bytes @ 2000 B/s -> 至少 100ms
        let transport = PartTransport::new(
            mock,
            "a.bin",
            Arc::new(ProgressAggregator::new(200)),
            Some(2000),
        );

        let started = Instant::now();
        transport
            .upload_part(&source, part(1, 0, 200), "mpu", &CancellationToken::new())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(95));
    }

    #[test]
    fn test_throttle_delay_disabled_for_zero_rate() {
        let transport = PartTransport::new(
            Arc::new(MockStorage::new(1, 1)),
            "a.bin",
            Arc::new(ProgressAggregator::new(1)),
            Some(0),
        );
        assert_eq!(transport.throttle_delay(1_000_000, Duration::ZERO), None);
    }
}
