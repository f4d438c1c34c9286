// 会话进度聚合
//
// 各分片任务并发回报字节数，这里只做原子累加；
// 百分比与速度在采样时计算

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::trace;

/// 一次进度采样
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSample {
    /// 0-100
    pub progress_percent: u8,
    /// 累计平均速度 (bytes/s)
    pub bytes_per_second: u64,
    /// 已发送字节数
    pub uploaded_bytes: u64,
}

/// 进度聚合器
#[derive(Debug)]
pub struct ProgressAggregator {
    total_size: u64,
    uploaded: AtomicU64,
    started_at: Instant,
}

impl ProgressAggregator {
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            uploaded: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// 记录某分片新发出的字节数
    pub fn on_bytes(&self, part_number: u32, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let total = self.uploaded.fetch_add(bytes, Ordering::Relaxed) + bytes;
        trace!("[分片#{}] +{} bytes, 累计 {}", part_number, bytes, total);
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// 采样当前进度
    pub fn sample(&self) -> ProgressSample {
        let uploaded = self.uploaded_bytes();
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let bytes_per_second = if elapsed > 0.0 {
            (uploaded as f64 / elapsed) as u64
        } else {
            0
        };

        ProgressSample {
            progress_percent: percent_of(uploaded, self.total_size),
            bytes_per_second,
            uploaded_bytes: uploaded,
        }
    }
}

/// round(uploaded / total * 100)，限制在 [0, 100]；总大小为 0 时为 0
pub fn percent_of(uploaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (uploaded as f64 / total as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}
