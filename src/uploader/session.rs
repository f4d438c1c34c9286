// 上传会话定义

use crate::storage::CompletedPart;
use crate::uploader::ConcurrencyPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// 上传会话状态
///
/// pending → negotiating → uploading → completing → completed；
/// failed / canceled 可由任一非终态进入。终态不可再变更
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadSessionStatus {
    /// 等待中
    Pending,
    /// 协商并发策略
    Negotiating,
    /// 上传中
    Uploading,
    /// 完成分片会话并注册对象
    Completing,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Canceled,
}

impl UploadSessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadSessionStatus::Completed | UploadSessionStatus::Failed | UploadSessionStatus::Canceled
        )
    }

    /// 是否允许从 self 迁移到 next
    pub fn can_transition(self, next: UploadSessionStatus) -> bool {
        use UploadSessionStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) | (_, Canceled) => true,
            (Pending, Negotiating)
            | (Negotiating, Uploading)
            | (Uploading, Completing)
            | (Completing, Completed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadSessionStatus::Pending => "pending",
            UploadSessionStatus::Negotiating => "negotiating",
            UploadSessionStatus::Uploading => "uploading",
            UploadSessionStatus::Completing => "completing",
            UploadSessionStatus::Completed => "completed",
            UploadSessionStatus::Failed => "failed",
            UploadSessionStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for UploadSessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 上传会话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// 会话ID
    pub id: String,
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 显示名称（文件名），同时作为远端 s3_key
    pub name: String,
    /// 文件大小
    pub total_size: u64,
    /// 会话状态
    pub status: UploadSessionStatus,
    /// 进度百分比 (0-100)
    pub progress: u8,
    /// 上传速度 (bytes/s)
    pub speed: u64,
    /// 远端分片会话 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_session_id: Option<String>,
    /// 协商得到的分片大小
    #[serde(default)]
    pub chunk_size: u64,
    /// 协商得到的并发上限
    #[serde(default)]
    pub concurrency_limit: usize,
    /// 总分片数
    #[serde(default)]
    pub total_parts: usize,
    /// 已完成分片（完成顺序，提交前再排序）
    #[serde(default)]
    pub completed_parts: Vec<CompletedPart>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 结束时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 错误信息
    pub error: Option<String>,
}

impl UploadSession {
    /// 创建新的上传会话
    pub fn new(local_path: PathBuf, total_size: u64) -> Self {
        let name = file_key_for(&local_path);
        Self {
            id: Uuid::new_v4().to_string(),
            local_path,
            name,
            total_size,
            status: UploadSessionStatus::Pending,
            progress: 0,
            speed: 0,
            upload_session_id: None,
            chunk_size: 0,
            concurrency_limit: 0,
            total_parts: 0,
            completed_parts: Vec::new(),
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// 迁移状态，成功时返回旧状态
    fn transition(&mut self, next: UploadSessionStatus) -> Option<UploadSessionStatus> {
        if !self.status.can_transition(next) {
            return None;
        }
        let old = self.status;
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(chrono::Utc::now().timestamp());
        }
        Some(old)
    }

    /// 标记为协商中
    pub fn mark_negotiating(&mut self) -> Option<UploadSessionStatus> {
        let old = self.transition(UploadSessionStatus::Negotiating)?;
        self.started_at = Some(chrono::Utc::now().timestamp());
        Some(old)
    }

    /// 记录协商得到的策略
    pub fn apply_policy(&mut self, policy: ConcurrencyPolicy) {
        self.chunk_size = policy.chunk_size;
        self.concurrency_limit = policy.concurrency_limit;
    }

    /// 标记为上传中
    pub fn mark_uploading(&mut self, upload_session_id: String) -> Option<UploadSessionStatus> {
        let old = self.transition(UploadSessionStatus::Uploading)?;
        self.upload_session_id = Some(upload_session_id);
        Some(old)
    }

    /// 标记为提交中
    pub fn mark_completing(&mut self) -> Option<UploadSessionStatus> {
        self.transition(UploadSessionStatus::Completing)
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) -> Option<UploadSessionStatus> {
        let old = self.transition(UploadSessionStatus::Completed)?;
        self.progress = 100;
        Some(old)
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) -> Option<UploadSessionStatus> {
        let old = self.transition(UploadSessionStatus::Failed)?;
        self.error = Some(error);
        Some(old)
    }

    /// 标记为已取消
    pub fn mark_canceled(&mut self) -> Option<UploadSessionStatus> {
        self.transition(UploadSessionStatus::Canceled)
    }

    /// 更新进度
    ///
    /// 只在上传中生效；进度单调不减，且在提交完成前最多 99
    pub fn update_progress(&mut self, progress_percent: u8, speed: u64) -> bool {
        if self.status != UploadSessionStatus::Uploading {
            return false;
        }
        self.progress = self.progress.max(progress_percent.min(99));
        self.speed = speed;
        true
    }

    /// 记录一个成功的分片
    pub fn record_part(&mut self, part: CompletedPart) {
        self.completed_parts.push(part);
    }

    /// 按分片序号升序排列的已完成分片
    pub fn sorted_parts(&self) -> Vec<CompletedPart> {
        let mut parts = self.completed_parts.clone();
        parts.sort_by_key(|p| p.part_number);
        parts
    }

    /// 估算剩余时间 (秒)
    pub fn eta(&self) -> Option<u64> {
        if self.speed == 0 || self.progress >= 100 {
            return None;
        }
        let uploaded = self.total_size * self.progress as u64 / 100;
        Some(self.total_size.saturating_sub(uploaded) / self.speed)
    }
}

/// 远端对象键：取本地路径的文件名
pub fn file_key_for(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
