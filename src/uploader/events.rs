//! 上传会话事件
//!
//! 每个会话一条 mpsc 通道；终态事件（Success / Error）只发送一次

use crate::uploader::{UploadError, UploadErrorKind, UploadSessionStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// 上传会话事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 进度更新
    Progress {
        session_id: String,
        progress_percent: u8,
        bytes_per_second: u64,
    },
    /// 状态变更
    StatusChanged {
        session_id: String,
        old_status: UploadSessionStatus,
        new_status: UploadSessionStatus,
    },
    /// 上传成功
    Success {
        session_id: String,
        name: String,
        path: PathBuf,
    },
    /// 上传失败或已取消（canceled = true 时仅作提示）
    Error {
        session_id: String,
        file_name: String,
        message: String,
        kind: UploadErrorKind,
        canceled: bool,
    },
}

impl UploadEvent {
    pub fn session_id(&self) -> &str {
        match self {
            UploadEvent::Progress { session_id, .. }
            | UploadEvent::StatusChanged { session_id, .. }
            | UploadEvent::Success { session_id, .. }
            | UploadEvent::Error { session_id, .. } => session_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadEvent::Success { .. } | UploadEvent::Error { .. })
    }
}

/// 会话事件发送端
///
/// 接收端被丢弃后发送静默失败，不影响上传本身
#[derive(Debug)]
pub struct UploadNotifier {
    session_id: String,
    sender: mpsc::UnboundedSender<UploadEvent>,
    terminal_sent: AtomicBool,
}

impl UploadNotifier {
    pub fn new(session_id: impl Into<String>, sender: mpsc::UnboundedSender<UploadEvent>) -> Self {
        Self {
            session_id: session_id.into(),
            sender,
            terminal_sent: AtomicBool::new(false),
        }
    }

    /// 创建通知器及其接收端
    pub fn channel(session_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(session_id, tx), rx)
    }

    pub fn progress(&self, progress_percent: u8, bytes_per_second: u64) {
        if self.terminal_sent.load(Ordering::SeqCst) {
            return;
        }
        self.send(UploadEvent::Progress {
            session_id: self.session_id.clone(),
            progress_percent,
            bytes_per_second,
        });
    }

    pub fn status_changed(&self, old_status: UploadSessionStatus, new_status: UploadSessionStatus) {
        self.send(UploadEvent::StatusChanged {
            session_id: self.session_id.clone(),
            old_status,
            new_status,
        });
    }

    /// 返回 false 表示终态事件已发送过
    pub fn success(&self, name: &str, path: PathBuf) -> bool {
        if !self.claim_terminal() {
            return false;
        }
        self.send(UploadEvent::Success {
            session_id: self.session_id.clone(),
            name: name.to_string(),
            path,
        });
        true
    }

    /// 返回 false 表示终态事件已发送过
    pub fn error(&self, file_name: &str, error: &UploadError) -> bool {
        if !self.claim_terminal() {
            return false;
        }
        self.send(UploadEvent::Error {
            session_id: self.session_id.clone(),
            file_name: file_name.to_string(),
            message: error.to_string(),
            kind: error.kind(),
            canceled: error.is_canceled(),
        });
        true
    }

    fn claim_terminal(&self) -> bool {
        self.terminal_sent
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn send(&self, event: UploadEvent) {
        if self.sender.send(event).is_err() {
            debug!("会话 {} 的事件接收端已关闭", self.session_id);
        }
    }
}
