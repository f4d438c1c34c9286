// 上传错误分类

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 上传会话错误
///
/// 协作方返回的 anyhow 错误在调用点映射为这里的某一类
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("无法获取并发策略: {0}")]
    PolicyUnavailable(String),

    #[error("初始化分片会话失败: {0}")]
    SessionInitFailed(String),

    #[error("分片#{part_number} 读取不足: 期望 {expected} 字节, 实际 {actual} 字节")]
    ShortRead {
        part_number: u32,
        expected: u64,
        actual: u64,
    },

    #[error("分片#{part_number} 获取预签名 URL 失败: {message}")]
    PresignFailed { part_number: u32, message: String },

    #[error("分片#{part_number} 上传失败: {message}")]
    PartUploadFailed { part_number: u32, message: String },

    #[error("上传已取消")]
    Canceled,

    #[error("完成分片会话失败: {0}")]
    CompletionFailed(String),

    #[error("注册存储对象失败: {0}")]
    ObjectRegistrationFailed(String),

    #[error("无效输入: {0}")]
    InvalidInput(String),
}

/// 可序列化的错误类别（随 Error 事件下发）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UploadErrorKind {
    PolicyUnavailable,
    SessionInitFailed,
    ShortRead,
    PresignFailed,
    PartUploadFailed,
    Canceled,
    CompletionFailed,
    ObjectRegistrationFailed,
    InvalidInput,
}

impl UploadError {
    pub fn kind(&self) -> UploadErrorKind {
        match self {
            UploadError::PolicyUnavailable(_) => UploadErrorKind::PolicyUnavailable,
            UploadError::SessionInitFailed(_) => UploadErrorKind::SessionInitFailed,
            UploadError::ShortRead { .. } => UploadErrorKind::ShortRead,
            UploadError::PresignFailed { .. } => UploadErrorKind::PresignFailed,
            UploadError::PartUploadFailed { .. } => UploadErrorKind::PartUploadFailed,
            UploadError::Canceled => UploadErrorKind::Canceled,
            UploadError::CompletionFailed(_) => UploadErrorKind::CompletionFailed,
            UploadError::ObjectRegistrationFailed(_) => UploadErrorKind::ObjectRegistrationFailed,
            UploadError::InvalidInput(_) => UploadErrorKind::InvalidInput,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, UploadError::Canceled)
    }

    /// 出错的分片序号（与分片无关的错误返回 None）
    pub fn part_number(&self) -> Option<u32> {
        match self {
            UploadError::ShortRead { part_number, .. }
            | UploadError::PresignFailed { part_number, .. }
            | UploadError::PartUploadFailed { part_number, .. } => Some(*part_number),
            _ => None,
        }
    }
}

/// anyhow 错误链压成一行，便于放进事件与日志
pub(crate) fn describe(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = UploadError::PartUploadFailed {
            part_number: 3,
            message: "status=500".to_string(),
        };
        assert_eq!(err.kind(), UploadErrorKind::PartUploadFailed);
        assert_eq!(err.part_number(), Some(3));
        assert!(!err.is_canceled());

        assert!(UploadError::Canceled.is_canceled());
        assert_eq!(UploadError::Canceled.part_number(), None);
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&UploadErrorKind::ObjectRegistrationFailed).unwrap();
        assert_eq!(json, "\"object_registration_failed\"");
    }

    #[test]
    fn test_describe_keeps_context_chain() {
        let err = anyhow::anyhow!("status=503").context("获取并发策略失败");
        assert_eq!(describe(&err), "获取并发策略失败: status=503");
    }
}
