// 上传管理器
//
// 负责管理多个上传会话：
// - 创建会话并为每个会话启动独立的引擎任务
// - 按会话 ID 取消
// - 会话进入终态后从活跃表移除
// - 保留最近的失败记录

use crate::config::UploadConfig;
use crate::storage::StorageApi;
use crate::uploader::{
    EngineOptions, UploadEngine, UploadError, UploadErrorKind, UploadEvent, UploadNotifier,
    UploadSession,
};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 最近失败记录的保留条数
pub const MAX_RECENT_ERRORS: usize = 100;

/// 活跃会话信息
#[derive(Debug, Clone)]
pub struct UploadSessionInfo {
    pub session: Arc<Mutex<UploadSession>>,
    pub cancel_token: CancellationToken,
}

/// 一条失败记录（取消不计入）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFailureRecord {
    pub session_id: String,
    pub file_name: String,
    pub message: String,
    pub kind: UploadErrorKind,
    /// Unix timestamp
    pub failed_at: i64,
}

/// start_upload 的返回值
///
/// `events` 是该会话独立的事件通道；`task` 在会话进入终态后结束
pub struct UploadHandle {
    pub session_id: String,
    pub events: mpsc::UnboundedReceiver<UploadEvent>,
    pub task: JoinHandle<Result<(), UploadError>>,
}

/// 上传管理器
#[derive(Clone)]
pub struct UploadManager {
    api: Arc<dyn StorageApi>,
    options: EngineOptions,
    /// 活跃会话（session_id -> info）
    sessions: Arc<DashMap<String, UploadSessionInfo>>,
    recent_errors: Arc<SyncMutex<VecDeque<UploadFailureRecord>>>,
}

impl UploadManager {
    pub fn new(api: Arc<dyn StorageApi>, config: &UploadConfig) -> Self {
        Self::with_options(api, EngineOptions::from_config(config))
    }

    pub fn with_options(api: Arc<dyn StorageApi>, options: EngineOptions) -> Self {
        info!(
            "创建上传管理器: 限速={:?} B/s, 进度间隔={:?}, 失败时放弃远端会话={}",
            options.max_upload_speed_bps, options.progress_interval, options.abort_on_failure
        );
        Self {
            api,
            options,
            sessions: Arc::new(DashMap::new()),
            recent_errors: Arc::new(SyncMutex::new(VecDeque::with_capacity(MAX_RECENT_ERRORS))),
        }
    }

    /// 为本地文件创建上传会话并立即开始
    pub async fn start_upload(&self, local_path: impl AsRef<Path>) -> Result<UploadHandle, UploadError> {
        let local_path = local_path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&local_path).await.map_err(|e| {
            UploadError::InvalidInput(format!("无法获取文件元数据 {:?}: {}", local_path, e))
        })?;
        if metadata.is_dir() {
            return Err(UploadError::InvalidInput(format!(
                "不支持上传目录: {:?}",
                local_path
            )));
        }

        let session = UploadSession::new(local_path.clone(), metadata.len());
        let session_id = session.id.clone();
        info!(
            "创建上传会话: id={}, local={:?}, size={}",
            session_id,
            local_path,
            metadata.len()
        );

        let session = Arc::new(Mutex::new(session));
        let cancel_token = CancellationToken::new();
        let (notifier, events) = UploadNotifier::channel(session_id.clone());

        self.sessions.insert(
            session_id.clone(),
            UploadSessionInfo {
                session: session.clone(),
                cancel_token: cancel_token.clone(),
            },
        );

        let engine = UploadEngine::new(
            self.api.clone(),
            session.clone(),
            cancel_token,
            Arc::new(notifier),
            self.options.clone(),
        );
        let sessions = self.sessions.clone();
        let recent_errors = self.recent_errors.clone();
        let id = session_id.clone();

        let task = tokio::spawn(async move {
            let result = engine.run().await;
            if let Err(e) = &result {
                if !e.is_canceled() {
                    let file_name = session.lock().await.name.clone();
                    record_failure(&recent_errors, &id, file_name, e);
                }
            }
            sessions.remove(&id);
            result
        });

        Ok(UploadHandle {
            session_id,
            events,
            task,
        })
    }

    /// 取消会话
    ///
    /// 未知会话、已结束会话或重复取消都是空操作，返回 false
    pub fn cancel_upload(&self, session_id: &str) -> bool {
        let Some(info) = self.sessions.get(session_id) else {
            return false;
        };
        if info.cancel_token.is_cancelled() {
            return false;
        }
        info.cancel_token.cancel();
        info!("取消上传会话: {}", session_id);
        true
    }

    /// 取消所有活跃会话，返回本次实际取消的数量
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let canceled = ids.iter().filter(|id| self.cancel_upload(id)).count();
        if canceled > 0 {
            info!("已取消 {} 个上传会话", canceled);
        }
        canceled
    }

    /// 获取活跃会话快照
    pub async fn get_session(&self, session_id: &str) -> Option<UploadSession> {
        // 先克隆 Arc，避免持有 DashMap 引用跨越 await
        let session = self.sessions.get(session_id)?.session.clone();
        let snapshot = session.lock().await.clone();
        Some(snapshot)
    }

    /// 所有活跃会话快照（按创建时间排序）
    pub async fn active_sessions(&self) -> Vec<UploadSession> {
        let handles: Vec<Arc<Mutex<UploadSession>>> =
            self.sessions.iter().map(|e| e.session.clone()).collect();

        let mut sessions = Vec::with_capacity(handles.len());
        for handle in handles {
            sessions.push(handle.lock().await.clone());
        }
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// 最近的失败记录（旧的在前）
    pub fn recent_errors(&self) -> Vec<UploadFailureRecord> {
        self.recent_errors.lock().iter().cloned().collect()
    }
}

fn record_failure(
    recent_errors: &SyncMutex<VecDeque<UploadFailureRecord>>,
    session_id: &str,
    file_name: String,
    err: &UploadError,
) {
    warn!("上传会话失败: id={}, file={}, 错误: {}", session_id, file_name, err);
    let mut errors = recent_errors.lock();
    if errors.len() >= MAX_RECENT_ERRORS {
        errors.pop_front();
    }
    errors.push_back(UploadFailureRecord {
        session_id: session_id.to_string(),
        file_name,
        message: err.to_string(),
        kind: err.kind(),
        failed_at: chrono::Utc::now().timestamp(),
    });
}
