// 上传引擎
//
// 单个会话的完整流程：
// 1. 打开源文件
// 2. 协商并发策略（negotiating）
// 3. 初始化远端分片会话（uploading）
// 4. 规划分片，按批次并发上传：批内 JoinSet 并发，批间串行
// 5. 按序号排序提交分片（completing）
// 6. 注册存储对象（completed）
//
// 任一分片失败：同批其他分片跑完，不再启动后续批次，报告序号最小的失败
// 取消：在途分片立即中止，不再提交、不再注册

use crate::config::UploadConfig;
use crate::storage::{CompletedPart, StorageApi};
use crate::uploader::error::describe;
use crate::uploader::{
    plan_parts, ConcurrencyAdvisor, PartTransport, ProgressAggregator, SourceFile, UploadError,
    UploadNotifier, UploadPart, UploadSession, UploadSessionStatus,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 引擎参数
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// 批次进行中的进度采样间隔
    pub progress_interval: Duration,
    /// 单分片限速上限，None 表示不限速
    pub max_upload_speed_bps: Option<u64>,
    /// 失败 / 取消后是否放弃远端分片会话
    pub abort_on_failure: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

impl EngineOptions {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            progress_interval: Duration::from_millis(config.progress_interval_ms.max(1)),
            max_upload_speed_bps: config.rate_limit(),
            abort_on_failure: config.abort_on_failure,
        }
    }
}

type PartOutcome = (u32, Result<CompletedPart, UploadError>);

/// 上传引擎
///
/// 会话状态只由引擎写入；分片任务通过 JoinSet 把结果交回
pub struct UploadEngine {
    api: Arc<dyn StorageApi>,
    session: Arc<Mutex<UploadSession>>,
    cancel_token: CancellationToken,
    notifier: Arc<UploadNotifier>,
    options: EngineOptions,
    /// 远端已接受 complete 请求，之后不能再放弃会话
    committed: AtomicBool,
}

impl UploadEngine {
    pub fn new(
        api: Arc<dyn StorageApi>,
        session: Arc<Mutex<UploadSession>>,
        cancel_token: CancellationToken,
        notifier: Arc<UploadNotifier>,
        options: EngineOptions,
    ) -> Self {
        Self {
            api,
            session,
            cancel_token,
            notifier,
            options,
            committed: AtomicBool::new(false),
        }
    }

    /// 执行上传，直到会话进入终态
    ///
    /// 终态事件（Success / Error）恰好发送一次
    pub async fn run(&self) -> Result<(), UploadError> {
        let result = self.execute().await;
        if let Err(e) = &result {
            self.finish_with_error(e).await;
        }
        result
    }

    async fn execute(&self) -> Result<(), UploadError> {
        let (local_path, file_key, total_size) = {
            let session = self.session.lock().await;
            (
                session.local_path.clone(),
                session.name.clone(),
                session.total_size,
            )
        };

        info!(
            "开始上传: local={:?}, key={}, size={}",
            local_path, file_key, total_size
        );

        self.ensure_active()?;
        let source = SourceFile::open(&local_path).await.map_err(|e| {
            UploadError::InvalidInput(format!("无法打开文件 {:?}: {}", local_path, e))
        })?;

        // 1. 协商并发策略
        self.transition(|s| s.mark_negotiating()).await;
        let advisor = ConcurrencyAdvisor::new(self.api.clone());
        let policy = self.cancellable(advisor.negotiate(total_size)).await??;
        self.session.lock().await.apply_policy(policy);

        // 2. 初始化远端分片会话
        self.ensure_active()?;
        let upload_id = self
            .cancellable(self.api.initiate_session(&file_key))
            .await?
            .map_err(|e| UploadError::SessionInitFailed(describe(&e)))?;
        let upload_id_for_session = upload_id.clone();
        self.transition(move |s| s.mark_uploading(upload_id_for_session))
            .await;

        // 3. 规划分片
        let plan = plan_parts(total_size, policy.chunk_size)?;
        self.session.lock().await.total_parts = plan.len();
        info!(
            "[并发上传] {} 个分片, 分片大小 {} bytes, 并发上限 {}, 共 {} 批",
            plan.len(),
            policy.chunk_size,
            policy.concurrency_limit,
            plan.wave_count(policy.concurrency_limit)
        );

        // 4. 按批次上传
        let progress = Arc::new(ProgressAggregator::new(total_size));
        let transport = Arc::new(PartTransport::new(
            self.api.clone(),
            file_key.clone(),
            progress.clone(),
            self.options.max_upload_speed_bps,
        ));

        for (wave_index, wave) in plan.waves(policy.concurrency_limit).enumerate() {
            self.ensure_active()?;
            debug!(
                "[批次#{}] 启动 {} 个分片: {:?}",
                wave_index + 1,
                wave.len(),
                wave.iter().map(|p| p.part_number).collect::<Vec<_>>()
            );

            let outcomes = self
                .run_wave(&transport, &source, wave, &upload_id, &progress)
                .await;
            self.settle_wave(outcomes).await?;
            self.publish_progress(&progress).await;
        }
        drop(source);

        // 5. 提交分片
        self.ensure_active()?;
        self.transition(|s| s.mark_completing()).await;
        let parts = self.session.lock().await.sorted_parts();
        if parts.len() != plan.len() {
            return Err(UploadError::CompletionFailed(format!(
                "分片数量不一致: 期望 {}, 实际 {}",
                plan.len(),
                parts.len()
            )));
        }
        self.api
            .complete_session(&file_key, &upload_id, &parts)
            .await
            .map_err(|e| UploadError::CompletionFailed(describe(&e)))?;
        self.committed.store(true, Ordering::SeqCst);

        // 6. 注册存储对象
        self.ensure_active()?;
        self.api
            .register_object(&file_key, &file_key)
            .await
            .map_err(|e| UploadError::ObjectRegistrationFailed(describe(&e)))?;

        self.finish_with_success(&progress).await;
        Ok(())
    }

    /// 并发上传一批分片，等待全部结束（期间按固定间隔发布进度）
    async fn run_wave(
        &self,
        transport: &Arc<PartTransport>,
        source: &SourceFile,
        wave: &[UploadPart],
        upload_id: &str,
        progress: &Arc<ProgressAggregator>,
    ) -> Vec<PartOutcome> {
        let mut join_set: JoinSet<PartOutcome> = JoinSet::new();
        for &part in wave {
            let transport = transport.clone();
            let source = source.clone();
            let upload_id = upload_id.to_string();
            let cancel_token = self.cancel_token.clone();
            join_set.spawn(async move {
                let result = transport
                    .upload_part(&source, part, &upload_id, &cancel_token)
                    .await;
                (part.part_number, result)
            });
        }

        let mut ticker = tokio::time::interval(self.options.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // interval 的第一次 tick 立即返回
        ticker.tick().await;

        let mut outcomes = Vec::with_capacity(wave.len());
        loop {
            tokio::select! {
                joined = join_set.join_next() => match joined {
                    Some(Ok(outcome)) => outcomes.push(outcome),
                    Some(Err(e)) => {
                        error!("分片任务异常退出: {}", e);
                        outcomes.push((
                            0,
                            Err(UploadError::PartUploadFailed {
                                part_number: 0,
                                message: format!("分片任务异常: {}", e),
                            }),
                        ));
                    }
                    None => break,
                },
                _ = ticker.tick() => self.publish_progress(progress).await,
            }
        }
        outcomes
    }

    /// 处理一批的结果：记录成功分片，返回应上报的错误
    async fn settle_wave(&self, outcomes: Vec<PartOutcome>) -> Result<(), UploadError> {
        let mut first_failure: Option<(u32, UploadError)> = None;
        let mut canceled = false;

        {
            let mut session = self.session.lock().await;
            for (part_number, result) in outcomes {
                match result {
                    Ok(part) => session.record_part(part),
                    Err(UploadError::Canceled) => canceled = true,
                    Err(e) => {
                        warn!("[分片#{}] 失败: {}", part_number, e);
                        let lower = first_failure
                            .as_ref()
                            .map_or(true, |(n, _)| part_number < *n);
                        if lower {
                            first_failure = Some((part_number, e));
                        }
                    }
                }
            }
        }

        if self.cancel_token.is_cancelled() || (canceled && first_failure.is_none()) {
            return Err(UploadError::Canceled);
        }
        match first_failure {
            Some((_, e)) => Err(e),
            None => Ok(()),
        }
    }

    async fn publish_progress(&self, progress: &ProgressAggregator) {
        let sample = progress.sample();
        let (percent, speed) = {
            let mut session = self.session.lock().await;
            if !session.update_progress(sample.progress_percent, sample.bytes_per_second) {
                return;
            }
            (session.progress, session.speed)
        };
        self.notifier.progress(percent, speed);
    }

    async fn finish_with_success(&self, progress: &ProgressAggregator) {
        let speed = progress.sample().bytes_per_second;
        let (name, path) = {
            let mut session = self.session.lock().await;
            session.speed = speed;
            let old = session.mark_completed();
            if let Some(old) = old {
                self.notifier.status_changed(old, UploadSessionStatus::Completed);
            }
            (session.name.clone(), session.local_path.clone())
        };

        self.notifier.progress(100, speed);
        self.notifier.success(&name, path);
        info!("上传完成: {}", name);
    }

    async fn finish_with_error(&self, err: &UploadError) {
        let (name, upload_id) = {
            let mut session = self.session.lock().await;
            let old = if err.is_canceled() {
                session.mark_canceled()
            } else {
                session.mark_failed(err.to_string())
            };
            if let Some(old) = old {
                self.notifier.status_changed(old, session.status);
            }
            (session.name.clone(), session.upload_session_id.clone())
        };

        if err.is_canceled() {
            info!("上传已取消: {}", name);
        } else {
            error!("上传失败: {}, 错误: {}", name, err);
        }
        self.notifier.error(&name, err);

        if !self.options.abort_on_failure || self.committed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(upload_id) = upload_id {
            if let Err(e) = self.api.abort_session(&name, &upload_id).await {
                warn!(
                    "放弃远端分片会话失败（忽略）: key={}, upload_id={}, 错误: {}",
                    name,
                    upload_id,
                    describe(&e)
                );
            }
        }
    }

    /// 执行一次状态迁移并发布 StatusChanged
    async fn transition<F>(&self, apply: F)
    where
        F: FnOnce(&mut UploadSession) -> Option<UploadSessionStatus>,
    {
        let mut session = self.session.lock().await;
        if let Some(old) = apply(&mut *session) {
            debug!("会话 {} 状态: {} -> {}", session.id, old, session.status);
            self.notifier.status_changed(old, session.status);
        }
    }

    fn ensure_active(&self) -> Result<(), UploadError> {
        if self.cancel_token.is_cancelled() {
            Err(UploadError::Canceled)
        } else {
            Ok(())
        }
    }

    /// 等待 fut，期间被取消则立即返回 Canceled
    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, UploadError> {
        tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => Err(UploadError::Canceled),
            output = fut => Ok(output),
        }
    }
}
