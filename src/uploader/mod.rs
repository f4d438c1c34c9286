// 上传引擎模块
//
// - 分片规划与按批次并发上传
// - 并发策略协商
// - 进度聚合与事件通知
// - 会话生命周期与取消

pub mod chunk;
pub mod engine;
pub mod error;
pub mod events;
pub mod manager;
pub mod policy;
pub mod progress;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use chunk::{plan_parts, PartPlan, UploadPart};
pub use engine::{EngineOptions, UploadEngine};
pub use error::{UploadError, UploadErrorKind};
pub use events::{UploadEvent, UploadNotifier};
pub use manager::{UploadFailureRecord, UploadHandle, UploadManager, UploadSessionInfo};
pub use policy::{ConcurrencyAdvisor, ConcurrencyPolicy};
pub use progress::{ProgressAggregator, ProgressSample};
pub use session::{file_key_for, UploadSession, UploadSessionStatus};
pub use transport::{PartTransport, SourceFile};
