// Storage Uploader Library
// 分片上传客户端核心库

// 配置管理模块
pub mod config;

// 日志系统
pub mod logging;

// 存储 API 模块
pub mod storage;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use config::AppConfig;
pub use storage::{StorageApi, StorageClient, StorageObject};
pub use uploader::{
    UploadError, UploadErrorKind, UploadEvent, UploadHandle, UploadManager, UploadSession,
    UploadSessionStatus,
};
