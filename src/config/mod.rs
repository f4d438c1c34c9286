// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 访问令牌环境变量（优先于配置文件）
pub const ACCESS_TOKEN_ENV: &str = "STORAGE_ACCESS_TOKEN";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 存储 API 配置
    #[serde(default)]
    pub api: ApiConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 存储 API 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API 根地址
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// 访问令牌（可由环境变量覆盖）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// 分片 PUT 是否携带访问令牌
    #[serde(default)]
    pub auth_part_uploads: bool,
}

fn default_base_url() -> String {
    "https://app.scientist.com/api/v2".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            access_token: None,
            auth_part_uploads: false,
        }
    }
}

impl ApiConfig {
    /// 解析访问令牌：环境变量优先，其次配置文件
    pub fn resolve_access_token(&self) -> Option<String> {
        std::env::var(ACCESS_TOKEN_ENV)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.access_token.clone())
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 单分片限速上限 (bytes/s)，0 表示不限速
    #[serde(default = "default_max_upload_speed_bps")]
    pub max_upload_speed_bps: u64,
    /// 进度事件发布间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 失败或取消后是否通知远端放弃分片会话
    #[serde(default = "default_abort_on_failure")]
    pub abort_on_failure: bool,
    /// 分片 PUT 的流式切片大小（字节）
    #[serde(default = "default_stream_slice_size")]
    pub stream_slice_size: usize,
}

fn default_max_upload_speed_bps() -> u64 {
    50 * 1000 * 1000 // 50MB/s
}

fn default_progress_interval_ms() -> u64 {
    200
}

fn default_abort_on_failure() -> bool {
    true
}

fn default_stream_slice_size() -> usize {
    64 * 1024
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_speed_bps: default_max_upload_speed_bps(),
            progress_interval_ms: default_progress_interval_ms(),
            abort_on_failure: default_abort_on_failure(),
            stream_slice_size: default_stream_slice_size(),
        }
    }
}

impl UploadConfig {
    /// 限速上限，0 视为不限速
    pub fn rate_limit(&self) -> Option<u64> {
        (self.max_upload_speed_bps > 0).then_some(self.max_upload_speed_bps)
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {:?}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {:?}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 首次启动：写出默认配置，方便用户修改
                if !path.exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        let url = self.api.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            anyhow::bail!("api.base_url 必须以 http:// 或 https:// 开头: {}", url);
        }
        if self.api.timeout_secs == 0 {
            anyhow::bail!("api.timeout_secs 必须大于 0");
        }
        if self.upload.progress_interval_ms == 0 {
            anyhow::bail!("upload.progress_interval_ms 必须大于 0");
        }
        if self.upload.stream_slice_size == 0 {
            anyhow::bail!("upload.stream_slice_size 必须大于 0");
        }
        Ok(())
    }
}
