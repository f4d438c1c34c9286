use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage_uploader::{
    config::{AppConfig, LogConfig, ACCESS_TOKEN_ENV, DEFAULT_CONFIG_PATH},
    logging, StorageClient, UploadError, UploadEvent, UploadHandle, UploadManager,
};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// 分片上传客户端
#[derive(Parser, Debug)]
#[command(name = "storage-uploader")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 并发上传一个或多个文件（Ctrl+C 取消全部）
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// 列出远端存储对象
    List,
    /// 删除远端存储对象
    Delete { id: String },
}

/// 日志系统初始化前只读取 [log] 段，失败时使用默认配置
async fn load_log_config(path: &Path) -> LogConfig {
    let Ok(content) = tokio::fs::read_to_string(path).await else {
        return LogConfig::default();
    };
    toml::from_str::<toml::Value>(&content)
        .ok()
        .and_then(|value| value.get("log").cloned())
        .and_then(|table| table.try_into::<LogConfig>().ok())
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_config = load_log_config(&args.config).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("storage-uploader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(&args.config).await;
    let access_token = config.api.resolve_access_token().with_context(|| {
        format!(
            "未配置访问令牌：请设置环境变量 {} 或配置 api.access_token",
            ACCESS_TOKEN_ENV
        )
    })?;
    let client = StorageClient::new(&config.api, access_token)?
        .with_stream_slice_size(config.upload.stream_slice_size);

    match args.command {
        Command::Upload { files } => {
            let manager = UploadManager::new(Arc::new(client), &config.upload);
            run_upload(manager, files).await
        }
        Command::List => run_list(&client).await,
        Command::Delete { id } => run_delete(&client, &id).await,
    }
}

async fn run_upload(manager: UploadManager, files: Vec<PathBuf>) -> Result<()> {
    let mut watchers = JoinSet::new();
    let mut failed = 0usize;

    for path in files {
        match manager.start_upload(&path).await {
            Ok(handle) => {
                watchers.spawn(watch_session(path, handle));
            }
            Err(e) => {
                eprintln!("✗ 无法开始上传 {:?}: {}", path, e);
                failed += 1;
            }
        }
    }

    let mut succeeded = 0usize;
    let mut canceled = 0usize;
    let mut interrupted = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            joined = watchers.join_next() => match joined {
                Some(Ok(Ok(()))) => succeeded += 1,
                Some(Ok(Err(e))) if e.is_canceled() => canceled += 1,
                Some(Ok(Err(_))) => failed += 1,
                Some(Err(e)) => {
                    error!("上传监视任务异常: {}", e);
                    failed += 1;
                }
                None => break,
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                info!("收到 Ctrl+C，取消所有上传...");
                manager.cancel_all();
            }
        }
    }

    info!(
        "上传结束: 成功 {}, 失败 {}, 取消 {}",
        succeeded, failed, canceled
    );
    for record in manager.recent_errors() {
        debug!("失败记录: {:?}", record);
    }

    if failed > 0 {
        anyhow::bail!("{} 个文件上传失败", failed);
    }
    Ok(())
}

/// 消费单个会话的事件直到通道关闭，返回会话结果
async fn watch_session(path: PathBuf, mut handle: UploadHandle) -> Result<(), UploadError> {
    let mut last_percent = None;
    while let Some(event) = handle.events.recv().await {
        match event {
            UploadEvent::Progress {
                progress_percent,
                bytes_per_second,
                ..
            } => {
                if last_percent != Some(progress_percent) {
                    last_percent = Some(progress_percent);
                    info!(
                        "[{}] {:>3}%  {}/s",
                        path.display(),
                        progress_percent,
                        format_size(bytes_per_second)
                    );
                }
            }
            UploadEvent::StatusChanged {
                old_status,
                new_status,
                ..
            } => debug!("[{}] {} -> {}", path.display(), old_status, new_status),
            UploadEvent::Success { name, .. } => println!("✓ 上传成功: {}", name),
            UploadEvent::Error {
                file_name,
                message,
                canceled,
                ..
            } => {
                if canceled {
                    println!("⊘ 已取消: {}", file_name);
                } else {
                    eprintln!("✗ 上传失败: {} - {}", file_name, message);
                }
            }
        }
    }

    match handle.task.await {
        Ok(result) => result,
        Err(e) => Err(UploadError::CompletionFailed(format!("上传任务异常: {}", e))),
    }
}

async fn run_list(client: &StorageClient) -> Result<()> {
    let objects = client.list_objects().await?;
    if objects.is_empty() {
        println!("（没有存储对象）");
        return Ok(());
    }
    for object in objects {
        let size = object.size.map(format_size).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:>10}  {}  {}",
            object.id,
            size,
            object.created_at.as_deref().unwrap_or("-"),
            object.display_name()
        );
    }
    Ok(())
}

async fn run_delete(client: &StorageClient, id: &str) -> Result<()> {
    let result = client.delete_object(id).await;
    if !result.success {
        anyhow::bail!(
            "删除失败: id={}, {}",
            id,
            result.error.as_deref().unwrap_or("Unknown error")
        );
    }
    println!(
        "✓ 已删除: {} ({})",
        result.file_name.as_deref().unwrap_or("Unknown File"),
        id
    );
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
