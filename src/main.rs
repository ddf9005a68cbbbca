use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use taskhub::app::{AppMode, Application};
use taskhub::shutdown::ShutdownManager;
use taskhub_core::{init_logging, AppConfig};

#[derive(Debug, Parser)]
#[command(name = "taskhub", version, about = "多租户任务编排核心")]
struct Cli {
    /// 配置文件路径，缺省时按默认位置查找
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    #[arg(short, long, default_value = "all", value_parser = ["dispatcher", "worker", "api", "all"])]
    mode: String,

    /// 覆盖配置中的 worker_id
    #[arg(long, value_name = "ID")]
    worker_id: Option<String>,

    #[arg(short, long, value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    #[arg(long, value_parser = ["json", "pretty"])]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("加载配置失败")?;
    if let Some(id) = cli.worker_id {
        config.worker.worker_id = id;
    }
    let log_level = cli
        .log_level
        .unwrap_or_else(|| config.observability.log_level.clone());
    let log_format = cli
        .log_format
        .unwrap_or_else(|| config.observability.log_format.clone());
    init_logging(&log_level, &log_format)?;

    let mode = AppMode::parse(&cli.mode)?;
    info!(?mode, config = ?cli.config, "启动TaskHub");

    let app = Arc::new(Application::new(config, mode).await?);
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!(error = %e, "应用运行失败");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭");
    shutdown_manager.shutdown().await;

    // Worker排空在途任务最多30秒，这里多留余量
    match tokio::time::timeout(Duration::from_secs(45), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!(error = %e, "应用关闭时发生错误"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "安装Ctrl+C信号处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "安装SIGTERM信号处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}
