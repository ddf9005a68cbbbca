//! # TaskHub API
//!
//! 任务编排核心之上的HTTP接口。认证由上游网关完成，调用方身份通过请求头传入：
//!
//! - `X-Tenant-Company`（必填）、`X-Tenant-Brand`（可选）
//! - `X-Principal`（必填）、`X-Roles`（逗号分隔）
//!
//! ## 端点
//!
//! - `POST /api/tasks` 提交任务
//! - `GET /api/tasks` 按状态、类型列出本公司任务
//! - `GET /api/tasks/{id}`、`GET /api/tasks/{id}/events`
//! - `POST /api/tasks/{id}/cancel` 取消
//! - `POST /api/tasks/{id}/reset` 管理员重置终态任务
//! - `GET /api/workers`、`GET /api/workers/{id}` 管理员查看Worker
//! - `GET /health`

pub mod error;
pub mod extract;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tracing::info;

use middleware::{cors_layer, request_logging, request_timeout, trace_layer};
use routes::{create_routes, AppState};
use taskhub_core::ApiConfig;
use taskhub_dispatcher::TaskHub;

pub use error::{ApiError, ApiResult};
pub use extract::Caller;

/// 创建完整的API应用
pub fn create_app(hub: Arc<TaskHub>, config: &ApiConfig) -> Router {
    let timeout = Duration::from_secs(config.request_timeout_seconds);
    create_routes(AppState { hub }).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(cors_layer())
            .layer(axum::middleware::from_fn(request_logging))
            .layer(axum::middleware::from_fn_with_state(timeout, request_timeout)),
    )
}

/// 监听配置地址直到收到关闭信号
pub async fn serve(
    hub: Arc<TaskHub>,
    config: &ApiConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("绑定API地址失败: {}", config.bind_address))?;
    info!(bind = %config.bind_address, "API服务已启动");

    axum::serve(listener, create_app(hub, config))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        })
        .await
        .context("API服务异常退出")?;
    info!("API服务已停止");
    Ok(())
}
