use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use taskhub_domain::{Task, TaskDescriptor, TaskFilter, TaskId, TaskPriority, TaskStatus};

use crate::error::{ApiError, ApiResult};
use crate::extract::Caller;
use crate::response::{created, success, ApiResponse, TaskView};
use crate::routes::AppState;

/// 单次列表查询的最大条数
const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub task_type: String,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TaskQueryParams {
    pub status: Option<String>,
    pub task_type: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

fn parse_id(id: &str) -> ApiResult<TaskId> {
    id.parse::<TaskId>().map_err(ApiError::from)
}

/// 读取任务并确认属于调用方所在公司；其他公司的任务按不存在处理
async fn load_owned(state: &AppState, caller: &Caller, id: &str) -> ApiResult<Task> {
    let task = state.hub.get(parse_id(id)?).await?;
    if !caller.principal.belongs_to(&task.tenant) {
        return Err(ApiError::NotFound);
    }
    Ok(task)
}

pub async fn submit_task(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<SubmitTaskRequest>,
) -> ApiResult<impl IntoResponse> {
    let mut descriptor = TaskDescriptor::new(request.task_type, caller.tenant, caller.principal);
    descriptor.priority = request.priority;
    if let Some(input) = request.input {
        descriptor.input = input;
    }
    descriptor.max_attempts = request.max_attempts;
    descriptor.scheduled_for = request.scheduled_for;
    descriptor.idempotency_key = request.idempotency_key;

    let task = state.hub.submit(descriptor).await?;
    Ok(created(TaskView::from(task)))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<TaskQueryParams>,
) -> ApiResult<impl IntoResponse> {
    let status = params
        .status
        .as_deref()
        .map(|s| TaskStatus::parse(s).ok_or_else(|| ApiError::BadRequest(format!("未知的任务状态: {s}"))))
        .transpose()?;

    let filter = TaskFilter {
        company: Some(caller.tenant.company.clone()),
        brand: caller.tenant.brand.clone(),
        status,
        task_type: params.task_type,
        limit: Some(params.limit.unwrap_or(100).min(MAX_PAGE_SIZE)),
        offset: params.offset,
        ..TaskFilter::default()
    };
    let tasks: Vec<TaskView> = state
        .hub
        .list(&filter)
        .await?
        .into_iter()
        .map(TaskView::from)
        .collect();
    Ok(success(tasks))
}

pub async fn get_task(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = load_owned(&state, &caller, &id).await?;
    Ok(success(TaskView::from(task)))
}

pub async fn get_task_events(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = load_owned(&state, &caller, &id).await?;
    Ok(success(state.hub.events(task.id).await?))
}

/// `pending` 直接取消；`processing` 只设置取消标志，由处理器在检查点响应
pub async fn cancel_task(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = load_owned(&state, &caller, &id).await?;
    let task = state.hub.cancel(task.id, &caller.principal).await?;
    let message = if task.status == TaskStatus::Cancelled {
        "任务已取消"
    } else {
        "已请求取消，等待处理器响应"
    };
    Ok(ApiResponse::success_with_message(TaskView::from(task), message))
}

pub async fn reset_task(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = load_owned(&state, &caller, &id).await?;
    let reset = state.hub.reset(task.id, &caller.principal).await?;
    Ok(created(TaskView::from(reset)))
}
