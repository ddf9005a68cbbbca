use axum::{
    extract::{Path, State},
    response::IntoResponse,
};

use taskhub_errors::HubError;

use crate::error::{ApiError, ApiResult};
use crate::extract::Caller;
use crate::response::success;
use crate::routes::AppState;

/// Worker是全局资源，只对管理员开放
fn require_admin(caller: &Caller) -> ApiResult<()> {
    if caller.principal.is_admin() {
        Ok(())
    } else {
        Err(HubError::unauthorized("只有管理员可以查看Worker").into())
    }
}

pub async fn list_workers(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<impl IntoResponse> {
    require_admin(&caller)?;
    let workers = state.hub.repositories().workers.list().await?;
    Ok(success(workers))
}

pub async fn get_worker(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    require_admin(&caller)?;
    let worker = state
        .hub
        .repositories()
        .workers
        .get(&id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(success(worker))
}
