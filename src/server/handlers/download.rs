use crate::downloader::{ChecksumSpec, DownloadTask, JobId, ManagerError, NewDownload};
use crate::server::AppState;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

use super::ApiResponse;

type ApiReply<T> = (StatusCode, Json<ApiResponse<T>>);

fn ok<T>(data: T) -> ApiReply<T> {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

fn fail<T>(status: StatusCode, message: String) -> ApiReply<T> {
    (
        status,
        Json(ApiResponse::error(status.as_u16() as i32, message)),
    )
}

fn manager_error<T>(e: ManagerError) -> ApiReply<T> {
    let status = match &e {
        ManagerError::NotFound(_) => StatusCode::NOT_FOUND,
        ManagerError::AlreadyFinished(_) => StatusCode::CONFLICT,
        ManagerError::Invalid(_) => StatusCode::BAD_REQUEST,
    };
    fail(status, e.to_string())
}

/// 校验值
#[derive(Debug, Deserialize)]
pub struct ChecksumRequest {
    pub algorithm: String,
    pub digest: String,
}

/// 创建下载任务请求
#[derive(Debug, Deserialize)]
pub struct CreateDownloadRequest {
    pub url: String,
    /// 目标路径（文件或目录），相对路径基于下载目录
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub checksum: Option<ChecksumRequest>,
}

/// 创建任务响应（只表示已入队）
#[derive(Debug, Serialize)]
pub struct CreateDownloadResponse {
    pub id: JobId,
}

/// POST /download
/// 创建下载任务
pub async fn create_download(
    State(app_state): State<AppState>,
    payload: Result<Json<CreateDownloadRequest>, JsonRejection>,
) -> ApiReply<CreateDownloadResponse> {
    let Json(req) = match payload {
        Ok(req) => req,
        Err(rejection) => {
            warn!("无效的下载请求: {}", rejection.body_text());
            return fail(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    if req.concurrency == Some(0) {
        return fail(StatusCode::BAD_REQUEST, "concurrency 必须大于 0".to_string());
    }

    let checksum = match req.checksum {
        Some(c) => match ChecksumSpec::parse(&c.algorithm, &c.digest) {
            Ok(spec) => Some(spec),
            Err(e) => return fail(StatusCode::BAD_REQUEST, e.to_string()),
        },
        None => None,
    };

    let request = NewDownload {
        url: req.url,
        path: req.path,
        concurrency: req.concurrency,
        checksum,
    };

    match app_state.download_manager.submit(request).await {
        Ok(id) => {
            info!("创建下载任务成功: {}", id);
            ok(CreateDownloadResponse { id })
        }
        Err(e) => {
            warn!("创建下载任务失败: {}", e);
            manager_error(e)
        }
    }
}

/// GET /downloads
/// 获取所有下载任务
pub async fn get_all_downloads(State(app_state): State<AppState>) -> ApiReply<Vec<DownloadTask>> {
    ok(app_state.download_manager.get_all_tasks().await)
}

/// GET /downloads/:id
/// 获取指定下载任务
pub async fn get_download(
    State(app_state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiReply<DownloadTask> {
    match app_state.download_manager.get_task(id).await {
        Some(task) => ok(task),
        None => manager_error(ManagerError::NotFound(id)),
    }
}

/// POST /downloads/:id/pause
/// 暂停下载任务
pub async fn pause_download(
    State(app_state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiReply<()> {
    match app_state.download_manager.pause(id).await {
        Ok(()) => ok(()),
        Err(e) => manager_error(e),
    }
}

/// POST /downloads/:id/resume
/// 恢复下载任务
pub async fn resume_download(
    State(app_state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiReply<()> {
    match app_state.download_manager.resume(id).await {
        Ok(()) => ok(()),
        Err(e) => manager_error(e),
    }
}

/// DELETE /downloads/:id
/// 取消下载任务（已下载的文件保留）
pub async fn delete_download(
    State(app_state): State<AppState>,
    Path(id): Path<JobId>,
) -> ApiReply<()> {
    match app_state.download_manager.cancel(id).await {
        Ok(()) => ok(()),
        Err(e) => manager_error(e),
    }
}

/// DELETE /downloads/clear/completed
/// 清除已完成的任务记录
pub async fn clear_completed(State(app_state): State<AppState>) -> ApiReply<usize> {
    ok(app_state.download_manager.clear_completed().await)
}

/// DELETE /downloads/clear/failed
/// 清除失败和已取消的任务记录
pub async fn clear_failed(State(app_state): State<AppState>) -> ApiReply<usize> {
    ok(app_state.download_manager.clear_failed().await)
}
