//! 单个任务的完整运行流程
//!
//! Started 事件 -> 启动进度报告器 -> 协调器下载 -> 终止事件

use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::engine::DownloadCoordinator;
use super::error::DownloadError;
use super::job::DownloadJob;
use super::progress::ProgressState;
use super::reporter::{ProgressReporter, ReporterConfig};
use super::worker::PauseGate;
use crate::events::{DownloadEvent, JobEventSink};

/// 运行一个下载任务，事件写入 `sink`
///
/// 成功时由报告器发出 Complete；失败时直接发出 Error，
/// 不必等到下一次轮询。返回前事件通道一定已经关闭
pub async fn run_job(
    coordinator: &DownloadCoordinator,
    job: DownloadJob,
    sink: JobEventSink,
    reporter_config: ReporterConfig,
    cancel: CancellationToken,
    pause: PauseGate,
) -> Result<PathBuf, DownloadError> {
    let state = Arc::new(ProgressState::new(job.id));
    sink.send(DownloadEvent::Started { job_id: job.id }).await;

    let reporter = ProgressReporter::new(state.clone(), reporter_config);
    let reporter_handle = tokio::spawn(reporter.run(sink.clone()));

    let result = coordinator.run(&job, state, cancel, pause).await;

    if let Err(error) = &result {
        sink.send_terminal(DownloadEvent::Error {
            job_id: job.id,
            error: error.clone(),
        })
        .await;
    }

    if let Err(e) = reporter_handle.await {
        warn!("任务 #{} 进度报告器异常退出: {}", job.id, e);
        // 报告器没能发出终止事件时由这里补发
        if let Ok(path) = &result {
            sink.send_terminal(DownloadEvent::Complete {
                job_id: job.id,
                elapsed: std::time::Duration::ZERO,
                total_bytes: tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0),
            })
            .await;
        }
    }

    result
}
