//! 下载事件类型定义
//!
//! 每个任务一条有序事件流：Started -> Progress* -> (Complete | Error)

use serde::{Serialize, Serializer};
use std::time::Duration;

use crate::downloader::error::DownloadError;
use crate::downloader::job::JobId;

/// 下载任务事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// 任务开始
    Started { job_id: JobId },
    /// 进度更新
    Progress {
        job_id: JobId,
        downloaded_bytes: u64,
        /// 流式下载结束前为 None
        total_bytes: Option<u64>,
        /// 平滑后的速度 (bytes/s)
        speed: f64,
        active_connections: u32,
    },
    /// 任务完成
    Complete {
        job_id: JobId,
        #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
        elapsed: Duration,
        total_bytes: u64,
    },
    /// 任务失败（包括用户取消）
    Error {
        job_id: JobId,
        #[serde(serialize_with = "serialize_display")]
        error: DownloadError,
    },
}

impl DownloadEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            DownloadEvent::Started { job_id }
            | DownloadEvent::Progress { job_id, .. }
            | DownloadEvent::Complete { job_id, .. }
            | DownloadEvent::Error { job_id, .. } => *job_id,
        }
    }

    /// 是否为终止事件（之后事件流关闭）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadEvent::Complete { .. } | DownloadEvent::Error { .. }
        )
    }
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

fn serialize_display<S: Serializer>(e: &DownloadError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(e)
}
