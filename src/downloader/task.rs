use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::job::{DownloadJob, JobId};
use crate::events::DownloadEvent;

/// 下载任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 排队中
    Pending,
    /// 下载中
    Downloading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl TaskStatus {
    /// 是否已结束（不会再变化）
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// 下载任务记录（服务端展示用）
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    /// 任务ID
    pub id: JobId,
    /// 源地址
    pub url: String,
    /// 请求的目标路径
    pub destination: PathBuf,
    /// 并发连接数
    pub concurrency: usize,
    /// 文件大小（未知为 None）
    pub total_size: Option<u64>,
    /// 已下载大小
    pub downloaded_size: u64,
    /// 任务状态
    pub status: TaskStatus,
    /// 下载速度 (bytes/s)
    pub speed: f64,
    /// 活跃连接数
    pub active_connections: u32,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 耗时（毫秒）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
    /// 错误信息
    pub error: Option<String>,
}

impl DownloadTask {
    pub fn new(job: &DownloadJob) -> Self {
        Self {
            id: job.id,
            url: job.url.clone(),
            destination: job.destination.clone(),
            concurrency: job.concurrency,
            total_size: None,
            downloaded_size: 0,
            status: TaskStatus::Pending,
            speed: 0.0,
            active_connections: 0,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            elapsed_ms: None,
            error: None,
        }
    }

    /// 计算进度百分比
    pub fn progress(&self) -> f64 {
        match self.total_size {
            Some(total) if total > 0 => (self.downloaded_size as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }

    /// 估算剩余时间 (秒)
    pub fn eta(&self) -> Option<u64> {
        let total = self.total_size?;
        if self.speed < 1.0 || self.downloaded_size >= total {
            return None;
        }
        let remaining = total - self.downloaded_size;
        Some((remaining as f64 / self.speed) as u64)
    }

    /// 根据事件更新记录
    pub fn apply(&mut self, event: &DownloadEvent) {
        match event {
            DownloadEvent::Started { .. } => self.mark_downloading(),
            DownloadEvent::Progress {
                downloaded_bytes,
                total_bytes,
                speed,
                active_connections,
                ..
            } => {
                self.downloaded_size = *downloaded_bytes;
                self.total_size = *total_bytes;
                self.speed = *speed;
                self.active_connections = *active_connections;
            }
            DownloadEvent::Complete {
                elapsed,
                total_bytes,
                ..
            } => {
                self.total_size = Some(*total_bytes);
                self.elapsed_ms = Some(elapsed.as_millis() as u64);
                self.mark_completed();
            }
            DownloadEvent::Error { error, .. } => {
                if error.is_cancelled() {
                    self.mark_cancelled();
                } else {
                    self.mark_failed(error.to_string());
                }
            }
        }
    }

    /// 标记为下载中
    pub fn mark_downloading(&mut self) {
        if self.status.is_finished() {
            return;
        }
        // 排队期间被暂停的任务开始后仍保持暂停
        if self.status != TaskStatus::Paused {
            self.status = TaskStatus::Downloading;
        }
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        if let Some(total) = self.total_size {
            self.downloaded_size = total;
        }
        self.speed = 0.0;
        self.active_connections = 0;
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.speed = 0.0;
        self.active_connections = 0;
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.speed = 0.0;
        self.active_connections = 0;
    }

    /// 标记为暂停
    pub fn mark_paused(&mut self) {
        if !self.status.is_finished() {
            self.status = TaskStatus::Paused;
        }
    }

    /// 从暂停恢复
    pub fn mark_resumed(&mut self) {
        if self.status != TaskStatus::Paused {
            return;
        }
        self.status = if self.started_at.is_some() {
            TaskStatus::Downloading
        } else {
            TaskStatus::Pending
        };
    }
}
