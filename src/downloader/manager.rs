use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::checksum::ChecksumSpec;
use super::engine::DownloadCoordinator;
use super::error::DownloadError;
use super::job::{DownloadJob, JobId, DEFAULT_CONCURRENCY};
use super::reporter::ReporterConfig;
use super::runner::run_job;
use super::task::{DownloadTask, TaskStatus};
use super::worker::PauseGate;
use crate::events::{EventBus, DEFAULT_EVENT_BUFFER};

/// 默认最大同时下载任务数
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 3;

/// 管理器操作错误
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("任务不存在: {0}")]
    NotFound(JobId),

    #[error("任务 {0} 已结束")]
    AlreadyFinished(JobId),

    #[error(transparent)]
    Invalid(#[from] DownloadError),
}

/// 下载管理器配置
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// 相对路径和未指定路径的任务保存到这里
    pub download_dir: PathBuf,
    /// 请求未指定并发数时使用
    pub default_concurrency: usize,
    /// 最大同时下载任务数，其余任务排队
    pub max_concurrent_jobs: usize,
    /// 每个任务的事件缓冲区大小
    pub event_buffer: usize,
    pub reporter: ReporterConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("."),
            default_concurrency: DEFAULT_CONCURRENCY,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            event_buffer: DEFAULT_EVENT_BUFFER,
            reporter: ReporterConfig::default(),
        }
    }
}

/// 新建下载请求
#[derive(Debug, Clone)]
pub struct NewDownload {
    pub url: String,
    /// 目标路径（文件或目录），None 时保存到下载目录
    pub path: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub checksum: Option<ChecksumSpec>,
}

/// 运行中任务的控制句柄
#[derive(Debug, Clone)]
struct JobControl {
    cancel: CancellationToken,
    pause: PauseGate,
}

/// 下载管理器
///
/// 接收任务后立即返回任务 ID，任务按提交顺序排队，
/// 同时最多运行 `max_concurrent_jobs` 个
#[derive(Debug)]
pub struct DownloadManager {
    /// 所有任务
    tasks: Arc<RwLock<HashMap<JobId, Arc<Mutex<DownloadTask>>>>>,
    /// 未结束任务的控制句柄
    controls: Arc<RwLock<HashMap<JobId, JobControl>>>,
    next_id: AtomicU64,
    coordinator: Arc<DownloadCoordinator>,
    /// 任务槽位（FIFO）
    slots: Arc<Semaphore>,
    bus: EventBus,
    config: ManagerConfig,
    /// 关闭时取消所有任务
    shutdown: CancellationToken,
}

impl DownloadManager {
    /// 创建新的下载管理器
    pub fn new(coordinator: DownloadCoordinator, config: ManagerConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        if !config.download_dir.exists() {
            std::fs::create_dir_all(&config.download_dir).context("创建下载目录失败")?;
            info!("✓ 下载目录已创建: {:?}", config.download_dir);
        }

        let max_jobs = config.max_concurrent_jobs.max(1);
        info!(
            "创建下载管理器: 下载目录={:?}, 最大同时下载数={}, 默认并发={}",
            config.download_dir, max_jobs, config.default_concurrency
        );

        Ok(Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            controls: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            coordinator: Arc::new(coordinator),
            slots: Arc::new(Semaphore::new(max_jobs)),
            bus: EventBus::new(config.event_buffer),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// 请求路径相对于下载目录
    fn resolve_path(&self, path: Option<&Path>) -> PathBuf {
        match path {
            None => self.config.download_dir.clone(),
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => self.config.download_dir.join(p),
        }
    }

    /// 提交任务，返回任务 ID（任务只是入队，不代表已完成）
    pub async fn submit(&self, request: NewDownload) -> Result<JobId, ManagerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let destination = self.resolve_path(request.path.as_deref());
        let concurrency = request
            .concurrency
            .unwrap_or(self.config.default_concurrency);
        let job = DownloadJob::new(id, request.url, destination, concurrency, request.checksum)?;

        let task = Arc::new(Mutex::new(DownloadTask::new(&job)));
        let control = JobControl {
            cancel: self.shutdown.child_token(),
            pause: PauseGate::new(),
        };

        self.tasks.write().await.insert(id, task.clone());
        self.controls.write().await.insert(id, control.clone());

        info!(
            "任务 #{} 已加入队列: {} -> {:?} (并发 {})",
            id, job.url, job.destination, job.concurrency
        );

        tokio::spawn(Self::run_queued(
            job,
            task,
            control,
            self.coordinator.clone(),
            self.slots.clone(),
            self.bus,
            self.config.reporter,
            self.controls.clone(),
        ));

        Ok(id)
    }

    /// 等待槽位后执行任务，并用事件流更新任务记录
    #[allow(clippy::too_many_arguments)]
    async fn run_queued(
        job: DownloadJob,
        task: Arc<Mutex<DownloadTask>>,
        control: JobControl,
        coordinator: Arc<DownloadCoordinator>,
        slots: Arc<Semaphore>,
        bus: EventBus,
        reporter: ReporterConfig,
        controls: Arc<RwLock<HashMap<JobId, JobControl>>>,
    ) {
        let id = job.id;

        let Some(permit) = Self::acquire_slot(id, &control, &slots).await else {
            info!("任务 #{} 在排队时被取消", id);
            task.lock().await.mark_cancelled();
            controls.write().await.remove(&id);
            return;
        };

        debug!("任务 #{} 获得下载槽位", id);

        let (sink, mut rx) = bus.open(id);
        let consumer = {
            let task = task.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    task.lock().await.apply(&event);
                }
            })
        };

        let result = run_job(
            &coordinator,
            job,
            sink,
            reporter,
            control.cancel.clone(),
            control.pause.clone(),
        )
        .await;
        drop(permit);

        if let Err(e) = consumer.await {
            warn!("任务 #{} 事件消费者异常退出: {}", id, e);
        }
        controls.write().await.remove(&id);

        match result {
            Ok(path) => info!("任务 #{} 完成: {:?}", id, path),
            Err(e) if e.is_cancelled() => info!("任务 #{} 已取消", id),
            Err(e) => error!("任务 #{} 失败: {}", id, e),
        }
    }

    /// 等待下载槽位；排队期间被暂停的任务让出槽位，恢复后重新排到队尾
    ///
    /// 被取消时返回 None
    async fn acquire_slot(
        id: JobId,
        control: &JobControl,
        slots: &Arc<Semaphore>,
    ) -> Option<OwnedSemaphorePermit> {
        loop {
            let permit = tokio::select! {
                _ = control.cancel.cancelled() => None,
                permit = slots.clone().acquire_owned() => permit.ok(),
            };
            let permit = permit?;

            if !control.pause.is_paused() {
                return Some(permit);
            }

            drop(permit);
            debug!("任务 #{} 已暂停，让出下载槽位", id);
            control.pause.wait_resumed(&control.cancel).await.ok()?;
        }
    }

    async fn control(&self, id: JobId) -> Result<(Arc<Mutex<DownloadTask>>, JobControl), ManagerError> {
        let task = self
            .tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ManagerError::NotFound(id))?;
        let control = self.controls.read().await.get(&id).cloned();
        match control {
            Some(control) => Ok((task, control)),
            None => Err(ManagerError::AlreadyFinished(id)),
        }
    }

    /// 暂停任务：不再读取数据，连接保持
    pub async fn pause(&self, id: JobId) -> Result<(), ManagerError> {
        let (task, control) = self.control(id).await?;
        let mut task = task.lock().await;
        if task.status.is_finished() {
            return Err(ManagerError::AlreadyFinished(id));
        }
        control.pause.pause();
        task.mark_paused();
        info!("任务 #{} 已暂停", id);
        Ok(())
    }

    /// 恢复任务
    pub async fn resume(&self, id: JobId) -> Result<(), ManagerError> {
        let (task, control) = self.control(id).await?;
        let mut task = task.lock().await;
        if task.status.is_finished() {
            return Err(ManagerError::AlreadyFinished(id));
        }
        control.pause.resume();
        task.mark_resumed();
        info!("任务 #{} 已恢复", id);
        Ok(())
    }

    /// 取消任务（已下载的部分文件保留）
    pub async fn cancel(&self, id: JobId) -> Result<(), ManagerError> {
        let (_, control) = self.control(id).await?;
        control.cancel.cancel();
        info!("任务 #{} 已触发取消令牌", id);
        Ok(())
    }

    pub async fn get_task(&self, id: JobId) -> Option<DownloadTask> {
        let task = self.tasks.read().await.get(&id).cloned()?;
        let task = task.lock().await.clone();
        Some(task)
    }

    /// 所有任务，按 ID 排序
    pub async fn get_all_tasks(&self) -> Vec<DownloadTask> {
        let tasks: Vec<_> = self.tasks.read().await.values().cloned().collect();
        let mut result = Vec::with_capacity(tasks.len());
        for task in tasks {
            result.push(task.lock().await.clone());
        }
        result.sort_by_key(|t| t.id);
        result
    }

    /// 正在下载的任务数
    pub async fn active_count(&self) -> usize {
        let tasks = self.get_all_tasks().await;
        tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Downloading | TaskStatus::Paused))
            .filter(|t| t.started_at.is_some())
            .count()
    }

    /// 清除已完成的任务记录，返回清除数量
    pub async fn clear_completed(&self) -> usize {
        self.clear_where(|status| status == TaskStatus::Completed)
            .await
    }

    /// 清除失败和已取消的任务记录（文件保留），返回清除数量
    pub async fn clear_failed(&self) -> usize {
        self.clear_where(|status| matches!(status, TaskStatus::Failed | TaskStatus::Cancelled))
            .await
    }

    async fn clear_where(&self, pred: impl Fn(TaskStatus) -> bool) -> usize {
        let mut tasks = self.tasks.write().await;
        let mut to_remove = Vec::new();

        for (id, task) in tasks.iter() {
            if pred(task.lock().await.status) {
                to_remove.push(*id);
            }
        }

        for id in &to_remove {
            tasks.remove(id);
        }

        info!("清除了 {} 个任务记录", to_remove.len());
        to_remove.len()
    }

    /// 取消所有任务
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        info!("下载管理器已关闭，所有任务已取消");
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::engine::EngineConfig;
    use tempfile::TempDir;

    fn manager(dir: &Path) -> DownloadManager {
        let coordinator = DownloadCoordinator::new(EngineConfig::default()).unwrap();
        let config = ManagerConfig {
            download_dir: dir.join("downloads"),
            ..Default::default()
        };
        DownloadManager::new(coordinator, config).unwrap()
    }

    #[tokio::test]
    async fn test_manager_creation() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(temp_dir.path());

        assert!(temp_dir.path().join("downloads").is_dir());
        assert_eq!(manager.get_all_tasks().await.len(), 0);
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_url() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(temp_dir.path());

        let result = manager
            .submit(NewDownload {
                url: "not a url".to_string(),
                path: None,
                concurrency: None,
                checksum: None,
            })
            .await;
        assert!(matches!(
            result,
            Err(ManagerError::Invalid(DownloadError::InvalidUrl(_)))
        ));
        assert!(manager.get_all_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(temp_dir.path());

        assert!(matches!(manager.pause(42).await, Err(ManagerError::NotFound(42))));
        assert!(matches!(manager.cancel(42).await, Err(ManagerError::NotFound(42))));
        assert!(manager.get_task(42).await.is_none());
    }

    #[test]
    fn test_resolve_path() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(temp_dir.path());
        let base = temp_dir.path().join("downloads");

        assert_eq!(manager.resolve_path(None), base);
        assert_eq!(
            manager.resolve_path(Some(Path::new("a/b.bin"))),
            base.join("a/b.bin")
        );
        let absolute = temp_dir.path().join("abs.bin");
        assert_eq!(manager.resolve_path(Some(&absolute)), absolute);
    }
}
