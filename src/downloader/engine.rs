use reqwest::header::{CONTENT_DISPOSITION, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::checksum;
use super::chunk::{ChunkPlan, PlanPolicy};
use super::error::DownloadError;
use super::filename::resolve_destination;
use super::job::DownloadJob;
use super::progress::ProgressState;
use super::worker::{ConnectionWorker, FetchTarget, PauseGate, RetryPolicy, DEFAULT_BUFFER_SIZE};

/// 默认 User-Agent
pub const DEFAULT_USER_AGENT: &str = concat!("surge/", env!("CARGO_PKG_VERSION"));

/// 下载引擎配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 分片策略
    pub policy: PlanPolicy,
    /// 分片重试策略
    pub retry: RetryPolicy,
    /// 每次写入文件的缓冲区大小
    pub buffer_size: usize,
    /// 单次读取超时（超过该时间未收到任何数据视为连接中断）
    pub read_timeout: Duration,
    /// 建立连接超时
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: PlanPolicy::default(),
            retry: RetryPolicy::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            read_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(15),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// 探测结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// 跟随重定向后的最终地址，分片请求都发往这里
    pub final_url: String,
    /// 资源总大小（未知为 None）
    pub total: Option<u64>,
    /// 服务器是否支持 Range 请求
    pub range_capable: bool,
    /// 服务器给出的 Content-Disposition
    pub disposition: Option<String>,
}

/// 下载协调器
///
/// 负责一个任务的完整流程：探测 -> 分片 -> 准备文件 -> 并发下载 -> 校验 -> 完成
#[derive(Debug, Clone)]
pub struct DownloadCoordinator {
    client: Client,
    config: EngineConfig,
}

impl DownloadCoordinator {
    /// 创建新的下载协调器
    pub fn new(config: EngineConfig) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(64)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(10)) // 最多 10 次重定向
            .build()?;

        Ok(Self { client, config })
    }

    /// 使用已有的 HTTP 客户端
    pub fn with_client(client: Client, config: EngineConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 探测资源大小和 Range 支持情况
    ///
    /// 发送 `Range: bytes=0-0`：
    /// - 206 + Content-Range：支持 Range，总大小取自 Content-Range
    /// - 200：不支持 Range，总大小取自 Content-Length（可能缺失）
    /// - 416：空资源
    pub async fn probe(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<ProbeResult, DownloadError> {
        debug!("🔍 探测资源: {}", url);

        let request = self.client.get(url).header(RANGE, "bytes=0-0").send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            resp = request => resp?,
        };

        let status = response.status();
        let final_url = response.url().to_string();
        let disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_range_total = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);

        let (total, range_capable) = match status {
            StatusCode::PARTIAL_CONTENT => (content_range_total, content_range_total.is_some()),
            StatusCode::RANGE_NOT_SATISFIABLE => (Some(content_range_total.unwrap_or(0)), false),
            s if s.is_success() => (response.content_length(), false),
            s => {
                return Err(DownloadError::Status {
                    status: s.as_u16(),
                    url: final_url,
                })
            }
        };

        debug!(
            "探测完成: 状态码={}, 大小={:?}, 支持Range={}",
            status, total, range_capable
        );

        Ok(ProbeResult {
            final_url,
            total,
            range_capable,
            disposition,
        })
    }

    /// 准备本地文件
    ///
    /// 大小已知时预分配空间（稀疏文件），各分片按偏移量独立写入
    async fn prepare_file(
        &self,
        path: &Path,
        size: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        if cancel.is_cancelled() {
            debug!("准备文件时发现任务已取消: {:?}", path);
            return Err(DownloadError::Cancelled);
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io("创建父目录失败", parent, e))?;
        }

        let file = File::create(path)
            .await
            .map_err(|e| DownloadError::io("创建文件失败", path, e))?;

        if let Some(size) = size {
            file.set_len(size)
                .await
                .map_err(|e| DownloadError::io("预分配文件空间失败", path, e))?;
        }

        info!("文件准备完成: {:?}, 大小: {:?} bytes", path, size);
        Ok(())
    }

    /// 校验文件大小
    async fn verify_file_size(&self, path: &Path, expected: u64) -> Result<(), DownloadError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| DownloadError::io("获取文件元数据失败", path, e))?;

        let actual = metadata.len();
        if actual != expected {
            return Err(DownloadError::SizeMismatch { expected, actual });
        }

        debug!("✅ 文件大小校验通过: {} bytes", actual);
        Ok(())
    }

    /// 执行下载任务
    ///
    /// 失败时错误写入 `state` 的一次性错误槽，返回的是槽里的第一个错误；
    /// 成功时标记完成并返回最终文件路径
    pub async fn run(
        &self,
        job: &DownloadJob,
        state: Arc<ProgressState>,
        cancel: CancellationToken,
        pause: PauseGate,
    ) -> Result<PathBuf, DownloadError> {
        match self.execute(job, &state, &cancel, pause).await {
            Ok(path) => Ok(path),
            Err(err) => {
                state.set_error(err.clone());
                Err(state.get_error().unwrap_or(err))
            }
        }
    }

    async fn execute(
        &self,
        job: &DownloadJob,
        state: &Arc<ProgressState>,
        cancel: &CancellationToken,
        pause: PauseGate,
    ) -> Result<PathBuf, DownloadError> {
        info!("开始下载任务 #{}: {}", job.id, job.url);

        let probe = self.probe(&job.url, cancel).await?;
        let plan = ChunkPlan::build(
            probe.total,
            probe.range_capable,
            job.concurrency,
            &self.config.policy,
        );

        if !probe.range_capable {
            debug!(
                "任务 #{} 服务器不支持 Range 或大小未知，降级为单连接下载",
                job.id
            );
        }

        if let Some(total) = plan.known_total() {
            state.set_total(total);
        }

        let output_path =
            resolve_destination(&job.destination, &probe.final_url, probe.disposition.as_deref());
        self.prepare_file(&output_path, plan.known_total(), cancel)
            .await?;

        let targets: Vec<FetchTarget> = match &plan {
            ChunkPlan::Ranged { chunks, .. } => {
                chunks.iter().cloned().map(FetchTarget::Range).collect()
            }
            ChunkPlan::Whole {
                expected,
                resumable,
            } => vec![FetchTarget::Whole {
                expected: *expected,
                resumable: *resumable,
            }],
        };

        info!(
            "任务 #{} 开始并发下载 {} 个分片 -> {:?}",
            job.id,
            targets.len(),
            output_path
        );

        let written = self
            .download_all(targets, &probe.final_url, &output_path, state, cancel, pause)
            .await?;

        // 流式下载结束后才知道总大小
        state.set_total(written);

        let file = File::open(&output_path)
            .await
            .map_err(|e| DownloadError::io("打开文件失败", &output_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| DownloadError::io("同步文件失败", &output_path, e))?;
        drop(file);

        if let Some(total) = state.total() {
            self.verify_file_size(&output_path, total).await?;
        }

        if let Some(spec) = &job.checksum {
            let report = checksum::verify(&output_path, spec).await?;
            if !report.matched {
                warn!("任务 #{} 校验失败，文件已保留: {:?}", job.id, output_path);
            }
            report.into_result()?;
            info!("✅ 任务 #{} {} 校验通过", job.id, spec.algorithm);
        }

        if state.mark_done() {
            info!(
                "✅ 任务 #{} 下载完成: {:?} ({})",
                job.id,
                output_path,
                format_size(written)
            );
        }

        Ok(output_path)
    }

    /// 启动所有分片并等待结束
    ///
    /// 第一个非取消错误写入错误槽并取消其余分片；返回所有分片写入的字节总数
    async fn download_all(
        &self,
        targets: Vec<FetchTarget>,
        url: &str,
        output_path: &Path,
        state: &Arc<ProgressState>,
        cancel: &CancellationToken,
        pause: PauseGate,
    ) -> Result<u64, DownloadError> {
        let workers_cancel = cancel.child_token();
        let mut set = JoinSet::new();

        for target in targets {
            let worker = ConnectionWorker {
                client: self.client.clone(),
                url: url.to_string(),
                target,
                output_path: output_path.to_path_buf(),
                state: state.clone(),
                cancel: workers_cancel.clone(),
                pause: pause.clone(),
                retry: self.config.retry,
                buffer_size: self.config.buffer_size.max(1),
                read_timeout: self.config.read_timeout,
            };
            set.spawn(worker.fetch());
        }

        let mut written = 0u64;
        while let Some(joined) = set.join_next().await {
            let result = joined.unwrap_or_else(|e| Err(DownloadError::TaskPanicked(e.to_string())));
            match result {
                Ok(n) => written += n,
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    if state.set_error(err.clone()) {
                        error!("任务 #{} 分片失败，取消其余分片: {}", state.id(), err);
                    }
                    workers_cancel.cancel();
                }
            }
        }

        if let Some(err) = state.get_error() {
            return Err(err);
        }
        if cancel.is_cancelled() {
            warn!("任务 #{} 在下载过程中被取消", state.id());
            return Err(DownloadError::Cancelled);
        }

        Ok(written)
    }
}

/// 解析 `Content-Range: bytes 0-0/12345` 中的总大小，`*` 表示未知
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (unit, rest) = value.trim().split_once(' ')?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return None;
    }
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// 格式化文件大小为人类可读格式
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
