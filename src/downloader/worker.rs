//! 单连接下载
//!
//! 每个分片由一个 ConnectionWorker 负责：发起 Range 请求，按固定大小的缓冲区
//! 写入自己负责的文件区间，并实时累加共享进度

use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::chunk::Chunk;
use super::error::DownloadError;
use super::progress::{ActiveConnectionGuard, ProgressState};

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 默认重试基础等待时间
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// 默认读取缓冲区: 32KB
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// 重试策略：第 n 次重试前等待 base * 2^(n-1)
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// 第 `attempt` 次重试（从 1 开始）前的等待时间，上限 30 秒
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(factor)
            .min(Duration::from_secs(30))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

/// 暂停开关
///
/// 暂停时分片不再继续读取数据，但不主动断开连接；取消优先于暂停
#[derive(Debug, Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<bool>>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        self.tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    /// 等待恢复；在暂停期间被取消返回 Cancelled
    pub async fn wait_resumed(&self, cancel: &CancellationToken) -> Result<(), DownloadError> {
        if !self.is_paused() {
            return Ok(());
        }
        let mut rx = self.tx.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => Err(DownloadError::Cancelled),
            res = rx.wait_for(|paused| !*paused) => {
                res.map(|_| ()).map_err(|_| DownloadError::Cancelled)
            }
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// 下载目标
#[derive(Debug, Clone)]
pub enum FetchTarget {
    /// 字节区间
    Range(Chunk),
    /// 整个资源（单连接）
    Whole {
        expected: Option<u64>,
        resumable: bool,
    },
}

/// 单个连接的下载任务
#[derive(Debug)]
pub struct ConnectionWorker {
    pub client: Client,
    pub url: String,
    pub target: FetchTarget,
    pub output_path: PathBuf,
    pub state: Arc<ProgressState>,
    pub cancel: CancellationToken,
    pub pause: PauseGate,
    pub retry: RetryPolicy,
    pub buffer_size: usize,
    pub read_timeout: Duration,
}

impl ConnectionWorker {
    fn label(&self) -> String {
        match &self.target {
            FetchTarget::Range(chunk) => format!("分片 #{}", chunk.index),
            FetchTarget::Whole { .. } => "单连接".to_string(),
        }
    }

    /// 已写入 `written` 字节后能否重试
    fn can_resume(&self, written: u64) -> bool {
        match &self.target {
            FetchTarget::Range(_) => true,
            FetchTarget::Whole { resumable, .. } => *resumable || written == 0,
        }
    }

    /// 下载（带重试）
    ///
    /// 返回本连接写入的字节数。被取消时返回 `DownloadError::Cancelled`
    pub async fn fetch(self) -> Result<u64, DownloadError> {
        let _active = ActiveConnectionGuard::new(&self.state);
        let label = self.label();
        let mut written = 0u64;
        let mut retries = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                debug!("[{}] 下载被取消", label);
                return Err(DownloadError::Cancelled);
            }

            let err = match self.fetch_once(&mut written).await {
                Ok(()) => {
                    debug!("[{}] 下载完成，大小: {} bytes", label, written);
                    return Ok(written);
                }
                Err(e) => e,
            };

            if err.is_cancelled() {
                debug!("[{}] 下载被取消 (已写入 {} bytes)", label, written);
                return Err(err);
            }

            if !err.is_retryable() || retries >= self.retry.max_retries || !self.can_resume(written)
            {
                error!(
                    "[{}] ✗ 下载失败，已重试 {} 次: {}",
                    label, retries, err
                );
                return Err(err);
            }

            retries += 1;
            let delay = self.retry.delay(retries);
            warn!(
                "[{}] ⚠ 下载失败，{}ms 后重试 ({}/{}): {}",
                label,
                delay.as_millis(),
                retries,
                self.retry.max_retries,
                err
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 单次尝试：从 `written` 处继续，成功时整个目标都已写入
    async fn fetch_once(&self, written: &mut u64) -> Result<(), DownloadError> {
        // (文件起始偏移, 本次最多写入的字节数, 是否需要 Range 请求)
        let (start, limit, ranged) = match &self.target {
            FetchTarget::Range(chunk) => {
                let start = chunk.range.start + *written;
                (start, Some(chunk.range.end - start), true)
            }
            FetchTarget::Whole { expected, .. } => {
                let limit = expected.map(|e| e.saturating_sub(*written));
                (*written, limit, *written > 0)
            }
        };

        if limit == Some(0) {
            return Ok(());
        }

        let mut request = self.client.get(&self.url);
        if ranged {
            let range = match limit {
                Some(len) => format!("bytes={}-{}", start, start + len - 1),
                None => format!("bytes={}-", start),
            };
            debug!("[{}] 请求 {}", self.label(), range);
            request = request.header(RANGE, range);
        }

        let resp = tokio::select! {
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            resp = request.send() => resp?,
        };

        let status = resp.status();
        if ranged && status == StatusCode::OK {
            return Err(DownloadError::RangeNotHonored { start });
        }
        if !status.is_success() {
            return Err(DownloadError::Status {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }

        // 每个连接使用自己的文件句柄，定位到自己的偏移量
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.output_path)
            .await
            .map_err(|e| DownloadError::io("打开输出文件失败", &self.output_path, e))?;
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|e| DownloadError::io("文件定位失败", &self.output_path, e))?;

        let mut stream = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::with_capacity(self.buffer_size);
        let mut received = 0u64;

        let outcome: Result<(), DownloadError> = loop {
            if let Err(e) = self.pause.wait_resumed(&self.cancel).await {
                break Err(e);
            }

            let next = tokio::select! {
                _ = self.cancel.cancelled() => break Err(DownloadError::Cancelled),
                next = tokio::time::timeout(self.read_timeout, stream.next()) => next,
            };

            let bytes = match next {
                Err(_) => {
                    break Err(DownloadError::ReadTimeout {
                        secs: self.read_timeout.as_secs(),
                    })
                }
                Ok(None) => break Ok(()),
                Ok(Some(Err(e))) => break Err(e.into()),
                Ok(Some(Ok(bytes))) => bytes,
            };

            // 不写出分片边界
            let take = match limit {
                Some(limit) => (bytes.len() as u64).min(limit - received) as usize,
                None => bytes.len(),
            };
            received += take as u64;

            let mut data = &bytes[..take];
            while !data.is_empty() {
                let n = (self.buffer_size - buf.len()).min(data.len());
                buf.extend_from_slice(&data[..n]);
                data = &data[n..];
                if buf.len() >= self.buffer_size {
                    self.flush_buffer(&mut file, &mut buf, written).await?;
                }
            }

            if limit == Some(received) {
                break Ok(());
            }
        };

        if matches!(outcome, Err(DownloadError::Cancelled)) {
            return outcome;
        }

        // 出错时也先写入已收到的数据，重试从这里继续
        self.flush_buffer(&mut file, &mut buf, written).await?;
        file.flush()
            .await
            .map_err(|e| DownloadError::io("刷新文件缓冲失败", &self.output_path, e))?;
        outcome?;

        if let Some(limit) = limit {
            if received < limit {
                return Err(DownloadError::Incomplete {
                    expected: limit,
                    received,
                });
            }
        }

        Ok(())
    }

    /// 写入缓冲区并累加进度
    async fn flush_buffer(
        &self,
        file: &mut tokio::fs::File,
        buf: &mut Vec<u8>,
        written: &mut u64,
    ) -> Result<(), DownloadError> {
        if buf.is_empty() {
            return Ok(());
        }
        file.write_all(buf)
            .await
            .map_err(|e| DownloadError::io("写入文件失败", &self.output_path, e))?;

        let len = buf.len() as u64;
        *written += len;
        self.state.add_downloaded(len);
        buf.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_pause_gate() {
        let gate = PauseGate::new();
        let cancel = CancellationToken::new();
        assert!(gate.wait_resumed(&cancel).await.is_ok());

        gate.pause();
        assert!(gate.is_paused());

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait_resumed(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_wins_over_pause() {
        let gate = PauseGate::new();
        let cancel = CancellationToken::new();
        gate.pause();

        let waiter = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait_resumed(&cancel).await })
        };
        cancel.cancel();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(DownloadError::Cancelled)
        ));
    }

    #[test]
    fn test_can_resume() {
        let worker = |target| ConnectionWorker {
            client: Client::new(),
            url: "http://127.0.0.1/".to_string(),
            target,
            output_path: PathBuf::from("/tmp/none"),
            state: Arc::new(ProgressState::new(1)),
            cancel: CancellationToken::new(),
            pause: PauseGate::new(),
            retry: RetryPolicy::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            read_timeout: Duration::from_secs(1),
        };

        let ranged = worker(FetchTarget::Range(Chunk::new(0, 0..10)));
        assert!(ranged.can_resume(5));

        let stream = worker(FetchTarget::Whole {
            expected: None,
            resumable: false,
        });
        assert!(stream.can_resume(0));
        assert!(!stream.can_resume(1));
    }
}
