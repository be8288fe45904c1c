//! 事件总线
//!
//! 每个任务一条有界通道，缓冲区满时生产者等待（不丢事件）。
//! 终止事件只能发送一次，发送后通道关闭

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::types::DownloadEvent;
use crate::downloader::job::JobId;

/// 默认每个任务的事件缓冲区大小
pub const DEFAULT_EVENT_BUFFER: usize = 16;

/// 事件总线：为每个任务创建独立的事件通道
#[derive(Debug, Clone, Copy)]
pub struct EventBus {
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 为任务打开事件通道
    pub fn open(&self, job_id: JobId) -> (JobEventSink, mpsc::Receiver<DownloadEvent>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let sink = JobEventSink {
            inner: Arc::new(SinkInner {
                job_id,
                tx: Mutex::new(Some(tx)),
                closed: AtomicBool::new(false),
            }),
        };
        (sink, rx)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

#[derive(Debug)]
struct SinkInner {
    job_id: JobId,
    tx: Mutex<Option<mpsc::Sender<DownloadEvent>>>,
    closed: AtomicBool,
}

/// 单个任务的事件发送端
///
/// 可以被多个生产者（运行器、进度报告器）共享，
/// 终止事件由第一个调用 `send_terminal` 的生产者发出
#[derive(Debug, Clone)]
pub struct JobEventSink {
    inner: Arc<SinkInner>,
}

impl JobEventSink {
    pub fn job_id(&self) -> JobId {
        self.inner.job_id
    }

    /// 发送事件，通道已关闭时返回 false
    ///
    /// 终止事件会转交给 `send_terminal`
    pub async fn send(&self, event: DownloadEvent) -> bool {
        if event.is_terminal() {
            return self.send_terminal(event).await;
        }

        // 发送期间持有锁，保证终止事件一定排在最后
        let guard = self.inner.tx.lock().await;
        match guard.as_ref() {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// 发送终止事件并关闭通道
    ///
    /// 只有第一次调用会真正发送，返回本次是否发出
    pub async fn send_terminal(&self, event: DownloadEvent) -> bool {
        let tx = {
            let mut guard = self.inner.tx.lock().await;
            let tx = guard.take();
            if tx.is_some() {
                self.inner.closed.store(true, Ordering::Release);
            }
            tx
        };

        match tx {
            Some(tx) => {
                debug!("任务 #{} 发送终止事件: {:?}", self.inner.job_id, event);
                // 消费者已经退出时事件被丢弃，但通道仍然视为已关闭
                let _ = tx.send(event).await;
                true
            }
            None => false,
        }
    }

    /// 终止事件是否已发出
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}
