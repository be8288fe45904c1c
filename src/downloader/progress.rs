//! 下载进度共享状态
//!
//! 热路径（已下载字节、活跃连接数）使用原子计数器，分片线程无需加锁；
//! 冷路径（错误、完成）放在同一把锁保护的终态里，保证：
//! - 错误只记录第一次，后续写入直接丢弃
//! - `done` 只会从 false 变为 true 一次，且与错误互斥

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::error::DownloadError;
use super::job::JobId;

/// 总大小未知的哨兵值
const UNKNOWN_TOTAL: u64 = u64::MAX;

/// 终态
#[derive(Debug)]
enum Terminal {
    Running,
    Done { elapsed: Duration },
    Failed(DownloadError),
}

/// 进度快照（只读）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// 已下载字节数
    pub downloaded: u64,
    /// 总大小（流式下载结束前未知）
    pub total: Option<u64>,
    /// 自任务开始经过的时间
    pub elapsed: Duration,
    /// 活跃连接数
    pub active_connections: u32,
}

impl ProgressSnapshot {
    /// 完成比例 (0.0 - 1.0)，总大小未知或为 0 时返回 0
    pub fn fraction(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => self.downloaded as f64 / total as f64,
            _ => 0.0,
        }
    }
}

/// 单个任务的进度状态
#[derive(Debug)]
pub struct ProgressState {
    id: JobId,
    start_time: Instant,
    downloaded: AtomicU64,
    total: AtomicU64,
    active_connections: AtomicU32,
    terminal: Mutex<Terminal>,
}

impl ProgressState {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            start_time: Instant::now(),
            downloaded: AtomicU64::new(0),
            total: AtomicU64::new(UNKNOWN_TOTAL),
            active_connections: AtomicU32::new(0),
            terminal: Mutex::new(Terminal::Running),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// 设置总大小，只有第一次生效
    ///
    /// 返回本次是否生效
    pub fn set_total(&self, total: u64) -> bool {
        // u64::MAX 用作"未知"，实际不可能出现这么大的文件
        let total = total.min(UNKNOWN_TOTAL - 1);
        self.total
            .compare_exchange(UNKNOWN_TOTAL, total, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn total(&self) -> Option<u64> {
        match self.total.load(Ordering::Acquire) {
            UNKNOWN_TOTAL => None,
            total => Some(total),
        }
    }

    /// 累加已下载字节数（可被多个分片并发调用）
    pub fn add_downloaded(&self, delta: u64) {
        self.downloaded.fetch_add(delta, Ordering::AcqRel);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn inc_active(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_active(&self) {
        // 不允许下溢
        let _ = self
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Acquire)
    }

    /// 记录错误，只有第一次生效（任务已完成时同样忽略）
    ///
    /// 返回本次是否生效
    pub fn set_error(&self, err: DownloadError) -> bool {
        let mut terminal = self.terminal.lock();
        match *terminal {
            Terminal::Running => {
                *terminal = Terminal::Failed(err);
                true
            }
            _ => false,
        }
    }

    pub fn get_error(&self) -> Option<DownloadError> {
        match &*self.terminal.lock() {
            Terminal::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// 标记完成，只在未失败且未完成时生效
    pub fn mark_done(&self) -> bool {
        let mut terminal = self.terminal.lock();
        match *terminal {
            Terminal::Running => {
                *terminal = Terminal::Done {
                    elapsed: self.start_time.elapsed(),
                };
                true
            }
            _ => false,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.terminal.lock(), Terminal::Done { .. })
    }

    /// 完成时的耗时（未完成返回 None）
    pub fn completion_elapsed(&self) -> Option<Duration> {
        match *self.terminal.lock() {
            Terminal::Done { elapsed } => Some(elapsed),
            _ => None,
        }
    }

    /// 获取一致性快照
    ///
    /// 先读总大小再读已下载字节；总大小已知时已下载量不会超过总大小
    pub fn snapshot(&self) -> ProgressSnapshot {
        let total = self.total();
        let downloaded = self.downloaded();
        let downloaded = match total {
            Some(total) => downloaded.min(total),
            None => downloaded,
        };

        ProgressSnapshot {
            downloaded,
            total,
            elapsed: self.start_time.elapsed(),
            active_connections: self.active_connections(),
        }
    }
}

/// 活跃连接守卫：创建时 +1，析构时 -1（无论分片以何种方式退出）
pub struct ActiveConnectionGuard<'a> {
    state: &'a ProgressState,
}

impl<'a> ActiveConnectionGuard<'a> {
    pub fn new(state: &'a ProgressState) -> Self {
        state.inc_active();
        Self { state }
    }
}

impl Drop for ActiveConnectionGuard<'_> {
    fn drop(&mut self) {
        self.state.dec_active();
    }
}
