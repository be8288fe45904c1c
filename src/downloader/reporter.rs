//! 进度报告器
//!
//! 按固定间隔轮询 ProgressState，把共享状态转换为离散的进度事件：
//! - 变化量低于阈值时跳过本次事件，但仍然安排下一次轮询
//! - 速度使用指数移动平均平滑
//! - 观察到完成或错误时发出终止事件并停止

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::progress::ProgressState;
use crate::events::{DownloadEvent, JobEventSink};

/// 默认轮询间隔: 150ms
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// 默认变化阈值: 0.3%
pub const DEFAULT_DELTA_THRESHOLD: f64 = 0.003;

/// 默认速度平滑系数
pub const DEFAULT_SPEED_SMOOTHING: f64 = 0.3;

/// 报告器配置
#[derive(Debug, Clone, Copy)]
pub struct ReporterConfig {
    pub poll_interval: Duration,
    /// 完成比例变化低于该值时不发事件
    pub delta_threshold: f64,
    /// EMA 系数，越大越偏向最新样本
    pub speed_smoothing: f64,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            delta_threshold: DEFAULT_DELTA_THRESHOLD,
            speed_smoothing: DEFAULT_SPEED_SMOOTHING,
        }
    }
}

/// 单次轮询结果
#[derive(Debug, Clone)]
pub enum PollOutcome {
    /// 发出进度事件，继续轮询
    Progress(DownloadEvent),
    /// 变化太小，不发事件，继续轮询
    Skip,
    /// 发出终止事件，停止轮询
    Terminal(DownloadEvent),
}

/// 进度报告器
#[derive(Debug)]
pub struct ProgressReporter {
    state: Arc<ProgressState>,
    config: ReporterConfig,
    /// 上次上报的完成比例
    last_fraction: f64,
    /// 上次上报的平滑速度（尚未上报为 None，为 0 时下次重新取样）
    last_speed: Option<f64>,
    /// 上次上报时的时间和已下载字节
    last_sample: (Instant, u64),
}

impl ProgressReporter {
    pub fn new(state: Arc<ProgressState>, config: ReporterConfig) -> Self {
        let last_sample = (state.start_time(), 0);
        Self {
            state,
            config,
            last_fraction: 0.0,
            last_speed: None,
            last_sample,
        }
    }

    pub fn poll(&mut self) -> PollOutcome {
        self.poll_at(Instant::now())
    }

    /// 在给定时刻轮询一次
    pub fn poll_at(&mut self, now: Instant) -> PollOutcome {
        let job_id = self.state.id();

        if self.state.is_done() {
            let elapsed = self
                .state
                .completion_elapsed()
                .unwrap_or_else(|| now.saturating_duration_since(self.state.start_time()));
            let total_bytes = self.state.total().unwrap_or_else(|| self.state.downloaded());
            return PollOutcome::Terminal(DownloadEvent::Complete {
                job_id,
                elapsed,
                total_bytes,
            });
        }

        if let Some(error) = self.state.get_error() {
            return PollOutcome::Terminal(DownloadEvent::Error { job_id, error });
        }

        let snapshot = self.state.snapshot();
        let fraction = snapshot.fraction();
        let delta = fraction - self.last_fraction;
        if self.last_fraction > 0.0 && (0.0..self.config.delta_threshold).contains(&delta) {
            return PollOutcome::Skip;
        }

        let (last_time, last_bytes) = self.last_sample;
        let window = now.saturating_duration_since(last_time).as_secs_f64();
        let instant_speed = if window > 0.0 {
            snapshot.downloaded.saturating_sub(last_bytes) as f64 / window
        } else {
            0.0
        };
        // 前一个速度为 0 视为尚未有有效样本，直接用本次的瞬时速度
        let speed = match self.last_speed {
            Some(prev) if prev > 0.0 => {
                let alpha = self.config.speed_smoothing;
                alpha * instant_speed + (1.0 - alpha) * prev
            }
            _ => instant_speed,
        };

        self.last_fraction = fraction;
        self.last_speed = Some(speed);
        self.last_sample = (now, snapshot.downloaded);

        PollOutcome::Progress(DownloadEvent::Progress {
            job_id,
            downloaded_bytes: snapshot.downloaded,
            total_bytes: snapshot.total,
            speed,
            active_connections: snapshot.active_connections,
        })
    }

    /// 轮询直到发出终止事件，或者事件通道已被其他生产者关闭
    pub async fn run(mut self, sink: JobEventSink) {
        let job_id = self.state.id();
        loop {
            if sink.is_closed() {
                break;
            }

            match self.poll() {
                PollOutcome::Terminal(event) => {
                    sink.send_terminal(event).await;
                    break;
                }
                PollOutcome::Progress(event) => {
                    sink.send(event).await;
                }
                PollOutcome::Skip => {}
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
        debug!("任务 #{} 进度报告结束", job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::error::DownloadError;
    use crate::events::EventBus;

    fn setup(total: u64) -> (Arc<ProgressState>, ProgressReporter) {
        let state = Arc::new(ProgressState::new(9));
        state.set_total(total);
        let reporter = ProgressReporter::new(state.clone(), ReporterConfig::default());
        (state, reporter)
    }

    #[test]
    fn test_small_change_is_skipped() {
        let (state, mut reporter) = setup(100_000);
        let t0 = state.start_time();

        state.add_downloaded(50_000);
        assert!(matches!(
            reporter.poll_at(t0 + Duration::from_millis(150)),
            PollOutcome::Progress(_)
        ));

        // 10ms 后变化 0.1%，低于阈值
        state.add_downloaded(100);
        assert!(matches!(
            reporter.poll_at(t0 + Duration::from_millis(160)),
            PollOutcome::Skip
        ));

        // 累计变化超过阈值后重新上报
        state.add_downloaded(300);
        match reporter.poll_at(t0 + Duration::from_millis(310)) {
            PollOutcome::Progress(DownloadEvent::Progress {
                downloaded_bytes, ..
            }) => assert_eq!(downloaded_bytes, 50_400),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_speed_is_smoothed() {
        let (state, mut reporter) = setup(10_000_000);
        let t0 = state.start_time();

        // 第一秒 1MB/s
        state.add_downloaded(1_000_000);
        let first = match reporter.poll_at(t0 + Duration::from_secs(1)) {
            PollOutcome::Progress(DownloadEvent::Progress { speed, .. }) => speed,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!((first - 1_000_000.0).abs() < 1.0);

        // 第二秒 2MB/s：0.3 * 2MB + 0.7 * 1MB = 1.3MB
        state.add_downloaded(2_000_000);
        let second = match reporter.poll_at(t0 + Duration::from_secs(2)) {
            PollOutcome::Progress(DownloadEvent::Progress { speed, .. }) => speed,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!((second - 1_300_000.0).abs() < 1.0);
    }

    #[test]
    fn test_zero_first_sample_does_not_drag_speed() {
        let (state, mut reporter) = setup(10_000_000);
        let t0 = state.start_time();

        // 刚启动时还没有数据
        let first = match reporter.poll_at(t0 + Duration::from_millis(1)) {
            PollOutcome::Progress(DownloadEvent::Progress { speed, .. }) => speed,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(first, 0.0);

        // 之后稳定 1MB/s，速度应直接等于瞬时速度
        state.add_downloaded(1_000_000);
        let second = match reporter.poll_at(t0 + Duration::from_millis(1001)) {
            PollOutcome::Progress(DownloadEvent::Progress { speed, .. }) => speed,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!((second - 1_000_000.0).abs() < 1.0);

        // 有效样本之后恢复平滑：0.3 * 2MB + 0.7 * 1MB
        state.add_downloaded(2_000_000);
        let third = match reporter.poll_at(t0 + Duration::from_millis(2001)) {
            PollOutcome::Progress(DownloadEvent::Progress { speed, .. }) => speed,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!((third - 1_300_000.0).abs() < 1.0);
    }

    #[test]
    fn test_unknown_total_always_reports() {
        let state = Arc::new(ProgressState::new(1));
        let mut reporter = ProgressReporter::new(state.clone(), ReporterConfig::default());
        let t0 = state.start_time();

        for i in 1..4u64 {
            state.add_downloaded(10);
            match reporter.poll_at(t0 + Duration::from_millis(10 * i)) {
                PollOutcome::Progress(DownloadEvent::Progress { total_bytes, .. }) => {
                    assert_eq!(total_bytes, None)
                }
                other => panic!("unexpected outcome: {:?}", other),
            }
        }
    }

    #[test]
    fn test_terminal_outcomes() {
        let (state, mut reporter) = setup(100);
        state.add_downloaded(100);
        state.mark_done();
        match reporter.poll() {
            PollOutcome::Terminal(DownloadEvent::Complete { total_bytes, .. }) => {
                assert_eq!(total_bytes, 100)
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let (state, mut reporter) = setup(100);
        state.set_error(DownloadError::Incomplete {
            expected: 100,
            received: 10,
        });
        assert!(matches!(
            reporter.poll(),
            PollOutcome::Terminal(DownloadEvent::Error { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_emits_single_terminal_and_closes() {
        let (state, reporter) = setup(1000);
        let (sink, mut rx) = EventBus::default().open(state.id());
        let handle = tokio::spawn(reporter.run(sink));

        state.add_downloaded(1000);
        state.mark_done();
        handle.await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        let terminal: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(events.last(), Some(DownloadEvent::Complete { .. })));
    }

    #[tokio::test]
    async fn test_run_stops_when_sink_closed() {
        let (state, reporter) = setup(1000);
        let (sink, mut rx) = EventBus::default().open(state.id());
        sink.send_terminal(DownloadEvent::Error {
            job_id: state.id(),
            error: DownloadError::Cancelled,
        })
        .await;

        tokio::time::timeout(Duration::from_secs(1), reporter.run(sink))
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(DownloadEvent::Error { .. })));
        assert!(rx.recv().await.is_none());
    }
}
