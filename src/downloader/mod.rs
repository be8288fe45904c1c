pub mod checksum;
pub mod chunk;
pub mod engine;
pub mod error;
pub mod filename;
pub mod job;
pub mod manager;
pub mod progress;
pub mod reporter;
pub mod runner;
pub mod task;
pub mod worker;

pub use checksum::{ChecksumAlgorithm, ChecksumReport, ChecksumSpec};
pub use chunk::{Chunk, ChunkPlan, PlanPolicy};
pub use engine::{format_size, DownloadCoordinator, EngineConfig, ProbeResult};
pub use error::DownloadError;
pub use job::{DownloadJob, JobId, DEFAULT_CONCURRENCY};
pub use manager::{DownloadManager, ManagerConfig, ManagerError, NewDownload};
pub use progress::{ProgressSnapshot, ProgressState};
pub use reporter::{PollOutcome, ProgressReporter, ReporterConfig};
pub use runner::run_job;
pub use task::{DownloadTask, TaskStatus};
pub use worker::{ConnectionWorker, FetchTarget, PauseGate, RetryPolicy};
