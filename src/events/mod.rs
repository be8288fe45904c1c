//! 下载事件
//!
//! 引擎到展示层的边界：事件类型和每个任务的事件通道

pub mod bus;
pub mod types;

pub use bus::{EventBus, JobEventSink, DEFAULT_EVENT_BUFFER};
pub use types::DownloadEvent;
