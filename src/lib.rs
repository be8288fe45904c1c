// Surge: 多连接 HTTP 下载加速器

// 配置管理模块
pub mod config;

// 下载引擎模块
pub mod downloader;

// 下载事件模块
pub mod events;

// 日志模块
pub mod logging;

// 排队下载 API 客户端
pub mod remote;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use config::AppConfig;
pub use downloader::{
    DownloadCoordinator, DownloadError, DownloadJob, DownloadManager, DownloadTask, TaskStatus,
};
pub use events::{DownloadEvent, EventBus};
pub use server::AppState;
