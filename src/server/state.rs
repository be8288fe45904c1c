// 应用状态

use crate::config::AppConfig;
use crate::downloader::{DownloadCoordinator, DownloadManager};
use anyhow::Context;
use std::sync::Arc;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 下载管理器
    pub download_manager: Arc<DownloadManager>,
    /// 应用配置
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// 根据配置创建下载协调器和任务管理器
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let coordinator = DownloadCoordinator::new(config.download.engine_config())
            .context("创建 HTTP 客户端失败")?;
        let manager = DownloadManager::new(coordinator, config.manager_config())?;

        Ok(Self {
            download_manager: Arc::new(manager),
            config: Arc::new(config),
        })
    }

    /// 取消所有任务
    pub fn shutdown(&self) {
        self.download_manager.shutdown();
    }
}
