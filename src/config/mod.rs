// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::downloader::chunk::{PlanPolicy, DEFAULT_MIN_CHUNK_SIZE, DEFAULT_MIN_SPLIT_SIZE};
use crate::downloader::engine::{EngineConfig, DEFAULT_USER_AGENT};
use crate::downloader::job::DEFAULT_CONCURRENCY;
use crate::downloader::manager::{ManagerConfig, DEFAULT_MAX_CONCURRENT_JOBS};
use crate::downloader::reporter::{
    ReporterConfig, DEFAULT_DELTA_THRESHOLD, DEFAULT_SPEED_SMOOTHING,
};
use crate::downloader::worker::{RetryPolicy, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_RETRIES};
use crate::events::DEFAULT_EVENT_BUFFER;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/surge.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 进度报告配置
    #[serde(default)]
    pub progress: ProgressConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1700
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 默认下载目录
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// 每个任务默认并发连接数
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// 最大同时下载任务数（服务模式）
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// 每个分片最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试基础等待时间（毫秒），每次翻倍
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 小于该大小的文件不拆分（字节）
    #[serde(default = "default_min_split_size")]
    pub min_split_size: u64,
    /// 单个分片最小大小（字节）
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    /// 写入缓冲区大小（字节）
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// 连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 读取超时（秒）
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_max_concurrent_jobs() -> usize {
    DEFAULT_MAX_CONCURRENT_JOBS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_min_split_size() -> u64 {
    DEFAULT_MIN_SPLIT_SIZE
}

fn default_min_chunk_size() -> u64 {
    DEFAULT_MIN_CHUNK_SIZE
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    DEFAULT_USER_AGENT.to_string()
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            concurrency: default_concurrency(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            min_split_size: default_min_split_size(),
            min_chunk_size: default_min_chunk_size(),
            buffer_size: default_buffer_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

impl DownloadConfig {
    /// 转换为下载引擎配置
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            policy: PlanPolicy {
                min_split_size: self.min_split_size,
                min_chunk_size: self.min_chunk_size,
            },
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
            },
            buffer_size: self.buffer_size,
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            user_agent: self.user_agent.clone(),
        }
    }
}

/// 进度报告配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// 轮询间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 完成比例变化低于该值时不发事件
    #[serde(default = "default_delta_threshold")]
    pub delta_threshold: f64,
    /// 速度 EMA 平滑系数 (0, 1]
    #[serde(default = "default_speed_smoothing")]
    pub speed_smoothing: f64,
    /// 每个任务的事件缓冲区大小
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_poll_interval_ms() -> u64 {
    150
}

fn default_delta_threshold() -> f64 {
    DEFAULT_DELTA_THRESHOLD
}

fn default_speed_smoothing() -> f64 {
    DEFAULT_SPEED_SMOOTHING
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            delta_threshold: default_delta_threshold(),
            speed_smoothing: default_speed_smoothing(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl ProgressConfig {
    pub fn reporter_config(&self) -> ReporterConfig {
        ReporterConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            delta_threshold: self.delta_threshold,
            speed_smoothing: self.speed_smoothing,
        }
    }
}

impl AppConfig {
    /// 服务模式下的任务管理器配置
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            download_dir: self.download.download_dir.clone(),
            default_concurrency: self.download.concurrency,
            max_concurrent_jobs: self.download.max_concurrent_jobs,
            event_buffer: self.progress.event_buffer,
            reporter: self.progress.reporter_config(),
        }
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        let d = &self.download;
        if d.concurrency == 0 {
            anyhow::bail!("download.concurrency 必须大于 0");
        }
        if d.max_concurrent_jobs == 0 {
            anyhow::bail!("download.max_concurrent_jobs 必须大于 0");
        }
        if d.buffer_size == 0 {
            anyhow::bail!("download.buffer_size 必须大于 0");
        }
        if d.read_timeout_secs == 0 {
            anyhow::bail!("download.read_timeout_secs 必须大于 0");
        }

        let p = &self.progress;
        if !(p.speed_smoothing > 0.0 && p.speed_smoothing <= 1.0) {
            anyhow::bail!(
                "progress.speed_smoothing 必须在 (0, 1] 之间，当前值: {}",
                p.speed_smoothing
            );
        }
        if p.delta_threshold.is_nan() || p.delta_threshold < 0.0 {
            anyhow::bail!(
                "progress.delta_threshold 不能为负数，当前值: {}",
                p.delta_threshold
            );
        }
        if p.poll_interval_ms == 0 {
            anyhow::bail!("progress.poll_interval_ms 必须大于 0");
        }
        if p.event_buffer == 0 {
            anyhow::bail!("progress.event_buffer 必须大于 0");
        }

        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载配置，文件不存在或无效时使用默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 1700);
        assert_eq!(config.download.concurrency, 8);
        assert_eq!(config.download.max_retries, 3);
        assert_eq!(config.progress.poll_interval_ms, 150);
        assert!(!config.log.enabled);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.download.concurrency = 4;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.server.port, config.server.port);
        assert_eq!(loaded.download.concurrency, 4);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [download]
            concurrency = 2

            [progress]
            poll_interval_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.download.concurrency, 2);
        assert_eq!(config.download.buffer_size, 32 * 1024);
        assert_eq!(config.progress.poll_interval_ms, 50);
        assert_eq!(config.progress.speed_smoothing, 0.3);
        assert_eq!(config.server.host, "127.0.0.1");

        let engine = config.download.engine_config();
        assert_eq!(engine.retry.base_delay, Duration::from_millis(200));
        assert_eq!(engine.policy.min_split_size, 1024 * 1024);
        assert_eq!(
            config.progress.reporter_config().poll_interval,
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.download.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.progress.speed_smoothing = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.progress.delta_threshold = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.progress.delta_threshold = 0.0;
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let config = AppConfig::load_or_default(path.to_str().unwrap()).await;
        assert_eq!(config.server.port, 1700);
        assert!(!path.exists());
    }
}
