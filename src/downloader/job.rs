use serde::Serialize;
use std::path::PathBuf;

use super::checksum::ChecksumSpec;
use super::error::DownloadError;

/// 任务 ID
pub type JobId = u64;

/// 默认并发连接数
pub const DEFAULT_CONCURRENCY: usize = 8;

/// 下载任务描述（创建后不可变）
#[derive(Debug, Clone, Serialize)]
pub struct DownloadJob {
    pub id: JobId,
    /// 源地址
    pub url: String,
    /// 目标路径（文件或目录）
    pub destination: PathBuf,
    /// 期望并发连接数（>= 1）
    pub concurrency: usize,
    /// 可选的校验值
    pub checksum: Option<ChecksumSpec>,
}

impl DownloadJob {
    /// 创建任务，校验地址格式并把并发数修正为至少 1
    pub fn new(
        id: JobId,
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
        concurrency: usize,
        checksum: Option<ChecksumSpec>,
    ) -> Result<Self, DownloadError> {
        let url = url.into();
        let parsed =
            reqwest::Url::parse(&url).map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidUrl(format!(
                "{}: 仅支持 http/https",
                url
            )));
        }

        Ok(Self {
            id,
            url,
            destination: destination.into(),
            concurrency: concurrency.max(1),
            checksum,
        })
    }
}
