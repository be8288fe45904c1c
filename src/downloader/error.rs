//! 下载引擎错误类型
//!
//! 所有错误都可以廉价克隆（底层错误包在 Arc 里），
//! 这样 ProgressState 的一次性错误槽可以把同一个错误分发给报告器和调用方

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use super::checksum::ChecksumAlgorithm;

/// 下载引擎错误
#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    #[error("无效的下载地址: {0}")]
    InvalidUrl(String),

    #[error("网络请求失败: {0}")]
    Http(#[source] Arc<reqwest::Error>),

    #[error("服务器返回异常状态码 {status}: {url}")]
    Status { status: u16, url: String },

    #[error("服务器未按 Range 请求返回分片数据 (bytes={start}-)")]
    RangeNotHonored { start: u64 },

    #[error("读取数据超时 ({secs}s 内未收到数据)")]
    ReadTimeout { secs: u64 },

    #[error("连接提前关闭: 期望 {expected} bytes, 实际收到 {received} bytes")]
    Incomplete { expected: u64, received: u64 },

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("文件大小不匹配: 实际 {actual} bytes, 期望 {expected} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("{algorithm} 校验失败: 期望 {expected}, 实际 {computed}")]
    ChecksumMismatch {
        algorithm: ChecksumAlgorithm,
        expected: String,
        computed: String,
    },

    #[error("无效的 {algorithm} 校验值: {digest}")]
    InvalidChecksum {
        algorithm: ChecksumAlgorithm,
        digest: String,
    },

    #[error("不支持的校验算法: {0}")]
    UnsupportedAlgorithm(String),

    #[error("下载已取消")]
    Cancelled,

    #[error("分片任务异常退出: {0}")]
    TaskPanicked(String),
}

impl DownloadError {
    /// 构造文件系统错误，附带操作描述和路径
    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        DownloadError::Io {
            context,
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// 是否为可重试的瞬时网络错误
    ///
    /// 超时、连接失败、读取响应体失败、5xx/429 以及响应提前结束都会重试；
    /// 文件系统错误、4xx、取消和校验失败不会
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Http(e) => {
                e.is_timeout() || e.is_connect() || e.is_body() || e.is_request()
            }
            DownloadError::Status { status, .. } => *status >= 500 || *status == 429,
            DownloadError::Incomplete { .. } | DownloadError::ReadTimeout { .. } => true,
            _ => false,
        }
    }

    /// 是否为取消（兄弟分片失败或用户主动取消）
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        DownloadError::Http(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let server_error = DownloadError::Status {
            status: 503,
            url: "http://example.com".to_string(),
        };
        assert!(server_error.is_retryable());

        let not_found = DownloadError::Status {
            status: 404,
            url: "http://example.com".to_string(),
        };
        assert!(!not_found.is_retryable());

        let short = DownloadError::Incomplete {
            expected: 10,
            received: 3,
        };
        assert!(short.is_retryable());
        assert!(DownloadError::ReadTimeout { secs: 60 }.is_retryable());

        assert!(!DownloadError::Cancelled.is_retryable());
        assert!(DownloadError::Cancelled.is_cancelled());
        assert!(!DownloadError::RangeNotHonored { start: 0 }.is_retryable());
    }

    #[test]
    fn test_io_error_message() {
        let err = DownloadError::io(
            "创建文件失败",
            "/tmp/x",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        let message = err.to_string();
        assert!(message.contains("创建文件失败"));
        assert!(message.contains("denied"));
        assert!(!err.is_retryable());
    }
}
