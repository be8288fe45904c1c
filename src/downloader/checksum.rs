//! 文件校验
//!
//! 下载完成后流式读取文件计算摘要，与期望值（不区分大小写）比较。
//! 文件可能非常大，始终按固定缓冲区读取，不会整体载入内存

use serde::{Deserialize, Serialize};
use sha1::Digest as _;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use super::error::DownloadError;

/// 校验读取缓冲区大小: 64KB
const VERIFY_BUFFER_SIZE: usize = 64 * 1024;

/// 校验算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    /// 十六进制摘要长度
    pub fn hex_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Md5 => 32,
            ChecksumAlgorithm::Sha1 => 40,
            ChecksumAlgorithm::Sha256 => 64,
        }
    }

    /// 算法强度排序，CLI 同时给出多个校验值时取最强的一个
    pub fn strength(&self) -> u8 {
        match self {
            ChecksumAlgorithm::Md5 => 1,
            ChecksumAlgorithm::Sha1 => 2,
            ChecksumAlgorithm::Sha256 => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Md5 => "md5",
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(ChecksumAlgorithm::Md5),
            "sha1" => Ok(ChecksumAlgorithm::Sha1),
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            other => Err(DownloadError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// 期望的校验值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumSpec {
    pub algorithm: ChecksumAlgorithm,
    /// 期望摘要（十六进制，已转小写）
    pub expected: String,
}

impl ChecksumSpec {
    /// 创建校验规格，检查摘要是否为对应长度的十六进制串
    pub fn new(algorithm: ChecksumAlgorithm, expected: &str) -> Result<Self, DownloadError> {
        let expected = expected.trim().to_ascii_lowercase();
        if expected.len() != algorithm.hex_len() || hex::decode(&expected).is_err() {
            return Err(DownloadError::InvalidChecksum {
                algorithm,
                digest: expected,
            });
        }
        Ok(Self {
            algorithm,
            expected,
        })
    }

    /// 从算法名和摘要字符串创建
    pub fn parse(algorithm: &str, expected: &str) -> Result<Self, DownloadError> {
        Self::new(algorithm.parse()?, expected)
    }

    /// 多个候选中选取最强的算法
    pub fn strongest(specs: impl IntoIterator<Item = ChecksumSpec>) -> Option<ChecksumSpec> {
        specs.into_iter().max_by_key(|s| s.algorithm.strength())
    }
}

/// 校验结果（同时携带期望值和实际值，便于诊断）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumReport {
    pub algorithm: ChecksumAlgorithm,
    pub expected: String,
    pub computed: String,
    pub matched: bool,
}

impl ChecksumReport {
    /// 不匹配时转换为错误
    pub fn into_result(self) -> Result<ChecksumReport, DownloadError> {
        if self.matched {
            Ok(self)
        } else {
            Err(DownloadError::ChecksumMismatch {
                algorithm: self.algorithm,
                expected: self.expected,
                computed: self.computed,
            })
        }
    }
}

impl fmt::Display for ChecksumReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.matched {
            write!(f, "{} 校验通过: {}", self.algorithm, self.computed)
        } else {
            write!(
                f,
                "{} 校验失败: 期望 {}, 实际 {}",
                self.algorithm, self.expected, self.computed
            )
        }
    }
}

/// 增量哈希器
enum StreamHasher {
    Md5(md5::Context),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl StreamHasher {
    fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => StreamHasher::Md5(md5::Context::new()),
            ChecksumAlgorithm::Sha1 => StreamHasher::Sha1(sha1::Sha1::new()),
            ChecksumAlgorithm::Sha256 => StreamHasher::Sha256(sha2::Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            StreamHasher::Md5(ctx) => ctx.consume(data),
            StreamHasher::Sha1(h) => h.update(data),
            StreamHasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            StreamHasher::Md5(ctx) => format!("{:x}", ctx.compute()),
            StreamHasher::Sha1(h) => hex::encode(h.finalize()),
            StreamHasher::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// 计算文件摘要（十六进制小写）
pub async fn compute_digest(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<String, DownloadError> {
    let mut file = File::open(path)
        .await
        .map_err(|e| DownloadError::io("打开待校验文件失败", path, e))?;

    let mut hasher = StreamHasher::new(algorithm);
    let mut buf = vec![0u8; VERIFY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| DownloadError::io("读取待校验文件失败", path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    debug!("计算 {} 摘要完成: {:?}, {} bytes", algorithm, path, total);
    Ok(hasher.finalize_hex())
}

/// 校验文件
///
/// 返回的报告中 `matched` 表示是否一致；只有读取文件失败才返回 Err
pub async fn verify(path: &Path, spec: &ChecksumSpec) -> Result<ChecksumReport, DownloadError> {
    let computed = compute_digest(path, spec.algorithm).await?;
    let matched = computed.eq_ignore_ascii_case(&spec.expected);

    let report = ChecksumReport {
        algorithm: spec.algorithm,
        expected: spec.expected.clone(),
        computed,
        matched,
    };

    if report.matched {
        info!("✅ {}", report);
    } else {
        warn!("❌ {:?}: {}", path, report);
    }

    Ok(report)
}
