//! 排队下载 API 客户端
//!
//! `surge get --port` 把任务交给本机正在运行的服务，而不是在本进程下载

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use crate::downloader::{ChecksumSpec, JobId};

#[derive(Debug, Serialize)]
struct ChecksumBody<'a> {
    algorithm: &'a str,
    digest: &'a str,
}

#[derive(Debug, Serialize)]
struct DownloadBody<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<&'a PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum: Option<ChecksumBody<'a>>,
}

#[derive(Debug, Deserialize)]
struct Reply {
    code: i32,
    message: String,
    data: Option<Accepted>,
}

#[derive(Debug, Deserialize)]
struct Accepted {
    id: JobId,
}

/// 把任务提交给 `127.0.0.1:port` 上的服务，返回服务端分配的任务 ID
pub async fn submit(
    port: u16,
    url: &str,
    path: Option<&PathBuf>,
    concurrency: Option<usize>,
    checksum: Option<&ChecksumSpec>,
) -> Result<JobId> {
    let endpoint = format!("http://127.0.0.1:{}/download", port);
    let body = DownloadBody {
        url,
        path,
        concurrency,
        checksum: checksum.map(|c| ChecksumBody {
            algorithm: c.algorithm.as_str(),
            digest: &c.expected,
        }),
    };

    debug!("提交任务到 {}", endpoint);
    let resp = reqwest::Client::new()
        .post(&endpoint)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("无法连接下载服务 {}", endpoint))?;

    let status = resp.status();
    let reply: Reply = resp
        .json()
        .await
        .with_context(|| format!("下载服务返回了无法解析的响应 (HTTP {})", status))?;

    match reply.data {
        Some(accepted) if status.is_success() && reply.code == 0 => Ok(accepted.id),
        _ => anyhow::bail!("下载服务拒绝了任务 (HTTP {}): {}", status, reply.message),
    }
}
