//! 本地测试服务器
//!
//! - `/ranged/:name`  支持 Range，返回 206 + Content-Range
//! - `/plain/:name`   忽略 Range，返回 200 和完整内容
//! - `/stream/:name`  忽略 Range，分块流式返回，不带 Content-Length
//! - `/sever/:name`   支持 Range，但起点不为 0 的区间只发送一半就断开连接
//! - `/hang/:name`    支持 Range，区间请求只发送一半，之后既不发送也不断开
//! - `/flaky/:name`   支持 Range，前 `FLAKY_FAILURES` 个区间请求发送一半后断开，之后正常

#![allow(dead_code)]

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use surge::downloader::{EngineConfig, ReporterConfig, RetryPolicy};
use tokio::net::TcpListener;

const STREAM_PIECE: usize = 64 * 1024;

/// `/flaky` 路由断开的请求数
pub const FLAKY_FAILURES: usize = 2;

/// 可预测的测试内容
pub fn payload(len: usize) -> Bytes {
    (0..len)
        .map(|i| ((i * 31 + 7) % 251) as u8)
        .collect::<Vec<u8>>()
        .into()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub struct Served {
    pub data: Bytes,
    /// 收到的非探测 Range 请求数
    pub ranged_hits: AtomicUsize,
    /// `/flaky` 已断开的请求数
    pub flaky_failed: AtomicUsize,
}

pub struct TestServer {
    pub base: String,
    pub served: Arc<Served>,
}

impl TestServer {
    pub async fn start(data: Bytes) -> Self {
        let served = Arc::new(Served {
            data,
            ranged_hits: AtomicUsize::new(0),
            flaky_failed: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/ranged/:name", get(ranged))
            .route("/plain/:name", get(plain))
            .route("/stream/:name", get(streamed))
            .route("/sever/:name", get(severed))
            .route("/hang/:name", get(hanging))
            .route("/flaky/:name", get(flaky))
            .with_state(served.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            served,
        }
    }

    pub fn url(&self, route: &str, name: &str) -> String {
        format!("{}/{}/{}", self.base, route, name)
    }

    pub fn ranged_hits(&self) -> usize {
        self.served.ranged_hits.load(Ordering::SeqCst)
    }
}

/// 测试用引擎配置：重试快速失败
pub fn engine_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
        },
        read_timeout: Duration::from_secs(5),
        ..EngineConfig::default()
    }
}

pub fn reporter_config() -> ReporterConfig {
    ReporterConfig {
        poll_interval: Duration::from_millis(10),
        ..ReporterConfig::default()
    }
}

/// 解析 `bytes=start-end`，返回半开区间
fn parse_range(headers: &HeaderMap, len: usize) -> Option<(usize, usize)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end: usize = match end {
        "" => len - 1,
        e => e.parse::<usize>().ok()?.min(len - 1),
    };
    (start <= end && start < len).then_some((start, end + 1))
}

fn partial(served: &Served, start: usize, end: usize, body: Body) -> Response {
    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, end - 1, served.data.len()),
        )
        .header(header::CONTENT_LENGTH, end - start)
        .body(body)
        .unwrap()
}

fn is_size_request(headers: &HeaderMap) -> bool {
    headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "bytes=0-0")
        .unwrap_or(false)
}

fn count_hit(served: &Served, headers: &HeaderMap) {
    if !is_size_request(headers) && headers.contains_key(header::RANGE) {
        served.ranged_hits.fetch_add(1, Ordering::SeqCst);
    }
}

async fn ranged(State(served): State<Arc<Served>>, headers: HeaderMap) -> Response {
    count_hit(&served, &headers);
    match parse_range(&headers, served.data.len()) {
        Some((start, end)) => {
            let body = Body::from(served.data.slice(start..end));
            partial(&served, start, end, body)
        }
        None => Response::new(Body::from(served.data.clone())),
    }
}

async fn plain(State(served): State<Arc<Served>>) -> Response {
    Response::new(Body::from(served.data.clone()))
}

async fn streamed(State(served): State<Arc<Served>>) -> Response {
    let data = served.data.clone();
    let pieces: Vec<Result<Bytes, std::io::Error>> = (0..data.len())
        .step_by(STREAM_PIECE)
        .map(|start| Ok(data.slice(start..(start + STREAM_PIECE).min(data.len()))))
        .collect();
    Response::new(Body::from_stream(futures::stream::iter(pieces)))
}

async fn severed(State(served): State<Arc<Served>>, headers: HeaderMap) -> Response {
    count_hit(&served, &headers);
    let Some((start, end)) = parse_range(&headers, served.data.len()) else {
        return Response::new(Body::from(served.data.clone()));
    };
    if start == 0 {
        return partial(&served, start, end, Body::from(served.data.slice(start..end)));
    }

    let half = start + (end - start) / 2;
    let pieces: Vec<Result<Bytes, std::io::Error>> = vec![
        Ok(served.data.slice(start..half)),
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection severed",
        )),
    ];
    partial(
        &served,
        start,
        end,
        Body::from_stream(futures::stream::iter(pieces)),
    )
}

/// 前一半数据之后接 `tail`
fn half_then(
    served: &Served,
    start: usize,
    end: usize,
    tail: impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
) -> Response {
    use futures::StreamExt;

    let half = start + (end - start) / 2;
    let head = futures::stream::iter(vec![Ok::<_, std::io::Error>(served.data.slice(start..half))]);
    partial(served, start, end, Body::from_stream(head.chain(tail)))
}

async fn hanging(State(served): State<Arc<Served>>, headers: HeaderMap) -> Response {
    count_hit(&served, &headers);
    let Some((start, end)) = parse_range(&headers, served.data.len()) else {
        return Response::new(Body::from(served.data.clone()));
    };
    if is_size_request(&headers) {
        return partial(&served, start, end, Body::from(served.data.slice(start..end)));
    }
    half_then(&served, start, end, futures::stream::pending())
}

async fn flaky(State(served): State<Arc<Served>>, headers: HeaderMap) -> Response {
    count_hit(&served, &headers);
    let Some((start, end)) = parse_range(&headers, served.data.len()) else {
        return Response::new(Body::from(served.data.clone()));
    };
    if is_size_request(&headers) {
        return partial(&served, start, end, Body::from(served.data.slice(start..end)));
    }

    let failed = served
        .flaky_failed
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n < FLAKY_FAILURES).then_some(n + 1)
        })
        .is_ok();
    if !failed {
        return partial(&served, start, end, Body::from(served.data.slice(start..end)));
    }

    let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection severed");
    half_then(&served, start, end, futures::stream::iter(vec![Err(reset)]))
}
