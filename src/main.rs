use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use surge::{
    config::{AppConfig, LogConfig, DEFAULT_CONFIG_PATH},
    downloader::{
        format_size, run_job, ChecksumAlgorithm, ChecksumSpec, DownloadCoordinator, DownloadJob,
        PauseGate,
    },
    events::{DownloadEvent, EventBus},
    logging, remote, server, AppState,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "surge", version, about = "多连接 HTTP 下载加速器", propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// 输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// 下载一个文件
    #[command(alias = "g")]
    Get(GetArgs),
    /// 启动排队下载服务
    #[command(alias = "s")]
    Server(ServerArgs),
}

#[derive(Debug, Args)]
struct GetArgs {
    /// 下载地址
    url: String,

    /// 保存路径（文件或目录），默认为配置的下载目录
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 并发连接数
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// 期望的 MD5
    #[arg(long, value_name = "HEX")]
    md5: Option<String>,

    /// 期望的 SHA-1
    #[arg(long, value_name = "HEX")]
    sha1: Option<String>,

    /// 期望的 SHA-256
    #[arg(long, value_name = "HEX")]
    sha256: Option<String>,

    /// 交给本机该端口上运行的服务下载
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Args)]
struct ServerArgs {
    /// 监听地址
    #[arg(long)]
    host: Option<String>,

    /// 监听端口
    #[arg(short, long)]
    port: Option<u16>,
}

impl GetArgs {
    /// 同时给出多个校验值时使用最强的算法
    fn checksum(&self) -> anyhow::Result<Option<ChecksumSpec>> {
        let candidates = [
            (ChecksumAlgorithm::Md5, &self.md5),
            (ChecksumAlgorithm::Sha1, &self.sha1),
            (ChecksumAlgorithm::Sha256, &self.sha256),
        ];
        let mut specs = Vec::new();
        for (algorithm, digest) in candidates {
            if let Some(digest) = digest {
                specs.push(ChecksumSpec::new(algorithm, digest)?);
            }
        }
        Ok(ChecksumSpec::strongest(specs))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = load_log_config(&cli.config).await;
    let _log_guard = logging::init_logging(&log_config, cli.verbose);
    let config = AppConfig::load_or_default(&cli.config).await;

    match cli.cmd {
        Commands::Get(args) => get(config, args).await,
        Commands::Server(args) => run_server(config, args).await,
    }
}

/// 加载日志配置
///
/// 日志系统初始化之前读取，失败时静默返回默认配置
async fn load_log_config(path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

async fn get(config: AppConfig, args: GetArgs) -> anyhow::Result<()> {
    let checksum = args.checksum()?;

    if let Some(port) = args.port {
        let id = remote::submit(
            port,
            &args.url,
            args.output.as_ref(),
            args.concurrency,
            checksum.as_ref(),
        )
        .await?;
        println!("任务已提交到 127.0.0.1:{}，任务 ID: {}", port, id);
        return Ok(());
    }

    let destination = args
        .output
        .unwrap_or_else(|| config.download.download_dir.clone());
    let concurrency = args.concurrency.unwrap_or(config.download.concurrency);
    let job = DownloadJob::new(1, args.url, destination, concurrency, checksum)?;

    let coordinator = DownloadCoordinator::new(config.download.engine_config())
        .context("创建 HTTP 客户端失败")?;
    let (sink, rx) = EventBus::new(config.progress.event_buffer).open(job.id);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("收到 Ctrl+C，正在取消下载...");
                cancel.cancel();
            }
        });
    }

    let printer = tokio::spawn(print_events(rx));
    let result = run_job(
        &coordinator,
        job,
        sink,
        config.progress.reporter_config(),
        cancel,
        PauseGate::new(),
    )
    .await;
    printer.await.context("进度输出异常退出")?;

    let path = result?;
    println!("已保存到 {}", path.display());
    Ok(())
}

/// 把事件流打印为纯文本进度行
async fn print_events(mut rx: mpsc::Receiver<DownloadEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            DownloadEvent::Started { job_id } => println!("开始下载 (任务 #{})", job_id),
            DownloadEvent::Progress {
                downloaded_bytes,
                total_bytes,
                speed,
                active_connections,
                ..
            } => {
                let speed = format_size(speed as u64);
                match total_bytes {
                    Some(total) if total > 0 => println!(
                        "{:>6.2}%  {} / {}  {}/s  连接数: {}",
                        downloaded_bytes as f64 / total as f64 * 100.0,
                        format_size(downloaded_bytes),
                        format_size(total),
                        speed,
                        active_connections
                    ),
                    _ => println!(
                        "已下载 {}  {}/s  连接数: {}",
                        format_size(downloaded_bytes),
                        speed,
                        active_connections
                    ),
                }
            }
            DownloadEvent::Complete {
                elapsed,
                total_bytes,
                ..
            } => println!(
                "下载完成: {}，用时 {:.2}s",
                format_size(total_bytes),
                elapsed.as_secs_f64()
            ),
            DownloadEvent::Error { error, .. } => eprintln!("下载失败: {}", error),
        }
    }
}

async fn run_server(mut config: AppConfig, args: ServerArgs) -> anyhow::Result<()> {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    info!("Surge v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(config)?;
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("监听 {} 失败", addr))?;

    server::serve(listener, state, async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    })
    .await?;

    info!("应用已安全退出");
    Ok(())
}
