//! 日志初始化
//!
//! 控制台输出到 stderr（stdout 留给进度输出），可选写入按大小滚动的日志文件，
//! 启动时清理超过保留天数的旧日志

use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LogConfig;

/// 日志文件名前缀：surge.<启动时间>[_N].log
const LOG_FILE_PREFIX: &str = "surge.";
const LOG_FILE_SUFFIX: &str = ".log";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 当前正在写入的日志文件
struct RollingFile {
    /// 启动时间戳（YYYY-MM-DD-HHMMSS），同一次运行的文件共用
    start_timestamp: String,
    log_dir: PathBuf,
    file: File,
    /// 滚动序号，0 为第一个文件
    index: u32,
    max_file_size: u64,
    written: u64,
}

impl RollingFile {
    fn open(log_dir: PathBuf, start_timestamp: String, max_file_size: u64) -> io::Result<Self> {
        let path = file_path(&log_dir, &start_timestamp, 0);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            start_timestamp,
            log_dir,
            file,
            index: 0,
            max_file_size,
            written: 0,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.index += 1;
        let path = file_path(&self.log_dir, &self.start_timestamp, self.index);
        self.file = OpenOptions::new().create(true).append(true).open(path)?;
        self.written = 0;
        Ok(())
    }

    fn write_line(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件不滚动，避免单行超过上限时无限创建新文件
        if self.written > 0 && self.written + buf.len() as u64 > self.max_file_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }
}

fn file_path(log_dir: &Path, start_timestamp: &str, index: u32) -> PathBuf {
    let name = if index == 0 {
        format!("{}{}{}", LOG_FILE_PREFIX, start_timestamp, LOG_FILE_SUFFIX)
    } else {
        format!(
            "{}{}_{}{}",
            LOG_FILE_PREFIX, start_timestamp, index, LOG_FILE_SUFFIX
        )
    };
    log_dir.join(name)
}

/// 按大小滚动的日志文件写入器
#[derive(Clone)]
pub struct LogFileManager {
    inner: Arc<Mutex<RollingFile>>,
}

impl LogFileManager {
    pub fn new(log_dir: PathBuf, max_file_size: u64) -> io::Result<Self> {
        let start_timestamp = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let file = RollingFile::open(log_dir, start_timestamp, max_file_size.max(1))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

impl Write for LogFileManager {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_line(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().file.flush()
    }
}

/// 日志系统守卫，需要保持存活直到程序结束，否则文件日志会丢失
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 过滤规则：RUST_LOG 优先；`verbose` 时为 debug；否则使用配置的级别
fn build_filter(config: &LogConfig, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { config.level.as_str() };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// 初始化日志系统
///
/// 重复初始化（例如测试中）时忽略后一次
pub fn init_logging(config: &LogConfig, verbose: bool) -> LogGuard {
    let console_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(verbose)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .boxed();

    let (file_layer, file_guard) = if config.enabled {
        match open_log_file(config) {
            Ok(manager) => {
                let (writer, guard) = tracing_appender::non_blocking(manager);
                let layer = fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                    .boxed();
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!(
                    "创建日志文件失败: {:?}, 错误: {}，仅输出到控制台",
                    config.log_dir, e
                );
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![console_layer];
    layers.extend(file_layer);

    let initialized = tracing_subscriber::registry()
        .with(layers)
        .with(build_filter(config, verbose))
        .try_init()
        .is_ok();

    if initialized && file_guard.is_some() {
        info!(
            "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
            config.log_dir,
            config.retention_days,
            config.level,
            config.max_file_size as f64 / 1024.0 / 1024.0
        );
        cleanup_old_logs(&config.log_dir, config.retention_days);
    }

    LogGuard {
        _file_guard: file_guard,
    }
}

fn open_log_file(config: &LogConfig) -> io::Result<LogFileManager> {
    fs::create_dir_all(&config.log_dir)?;
    LogFileManager::new(config.log_dir.clone(), config.max_file_size)
}

/// 清理过期日志文件，返回删除数量
///
/// 日期取自文件名；文件名无法解析时按修改时间判断
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut deleted = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !path.is_file() || !name.starts_with(LOG_FILE_PREFIX) || !name.ends_with(LOG_FILE_SUFFIX)
        {
            continue;
        }

        let expired = match date_from_file_name(name) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => modified_before(&entry, retention),
        };

        if expired {
            match fs::remove_file(&path) {
                Ok(()) => {
                    deleted += 1;
                    debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }

    if deleted > 0 {
        info!("已清理 {} 个过期日志文件", deleted);
    }
    deleted
}

/// surge.YYYY-MM-DD-HHMMSS[_N].log -> YYYY-MM-DD
fn date_from_file_name(name: &str) -> Option<chrono::NaiveDate> {
    let stem = name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let date = stem.get(..10)?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn modified_before(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    entry
        .metadata()
        .and_then(|m| m.modified())
        .map(|modified| {
            let modified: chrono::DateTime<chrono::Utc> = modified.into();
            chrono::Utc::now().signed_duration_since(modified) > retention
        })
        .unwrap_or(false)
}
