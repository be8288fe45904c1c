//! 目标文件路径解析

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// 无法推断文件名时使用的默认名
pub const FALLBACK_FILE_NAME: &str = "download.bin";

fn disposition_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        // filename*=UTF-8''xxx 优先，其次 filename="xxx" / filename=xxx
        Regex::new(r#"(?i)filename\*\s*=\s*(?:[\w-]+)?'[^']*'([^;]+)|filename\s*=\s*"([^"]*)"|filename\s*=\s*([^;]+)"#)
            .ok()
    })
    .as_ref()
}

/// 从 Content-Disposition 中提取文件名
pub fn parse_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    for caps in disposition_regex()?.captures_iter(header) {
        if let Some(encoded) = caps.get(1) {
            if let Ok(decoded) = urlencoding::decode(encoded.as_str().trim()) {
                return sanitize(&decoded);
            }
        }
        if plain.is_none() {
            plain = caps
                .get(2)
                .or_else(|| caps.get(3))
                .and_then(|m| sanitize(m.as_str().trim()));
        }
    }
    plain
}

/// 从 URL 最后一段路径推断文件名（百分号解码）
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = urlencoding::decode(segment).ok()?;
    sanitize(&decoded)
}

/// 去掉路径分隔符和首尾空白，拒绝 "." / ".."
fn sanitize(name: &str) -> Option<String> {
    let name: String = name
        .trim()
        .trim_matches('"')
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    match name.as_str() {
        "" | "." | ".." => None,
        _ => Some(name),
    }
}

/// 目标是否被当作目录：已存在的目录，或以路径分隔符结尾
pub fn is_directory_target(destination: &Path) -> bool {
    if destination.is_dir() {
        return true;
    }
    let raw = destination.as_os_str().to_string_lossy();
    raw.ends_with('/') || raw.ends_with(std::path::MAIN_SEPARATOR)
}

/// 解析最终写入的文件路径
///
/// 目标是目录时，依次尝试服务器提供的文件名、URL 中的文件名、默认文件名
pub fn resolve_destination(destination: &Path, url: &str, disposition: Option<&str>) -> PathBuf {
    if !is_directory_target(destination) {
        return destination.to_path_buf();
    }

    let name = disposition
        .and_then(parse_content_disposition)
        .or_else(|| file_name_from_url(url))
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());

    destination.join(name)
}
