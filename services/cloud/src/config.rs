//! 配置模块职责：
//! 1. 解析认证文件与规格缓存的本地路径，支持环境变量覆盖。
//! 2. 提供属性访问节流间隔等运行参数的读取与默认值。
//! 3. 路径目录在首次写入时创建，这里只负责定位。

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// 认证文件路径环境变量。
const AUTH_PATH_ENV: &str = "MJC_AUTH_PATH";
/// 规格缓存目录环境变量。
const SPEC_CACHE_DIR_ENV: &str = "MJC_SPEC_CACHE_DIR";
/// 属性访问节流毫秒数环境变量。
const PACING_MS_ENV: &str = "MJC_PACING_MS";
/// 默认节流间隔（毫秒）。远端属性缓存是最终一致的，
/// 调用后立即回读会拿到旧值，这个间隔是正确性要求而非限流礼让。
const DEFAULT_PACING_MS: u64 = 500;
/// 默认认证文件名。
const AUTH_FILE_NAME: &str = "auth.json";

/// 配置根目录：`~/.config/mijiaconnector/cloud`。
pub fn config_dir() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    if home.trim().is_empty() {
        return None;
    }
    Some(
        Path::new(&home)
            .join(".config")
            .join("mijiaconnector")
            .join("cloud"),
    )
}

/// 解析认证文件路径：显式参数 > 环境变量 > 默认位置。
/// 传入目录时自动补全默认文件名。
pub fn resolve_auth_path(explicit: Option<&str>) -> Option<PathBuf> {
    let raw = explicit
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| {
            std::env::var(AUTH_PATH_ENV)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        });

    let path = match raw {
        Some(value) => PathBuf::from(value),
        None => config_dir()?.join(AUTH_FILE_NAME),
    };
    if path.is_dir() {
        return Some(path.join(AUTH_FILE_NAME));
    }
    Some(path)
}

/// 规格缓存目录：环境变量覆盖，默认 `<config_dir>/specs`。
pub fn spec_cache_dir() -> Option<PathBuf> {
    if let Ok(raw) = std::env::var(SPEC_CACHE_DIR_ENV) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    Some(config_dir()?.join("specs"))
}

/// 属性访问节流间隔，非法值回退默认毫秒数。
pub fn pacing_interval() -> Duration {
    duration_from_env_millis(PACING_MS_ENV, DEFAULT_PACING_MS)
}

/// 读取毫秒级时长配置，非法值回退到默认毫秒数。
fn duration_from_env_millis(key: &str, fallback_ms: u64) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(fallback_ms))
}
