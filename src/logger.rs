//! 日志管理模块
//!
//! - init_tracing: 安装 tracing-subscriber 输出
//! - LogStore: 插件生命周期事件的内存环形日志，可选写入文件（按大小轮转、按天清理）
use chrono::{Duration, Local, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

#[derive(Debug, Clone)]
pub struct LogStoreConfig {
    pub max_logs: usize,
    pub retention_days: u32,
    pub max_file_size: u64,
    pub enable_file_logging: bool,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            max_logs: 1000,
            retention_days: 7,
            max_file_size: 10 * 1024 * 1024,
            enable_file_logging: false,
        }
    }
}

impl From<&LoggingConfig> for LogStoreConfig {
    fn from(logging: &LoggingConfig) -> Self {
        Self {
            max_logs: logging.max_entries.max(1),
            retention_days: logging.retention_days,
            enable_file_logging: logging.enabled,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

pub struct LogStore {
    logs: VecDeque<LogEntry>,
    config: LogStoreConfig,
    log_file_path: Option<PathBuf>,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::with_store_config(LogStoreConfig::default(), None)
    }
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(logging: &LoggingConfig) -> Self {
        let path = logging.enabled.then(|| logging.log_file());
        Self::with_store_config(LogStoreConfig::from(logging), path)
    }

    pub fn with_store_config(config: LogStoreConfig, log_file_path: Option<PathBuf>) -> Self {
        if let Some(dir) = log_file_path.as_deref().and_then(Path::parent) {
            if let Err(e) = fs::create_dir_all(dir) {
                tracing::warn!("[LOGGER] 无法创建日志目录 {}: {}", dir.display(), e);
            }
        }
        Self {
            logs: VecDeque::new(),
            config,
            log_file_path,
        }
    }

    pub fn add(&mut self, level: &str, message: &str) {
        let sanitized = sanitize_log_message(message);
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            message: sanitized.clone(),
        };

        self.logs.push_back(entry);

        // 写入日志文件
        if self.config.enable_file_logging {
            if let Some(ref path) = self.log_file_path {
                self.rotate_log_file_if_needed(path);
                let local_time = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                let log_line = format!("{} [{}] {}\n", local_time, level.to_uppercase(), sanitized);

                if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
                    let _ = file.write_all(log_line.as_bytes());
                }
            }
        }

        // 保持日志数量在限制内
        while self.logs.len() > self.config.max_logs {
            self.logs.pop_front();
        }
    }

    pub fn info(&mut self, message: &str) {
        self.add("info", message);
    }

    pub fn warn(&mut self, message: &str) {
        self.add("warn", message);
    }

    pub fn error(&mut self, message: &str) {
        self.add("error", message);
    }

    pub fn get_logs(&self) -> Vec<LogEntry> {
        self.logs.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.logs.clear();
    }

    pub fn get_log_file_path(&self) -> Option<String> {
        self.log_file_path
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
    }

    fn rotate_log_file_if_needed(&self, path: &Path) {
        let Ok(metadata) = fs::metadata(path) else {
            return;
        };

        if metadata.len() <= self.config.max_file_size {
            return;
        }

        let suffix = Local::now().format("%Y%m%d-%H%M%S%.3f");
        let rotated = path.with_file_name(format!(
            "{}.{}",
            path.file_name().unwrap_or_default().to_string_lossy(),
            suffix
        ));

        let _ = fs::rename(path, &rotated);
        self.prune_old_logs(path);
    }

    fn prune_old_logs(&self, path: &Path) {
        let Some(dir) = path.parent() else {
            return;
        };
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        let cutoff = Utc::now() - Duration::days(self.config.retention_days as i64);
        let prefix = format!(
            "{}.",
            path.file_name().unwrap_or_default().to_string_lossy()
        );

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if !file_name.starts_with(&prefix) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };
            let modified = chrono::DateTime::<Utc>::from(modified);
            if modified < cutoff {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

pub type SharedLogStore = Arc<RwLock<LogStore>>;

pub fn shared(store: LogStore) -> SharedLogStore {
    Arc::new(RwLock::new(store))
}

/// 安装全局 tracing 输出
///
/// 级别优先取 RUST_LOG，其次取配置。重复调用时保留已安装的订阅者。
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("[LOGGER] tracing 订阅者已存在，跳过初始化");
    }
}

/// 日志脱敏：插件配置和错误信息中可能带有凭据
pub fn sanitize_log_message(message: &str) -> String {
    let patterns = [
        (r"Bearer\s+[A-Za-z0-9._-]+", "Bearer ***"),
        (
            r#"api[_-]?key["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#,
            "api_key: ***",
        ),
        (r#"token["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#, "token: ***"),
        (r#"password["']?\s*[:=]\s*["']?[^\s"',}]+"#, "password: ***"),
        (
            r#"secret["']?\s*[:=]\s*["']?[A-Za-z0-9._-]+"#,
            "secret: ***",
        ),
    ];

    let mut sanitized = message.to_string();
    for (pattern, replacement) in patterns {
        if let Ok(re) = Regex::new(pattern) {
            sanitized = re.replace_all(&sanitized, replacement).to_string();
        }
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_bearer_token() {
        let input = "Authorization: Bearer abcDEF123._-XYZ";
        let output = sanitize_log_message(input);
        assert!(!output.contains("abcDEF123"));
        assert!(output.contains("***"));
    }

    #[test]
    fn test_sanitize_password() {
        let input = r#"{"password":"p@ssW0rd!"}"#;
        let output = sanitize_log_message(input);
        assert!(output.contains("password: ***"));
        assert!(!output.contains("p@ssW0rd!"));
    }

    #[test]
    fn test_plain_text_unchanged() {
        let input = "插件 com.example.echo 已从 1.0.0 替换为 1.1.0";
        assert_eq!(sanitize_log_message(input), input);
    }

    #[test]
    fn test_ring_is_bounded() {
        let config = LogStoreConfig {
            max_logs: 3,
            ..LogStoreConfig::default()
        };
        let mut store = LogStore::with_store_config(config, None);
        for i in 0..5 {
            store.info(&format!("entry {}", i));
        }
        let logs = store.get_logs();
        assert_eq!(logs.len(), 3);
        assert_eq!(logs[0].message, "entry 2");
        assert_eq!(logs[2].level, "info");

        store.clear();
        assert!(store.get_logs().is_empty());
    }

    #[test]
    fn test_file_logging_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("depot.log");
        let config = LogStoreConfig {
            enable_file_logging: true,
            ..LogStoreConfig::default()
        };
        let mut store = LogStore::with_store_config(config, Some(path.clone()));
        store.warn("回收失败");
        store.error("插件无法加载");

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("[WARN] 回收失败"));
        assert!(content.contains("[ERROR] 插件无法加载"));
        assert_eq!(store.get_log_file_path(), Some(path.to_string_lossy().to_string()));
    }

    #[test]
    fn test_file_rotation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("depot.log");
        let config = LogStoreConfig {
            enable_file_logging: true,
            max_file_size: 16,
            ..LogStoreConfig::default()
        };
        let mut store = LogStore::with_store_config(config, Some(path.clone()));
        store.info("first entry long enough to exceed the limit");
        store.info("second");

        let rotated = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("depot.log."))
            .count();
        assert_eq!(rotated, 1);
        assert!(fs::read_to_string(&path).unwrap().contains("second"));
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            ..LoggingConfig::default()
        };
        init_tracing(&logging);
        init_tracing(&logging);
        tracing::debug!("[LOGGER] 测试");
    }

    #[test]
    fn test_with_config_disabled_has_no_file() {
        let logging = LoggingConfig {
            enabled: false,
            max_entries: 10,
            ..LoggingConfig::default()
        };
        let store = LogStore::with_config(&logging);
        assert!(store.get_log_file_path().is_none());
    }
}
