//! 配置管理
//!
//! 从 YAML 文件加载插件目录、回收策略和日志配置

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::artifact::{ArtifactError, TrashPolicy};

/// 回收目录配置为该值时直接删除文件
pub const TRASH_DELETE: &str = "delete";

/// 默认数据目录: <data_dir>/plugin-depot
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("plugin-depot")
}

/// 默认配置文件路径: <config_dir>/plugin-depot/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("plugin-depot")
        .join("config.yaml")
}

/// 插件目录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// 上传目录（可替换的插件）
    #[serde(default = "default_upload_dir")]
    pub upload: PathBuf,
    /// 只读加载目录
    #[serde(default)]
    pub load: Vec<PathBuf>,
    /// 回收目录，设为 "delete" 时直接删除
    #[serde(default = "default_trash_dir")]
    pub trash: PathBuf,
}

fn default_upload_dir() -> PathBuf {
    default_data_dir().join("plugins")
}

fn default_trash_dir() -> PathBuf {
    default_data_dir().join("trash")
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            upload: default_upload_dir(),
            load: Vec::new(),
            trash: default_trash_dir(),
        }
    }
}

impl DirectoryConfig {
    pub fn trash_policy(&self) -> TrashPolicy {
        if self.trash.as_os_str() == TRASH_DELETE {
            TrashPolicy::Delete
        } else {
            TrashPolicy::Move(self.trash.clone())
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 是否写入日志文件
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 日志级别 (trace/debug/info/warn/error)
    #[serde(default = "default_level")]
    pub level: String,
    /// 日志保留天数
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// 内存中保留的日志条数
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// 日志文件路径，未设置时使用数据目录下的 logs/depot.log
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

fn default_retention_days() -> u32 {
    7
}

fn default_max_entries() -> usize {
    1000
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_level(),
            retention_days: default_retention_days(),
            max_entries: default_max_entries(),
            file: None,
        }
    }
}

impl LoggingConfig {
    pub fn log_file(&self) -> PathBuf {
        self.file
            .clone()
            .unwrap_or_else(|| default_data_dir().join("logs").join("depot.log"))
    }
}

/// 顶层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepotConfig {
    #[serde(default)]
    pub directories: DirectoryConfig,
    /// 插件文件扩展名
    #[serde(default = "default_extension")]
    pub artifact_extension: String,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_extension() -> String {
    "zip".to_string()
}

impl Default for DepotConfig {
    fn default() -> Self {
        Self {
            directories: DirectoryConfig::default(),
            artifact_extension: default_extension(),
            logging: LoggingConfig::default(),
        }
    }
}

impl DepotConfig {
    /// 从 YAML 文件加载配置
    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ArtifactError::Config(format!("无法读取配置文件 {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// 加载配置文件，文件不存在时使用默认配置
    pub fn load_or_default(path: &Path) -> Result<Self, ArtifactError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("[CONFIG] 配置文件 {} 不存在，使用默认配置", path.display());
            Ok(Self::default())
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, ArtifactError> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| ArtifactError::Config(format!("配置解析失败: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 所有目录都放到同一个根目录下
    pub fn with_root(root: &Path) -> Self {
        Self {
            directories: DirectoryConfig {
                upload: root.join("plugins"),
                load: Vec::new(),
                trash: root.join("trash"),
            },
            artifact_extension: default_extension(),
            logging: LoggingConfig {
                file: Some(root.join("logs").join("depot.log")),
                ..LoggingConfig::default()
            },
        }
    }

    /// 验证配置
    pub fn validate(&self) -> Result<(), ArtifactError> {
        let extension = self.artifact_extension.trim_start_matches('.');
        if extension.is_empty() || extension.contains(|c: char| c == '/' || c == '\\') {
            return Err(ArtifactError::Config(format!(
                "无效的插件扩展名: {:?}",
                self.artifact_extension
            )));
        }
        if self.directories.upload.as_os_str().is_empty() {
            return Err(ArtifactError::Config("上传目录不能为空".to_string()));
        }
        if let TrashPolicy::Move(trash) = self.directories.trash_policy() {
            if trash == self.directories.upload {
                return Err(ArtifactError::Config(
                    "回收目录不能与上传目录相同".to_string(),
                ));
            }
        }
        if self.directories.load.contains(&self.directories.upload) {
            return Err(ArtifactError::Config(
                "上传目录不能同时作为只读加载目录".to_string(),
            ));
        }
        Ok(())
    }
}
