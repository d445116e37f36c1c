//! 插件包类型定义
//!
//! 定义插件包相关的错误类型、进度类型和数据结构

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::manifest::ArtifactManifest;

/// 插件包错误类型
#[derive(Error, Debug)]
pub enum ArtifactError {
    /// 插件包结构或元数据无效，或持久化后重新解析失败
    #[error("插件包无效: {message}")]
    InvalidArtifact {
        message: String,
        /// 供运维排查的详细信息
        trace: Option<String>,
    },

    /// 写入持久化存储失败
    #[error("写入插件文件失败: {}: {source}", .path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 插件不存在
    #[error("插件不存在: {0}")]
    NotFound(String),

    /// 插件仍有实例在使用
    #[error("插件正在使用中: {id} 仍绑定 {instances} 个实例")]
    InUse { id: String, instances: usize },

    /// 插件来源不支持替换（只读目录加载）
    #[error("插件不支持该操作: {0} 来自只读目录")]
    Unsupported(String),

    /// 实例启动/停止失败
    #[error("插件实例操作失败: {id} - {message}")]
    InstanceFailure { id: String, message: String },

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),
}

impl ArtifactError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArtifact {
            message: message.into(),
            trace: None,
        }
    }

    pub fn invalid_with_trace(message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self::InvalidArtifact {
            message: message.into(),
            trace: Some(trace.into()),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoFailure {
            path: path.into(),
            source,
        }
    }

    /// 追加排查信息（仅对 InvalidArtifact 生效）
    pub fn with_note(self, note: impl AsRef<str>) -> Self {
        match self {
            Self::InvalidArtifact { message, trace } => {
                let trace = match trace {
                    Some(existing) => format!("{}\n{}", existing, note.as_ref()),
                    None => note.as_ref().to_string(),
                };
                Self::InvalidArtifact {
                    message,
                    trace: Some(trace),
                }
            }
            other => other,
        }
    }

    /// 机器可读的错误码
    pub fn errcode(&self) -> &'static str {
        match self {
            Self::InvalidArtifact { .. } => "plugin_invalid",
            Self::IoFailure { .. } => "io_failure",
            Self::NotFound(_) => "plugin_not_found",
            Self::InUse { .. } => "plugin_in_use",
            Self::Unsupported(_) => "unsupported_plugin_loader",
            Self::InstanceFailure { .. } => "instance_failure",
            Self::Config(_) => "config_error",
        }
    }

    pub fn trace(&self) -> Option<&str> {
        match self {
            Self::InvalidArtifact { trace, .. } => trace.as_deref(),
            _ => None,
        }
    }
}

/// 插件包元数据
///
/// 校验器从原始字节中提取的最小信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub id: String,
    pub version: String,
}

/// 实例句柄
///
/// 插件只持有实例的引用，不拥有实例
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// 生成随机实例 ID
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 插件状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ArtifactStatus {
    /// 正常
    #[default]
    Active,
    /// 回滚或重载失败：已注册但无法启动
    Degraded { reason: String },
}

impl ArtifactStatus {
    pub fn is_degraded(&self) -> bool {
        matches!(self, ArtifactStatus::Degraded { .. })
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactStatus::Active => write!(f, "active"),
            ArtifactStatus::Degraded { .. } => write!(f, "degraded"),
        }
    }
}

/// 已注册插件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// 插件 ID（跨版本不变）
    pub id: String,
    /// 版本
    pub version: String,
    /// 当前版本的文件路径
    pub location: PathBuf,
    /// 完整清单
    pub manifest: ArtifactManifest,
    /// 绑定的实例
    pub instances: BTreeSet<InstanceId>,
    /// 是否支持原地替换
    pub supports_replacement: bool,
    /// 状态
    pub status: ArtifactStatus,
    /// 文件 SHA-256
    pub digest: String,
    /// 首次安装时间
    pub installed_at: DateTime<Utc>,
    /// 最近一次激活时间
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    /// 由解析好的清单创建插件
    pub fn new(manifest: ArtifactManifest, location: PathBuf, digest: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: manifest.id.clone(),
            version: manifest.version.clone(),
            location,
            manifest,
            instances: BTreeSet::new(),
            supports_replacement: true,
            status: ArtifactStatus::Active,
            digest: digest.into(),
            installed_at: now,
            updated_at: now,
        }
    }

    /// 设置是否支持替换
    pub fn with_replacement(mut self, supports_replacement: bool) -> Self {
        self.supports_replacement = supports_replacement;
        self
    }

    /// 绑定到新的文件和清单，保留实例集合
    pub fn rebind(&self, manifest: ArtifactManifest, location: PathBuf, digest: &str) -> Self {
        Self {
            id: self.id.clone(),
            version: manifest.version.clone(),
            location,
            manifest,
            instances: self.instances.clone(),
            supports_replacement: self.supports_replacement,
            status: ArtifactStatus::Active,
            digest: digest.to_string(),
            installed_at: self.installed_at,
            updated_at: Utc::now(),
        }
    }

    pub fn is_in_use(&self) -> bool {
        !self.instances.is_empty()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.location.file_name().and_then(|n| n.to_str())
    }

    pub fn location(&self) -> &Path {
        &self.location
    }
}

/// 安装结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallOutcome {
    /// 新安装
    Installed,
    /// 替换了已有版本
    Replaced,
}

/// 上传被接受
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Accepted {
    pub outcome: InstallOutcome,
    /// 被替换的版本
    pub previous_version: Option<String>,
    pub artifact: Artifact,
}

/// 删除完成
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deleted {
    pub id: String,
    /// 进入回收区后的路径（删除策略下为 None）
    pub trashed_to: Option<PathBuf>,
}

/// 替换流程阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplaceStage {
    /// 校验中
    Validating,
    /// 写入中
    Persisting,
    /// 停止实例
    Stopping,
    /// 激活新版本
    Activating,
    /// 启动实例
    Starting,
    /// 回退到旧版本
    Reverting,
    /// 回退后重启实例
    Restarting,
    /// 完成
    Complete,
    /// 失败
    Failed,
}

impl fmt::Display for ReplaceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplaceStage::Validating => write!(f, "validating"),
            ReplaceStage::Persisting => write!(f, "persisting"),
            ReplaceStage::Stopping => write!(f, "stopping"),
            ReplaceStage::Activating => write!(f, "activating"),
            ReplaceStage::Starting => write!(f, "starting"),
            ReplaceStage::Reverting => write!(f, "reverting"),
            ReplaceStage::Restarting => write!(f, "restarting"),
            ReplaceStage::Complete => write!(f, "complete"),
            ReplaceStage::Failed => write!(f, "failed"),
        }
    }
}

/// 替换进度
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaceProgress {
    /// 当前阶段
    pub stage: ReplaceStage,
    /// 进度百分比 (0-100)
    pub percent: u8,
    /// 状态消息
    pub message: String,
}

impl ReplaceProgress {
    pub fn new(stage: ReplaceStage, percent: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            percent: percent.min(100),
            message: message.into(),
        }
    }

    pub fn validating(message: impl Into<String>) -> Self {
        Self::new(ReplaceStage::Validating, 0, message)
    }

    pub fn persisting(message: impl Into<String>) -> Self {
        Self::new(ReplaceStage::Persisting, 20, message)
    }

    pub fn stopping(message: impl Into<String>) -> Self {
        Self::new(ReplaceStage::Stopping, 40, message)
    }

    pub fn activating(message: impl Into<String>) -> Self {
        Self::new(ReplaceStage::Activating, 60, message)
    }

    pub fn starting(message: impl Into<String>) -> Self {
        Self::new(ReplaceStage::Starting, 80, message)
    }

    pub fn reverting(message: impl Into<String>) -> Self {
        Self::new(ReplaceStage::Reverting, 60, message)
    }

    pub fn restarting(message: impl Into<String>) -> Self {
        Self::new(ReplaceStage::Restarting, 80, message)
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self::new(ReplaceStage::Complete, 100, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ReplaceStage::Failed, 0, message)
    }
}

/// 进度回调 trait
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, progress: ReplaceProgress);
}

/// 空进度回调实现
pub struct NoopProgressCallback;

impl ProgressCallback for NoopProgressCallback {
    fn on_progress(&self, _progress: ReplaceProgress) {}
}

/// 函数进度回调实现
///
/// 将闭包包装为 ProgressCallback
pub struct FnProgressCallback<F>
where
    F: Fn(ReplaceProgress) + Send + Sync,
{
    callback: F,
}

impl<F> FnProgressCallback<F>
where
    F: Fn(ReplaceProgress) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressCallback for FnProgressCallback<F>
where
    F: Fn(ReplaceProgress) + Send + Sync,
{
    fn on_progress(&self, progress: ReplaceProgress) {
        (self.callback)(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(id: &str, version: &str) -> ArtifactManifest {
        ArtifactManifest::minimal(id, version)
    }

    #[test]
    fn test_progress_percent_capped() {
        let progress = ReplaceProgress::new(ReplaceStage::Starting, 150, "测试");
        assert_eq!(progress.percent, 100);
        assert_eq!(progress.stage.to_string(), "starting");
    }

    #[test]
    fn test_rebind_keeps_instances_and_install_time() {
        let mut artifact = Artifact::new(manifest("demo", "1.0"), PathBuf::from("demo-v1.0.zip"), "aa");
        artifact.instances.insert(InstanceId::new("bot-1"));
        artifact.status = ArtifactStatus::Degraded {
            reason: "broken".to_string(),
        };

        let rebound = artifact.rebind(manifest("demo", "2.0"), PathBuf::from("demo-v2.0.zip"), "bb");
        assert_eq!(rebound.version, "2.0");
        assert_eq!(rebound.digest, "bb");
        assert_eq!(rebound.instances.len(), 1);
        assert_eq!(rebound.installed_at, artifact.installed_at);
        assert_eq!(rebound.status, ArtifactStatus::Active);
    }

    #[test]
    fn test_with_note_extends_trace() {
        let err = ArtifactError::invalid_with_trace("坏包", "first").with_note("second");
        assert_eq!(err.trace(), Some("first\nsecond"));

        let err = ArtifactError::NotFound("x".to_string()).with_note("ignored");
        assert!(err.trace().is_none());
        assert_eq!(err.errcode(), "plugin_not_found");
    }

    #[test]
    fn test_status_serialization() {
        let status = ArtifactStatus::Degraded {
            reason: "旧版本无法加载".to_string(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"state\":\"degraded\""));

        let parsed: ArtifactStatus = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_degraded());
    }
}
