//! 插件清单 (plugin.yaml)
//!
//! 描述插件包的 ID、版本、模块与附加文件

use serde::{Deserialize, Serialize};

use super::types::{ArtifactError, ArtifactMeta};

/// 清单文件名（位于压缩包根目录）
pub const MANIFEST_FILE: &str = "plugin.yaml";

/// 插件 ID 最大长度
pub const MAX_ID_LEN: usize = 128;

/// 插件清单
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactManifest {
    /// 插件 ID
    pub id: String,
    /// 插件版本
    pub version: String,
    /// 描述
    #[serde(default)]
    pub description: String,
    /// 许可证
    #[serde(default)]
    pub license: Option<String>,
    /// 入口类
    #[serde(default)]
    pub main_class: String,
    /// 模块列表（压缩包内的文件或目录）
    #[serde(default)]
    pub modules: Vec<String>,
    /// 附加文件
    #[serde(default)]
    pub extra_files: Vec<String>,
    /// 依赖
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// 可选依赖
    #[serde(default)]
    pub soft_dependencies: Vec<String>,
    /// 是否需要数据库
    #[serde(default)]
    pub database: bool,
    /// 是否带配置
    #[serde(default)]
    pub config: bool,
}

impl ArtifactManifest {
    /// 只有 ID 和版本的清单
    pub fn minimal(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            description: String::new(),
            license: None,
            main_class: String::new(),
            modules: Vec::new(),
            extra_files: Vec::new(),
            dependencies: Vec::new(),
            soft_dependencies: Vec::new(),
            database: false,
            config: false,
        }
    }

    /// 解析 YAML 清单
    pub fn parse(content: &str) -> Result<Self, ArtifactError> {
        serde_yaml::from_str(content).map_err(|e| {
            ArtifactError::invalid_with_trace(
                format!("{} 解析失败", MANIFEST_FILE),
                e.to_string(),
            )
        })
    }

    pub fn meta(&self) -> ArtifactMeta {
        ArtifactMeta {
            id: self.id.clone(),
            version: self.version.clone(),
        }
    }

    /// 校验 ID 与版本
    ///
    /// 两者都会出现在文件名中，因此不允许路径分隔符
    pub fn validate_meta(&self) -> Result<(), ArtifactError> {
        if self.id.is_empty() {
            return Err(ArtifactError::invalid("插件 ID (id) 不能为空"));
        }
        if self.id.len() > MAX_ID_LEN {
            return Err(ArtifactError::invalid(format!(
                "插件 ID 长度不能超过 {} 个字符",
                MAX_ID_LEN
            )));
        }
        if !is_valid_id(&self.id) {
            return Err(ArtifactError::invalid(format!(
                "插件 ID 只能包含字母、数字、点、连字符和下划线: {}",
                self.id
            )));
        }
        if self.version.is_empty() {
            return Err(ArtifactError::invalid("插件版本 (version) 不能为空"));
        }
        if !is_valid_version(&self.version) {
            return Err(ArtifactError::invalid(format!(
                "无效的版本格式: {}",
                self.version
            )));
        }
        Ok(())
    }

    /// 完整校验（加载阶段）
    pub fn validate_definition(&self) -> Result<(), ArtifactError> {
        self.validate_meta()?;
        if self.main_class.trim().is_empty() {
            return Err(ArtifactError::invalid("入口类 (main_class) 不能为空"));
        }
        if self.modules.is_empty() {
            return Err(ArtifactError::invalid("模块列表 (modules) 不能为空"));
        }
        Ok(())
    }
}

/// 验证 ID 格式
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// 验证版本格式
///
/// 版本只做等值/子串比较，这里只限制字符集
pub fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && !version.starts_with('.')
        && !version.contains("..")
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+' | '_'))
}
