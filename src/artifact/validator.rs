//! 插件包校验器
//!
//! 主要功能：
//! - 从上传的原始字节中提取 ID 和版本（不落盘、不修改状态）
//! - 从已持久化的文件中解析完整的插件定义

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::Path;

use sha2::{Digest, Sha256};

use super::manifest::{ArtifactManifest, MANIFEST_FILE};
use super::types::{ArtifactError, ArtifactMeta};

/// 校验器接口
///
/// 协调器只通过该接口访问插件包内容，便于替换为其他格式
pub trait ArtifactValidator: Send + Sync {
    /// 从原始字节中提取元数据
    fn verify_meta(&self, bytes: &[u8]) -> Result<ArtifactMeta, ArtifactError>;

    /// 从已持久化的文件解析完整定义
    fn load_definition(&self, location: &Path) -> Result<ArtifactManifest, ArtifactError>;
}

/// ZIP 插件包校验器
///
/// 压缩包根目录必须包含 plugin.yaml
pub struct ZipArtifactValidator;

impl ZipArtifactValidator {
    pub fn new() -> Self {
        Self
    }

    fn open_archive<R: Read + Seek>(reader: R) -> Result<zip::ZipArchive<R>, ArtifactError> {
        let archive = zip::ZipArchive::new(reader).map_err(|e| {
            ArtifactError::invalid_with_trace("无法读取 ZIP 文件", e.to_string())
        })?;
        if archive.len() == 0 {
            return Err(ArtifactError::invalid("ZIP 压缩包为空"));
        }
        Ok(archive)
    }

    fn read_manifest<R: Read + Seek>(
        archive: &mut zip::ZipArchive<R>,
    ) -> Result<ArtifactManifest, ArtifactError> {
        let mut file = match archive.by_name(MANIFEST_FILE) {
            Ok(file) => file,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(ArtifactError::invalid(format!(
                    "压缩包中未找到 {}",
                    MANIFEST_FILE
                )))
            }
            Err(e) => {
                return Err(ArtifactError::invalid_with_trace(
                    format!("无法读取 {}", MANIFEST_FILE),
                    e.to_string(),
                ))
            }
        };

        let mut content = String::new();
        file.read_to_string(&mut content).map_err(|e| {
            ArtifactError::invalid_with_trace(format!("无法读取 {}", MANIFEST_FILE), e.to_string())
        })?;
        ArtifactManifest::parse(&content)
    }

    /// 检查清单引用的模块和附加文件是否都在压缩包中
    fn check_contents<R: Read + Seek>(
        archive: &zip::ZipArchive<R>,
        manifest: &ArtifactManifest,
    ) -> Result<(), ArtifactError> {
        let names: HashSet<&str> = archive.file_names().collect();
        let has_entry = |entry: &str| {
            let entry = entry.trim_end_matches('/');
            names.contains(entry)
                || names
                    .iter()
                    .any(|name| name.starts_with(entry) && name[entry.len()..].starts_with('/'))
        };

        for module in &manifest.modules {
            if !has_entry(module) {
                return Err(ArtifactError::invalid(format!(
                    "压缩包中缺少模块: {}",
                    module
                )));
            }
        }
        for extra in &manifest.extra_files {
            if !has_entry(extra) {
                return Err(ArtifactError::invalid(format!(
                    "压缩包中缺少附加文件: {}",
                    extra
                )));
            }
        }
        Ok(())
    }
}

impl Default for ZipArtifactValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactValidator for ZipArtifactValidator {
    fn verify_meta(&self, bytes: &[u8]) -> Result<ArtifactMeta, ArtifactError> {
        if bytes.is_empty() {
            return Err(ArtifactError::invalid("上传内容为空"));
        }
        let mut archive = Self::open_archive(Cursor::new(bytes))?;
        let manifest = Self::read_manifest(&mut archive)?;
        manifest.validate_meta()?;
        Ok(manifest.meta())
    }

    fn load_definition(&self, location: &Path) -> Result<ArtifactManifest, ArtifactError> {
        let file = File::open(location).map_err(|e| {
            ArtifactError::invalid_with_trace(
                format!("无法打开插件文件: {}", location.display()),
                e.to_string(),
            )
        })?;
        let mut archive = Self::open_archive(BufReader::new(file))?;
        let manifest = Self::read_manifest(&mut archive)?;
        manifest.validate_definition()?;
        Self::check_contents(&archive, &manifest)?;
        Ok(manifest)
    }
}

/// 计算 SHA-256 摘要（十六进制）
pub fn digest_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// 计算文件的 SHA-256 摘要
pub fn digest_file(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::{Cursor, Write};

    /// 构造插件包字节
    pub fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, content) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    pub fn manifest_yaml(id: &str, version: &str) -> String {
        format!(
            "id: {}\nversion: \"{}\"\nmain_class: Bot\nmodules: [bot]\n",
            id, version
        )
    }

    /// 完整有效的插件包
    pub fn valid_artifact(id: &str, version: &str) -> Vec<u8> {
        let manifest = manifest_yaml(id, version);
        build_zip(&[("plugin.yaml", &manifest), ("bot/__init__.py", "class Bot: pass\n")])
    }

    /// 元数据有效但缺少模块，只有完整解析时才会失败
    pub fn broken_artifact(id: &str, version: &str) -> Vec<u8> {
        let manifest = manifest_yaml(id, version);
        build_zip(&[("plugin.yaml", &manifest), ("readme.txt", "no module here")])
    }
}
