//! 插件文件存储
//!
//! 负责插件包文件的持久化：
//! - persist: 先写临时文件再改名，最终路径上不会出现半写入的文件
//! - trash: 将废弃文件移入回收区（尽力而为，失败只记录日志）
//! - derive_replacement_name: 计算新版本的文件名

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::types::{ArtifactError, ArtifactMeta};

/// 目录锁文件名
const LOCK_FILE: &str = ".depot.lock";

/// 寻找空闲文件名的最大尝试次数
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// 回收策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrashPolicy {
    /// 移动到回收目录
    Move(PathBuf),
    /// 直接删除
    Delete,
}

/// 回收原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrashReason {
    /// 被新版本替换
    Update,
    /// 被显式删除
    Delete,
    /// 安装失败的残留文件
    Error,
    /// 启动扫描时 ID 冲突
    Conflict,
}

impl fmt::Display for TrashReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrashReason::Update => write!(f, "update"),
            TrashReason::Delete => write!(f, "delete"),
            TrashReason::Error => write!(f, "error"),
            TrashReason::Conflict => write!(f, "conflict"),
        }
    }
}

/// 插件文件存储
pub struct ArtifactStore {
    /// 上传目录
    upload_dir: PathBuf,
    /// 回收策略
    trash: TrashPolicy,
    /// 插件文件扩展名（不含点）
    extension: String,
    /// 目录锁，随存储一起释放
    _lock: File,
}

impl ArtifactStore {
    /// 打开存储目录
    ///
    /// 创建所需目录并对上传目录加排他锁
    pub fn open(
        upload_dir: PathBuf,
        trash: TrashPolicy,
        extension: impl Into<String>,
    ) -> Result<Self, ArtifactError> {
        fs::create_dir_all(&upload_dir).map_err(|e| ArtifactError::io(&upload_dir, e))?;
        if let TrashPolicy::Move(trash_dir) = &trash {
            fs::create_dir_all(trash_dir).map_err(|e| ArtifactError::io(trash_dir, e))?;
        }

        let lock_path = upload_dir.join(LOCK_FILE);
        let lock = File::create(&lock_path).map_err(|e| ArtifactError::io(&lock_path, e))?;
        FileExt::try_lock_exclusive(&lock).map_err(|e| {
            ArtifactError::Config(format!(
                "上传目录已被其他进程占用: {} ({})",
                upload_dir.display(),
                e
            ))
        })?;

        let extension = extension.into().trim_start_matches('.').to_string();
        tracing::debug!(
            "[STORE] 打开插件目录 {} (扩展名 .{})",
            upload_dir.display(),
            extension
        );

        Ok(Self {
            upload_dir,
            trash,
            extension,
            _lock: lock,
        })
    }

    /// 新安装插件的文件路径: <upload>/<id>-v<version>.<ext>
    pub fn fresh_location(&self, meta: &ArtifactMeta) -> PathBuf {
        self.upload_dir
            .join(format!("{}-v{}.{}", meta.id, meta.version, self.extension))
    }

    /// 写入插件文件
    ///
    /// 目标路径已存在时改用下一个空闲文件名，返回实际写入的路径
    pub fn persist(&self, candidate: &Path, bytes: &[u8]) -> Result<PathBuf, ArtifactError> {
        let dir = candidate.parent().unwrap_or(&self.upload_dir);
        fs::create_dir_all(dir).map_err(|e| ArtifactError::io(dir, e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ArtifactError::io(dir, e))?;
        tmp.write_all(bytes)
            .map_err(|e| ArtifactError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| ArtifactError::io(tmp.path(), e))?;

        let mut target = unique_location(candidate)?;
        let mut attempts = 0;
        loop {
            match tmp.persist_noclobber(&target) {
                Ok(_) => break,
                Err(err) if err.error.kind() == std::io::ErrorKind::AlreadyExists
                    && attempts < MAX_NAME_ATTEMPTS =>
                {
                    // 检查与改名之间被占用，换一个名字重试
                    attempts += 1;
                    tmp = err.file;
                    target = unique_location(candidate)?;
                }
                Err(err) => return Err(ArtifactError::io(&target, err.error)),
            }
        }

        tracing::info!("[STORE] 已写入插件文件 {} ({} 字节)", target.display(), bytes.len());
        Ok(target)
    }

    /// 回收插件文件
    ///
    /// 尽力而为：失败时只记录日志，返回 None
    pub fn trash(&self, location: &Path, reason: TrashReason) -> Option<PathBuf> {
        match self.try_trash(location, reason) {
            Ok(dest) => {
                tracing::info!("[STORE] 已回收插件文件 {} ({})", location.display(), reason);
                dest
            }
            Err(e) => {
                tracing::warn!(
                    "[STORE] 回收插件文件 {} 失败 ({}): {}",
                    location.display(),
                    reason,
                    e
                );
                None
            }
        }
    }

    fn try_trash(&self, location: &Path, reason: TrashReason) -> std::io::Result<Option<PathBuf>> {
        match &self.trash {
            TrashPolicy::Delete => {
                fs::remove_file(location)?;
                Ok(None)
            }
            TrashPolicy::Move(trash_dir) => {
                let file_name = location
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "unnamed".to_string());
                let candidate = trash_dir.join(format!(
                    "{}-{}-{}",
                    chrono::Utc::now().timestamp(),
                    reason,
                    file_name
                ));
                let dest = unique_location(&candidate).map_err(|e| match e {
                    ArtifactError::IoFailure { source, .. } => source,
                    other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
                })?;
                if fs::rename(location, &dest).is_err() {
                    // 跨设备时退化为复制后删除
                    fs::copy(location, &dest)?;
                    fs::remove_file(location)?;
                }
                Ok(Some(dest))
            }
        }
    }

    /// 列出上传目录中的插件文件（按文件名排序）
    pub fn blobs(&self) -> Result<Vec<PathBuf>, ArtifactError> {
        list_blobs(&self.upload_dir, &self.extension)
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn trash_policy(&self) -> &TrashPolicy {
        &self.trash
    }
}

/// 列出目录中指定扩展名的文件
pub fn list_blobs(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, ArtifactError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ArtifactError::io(dir, e)),
    };

    let mut blobs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ArtifactError::io(dir, e))?;
        let path = entry.path();
        let matches_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == extension);
        if path.is_file() && matches_ext {
            blobs.push(path);
        }
    }
    blobs.sort();
    Ok(blobs)
}

/// 计算新版本的文件名
///
/// 旧文件名（不含扩展名）中包含旧版本号时替换最后一处，
/// 否则在扩展名前追加 `-v<new_version>`
pub fn derive_replacement_name(old_location: &Path, old_version: &str, new_version: &str) -> PathBuf {
    let stem = old_location
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = old_location
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let new_stem = match (old_version.is_empty(), stem.rfind(old_version)) {
        (false, Some(pos)) => format!(
            "{}{}{}",
            &stem[..pos],
            new_version,
            &stem[pos + old_version.len()..]
        ),
        _ => format!("{}-v{}", stem, new_version),
    };

    old_location.with_file_name(format!("{}{}", new_stem, extension))
}

/// 返回不与现有文件冲突的路径: <stem>.<ext>, <stem>-1.<ext>, <stem>-2.<ext> ...
fn unique_location(candidate: &Path) -> Result<PathBuf, ArtifactError> {
    if !candidate.exists() {
        return Ok(candidate.to_path_buf());
    }

    let stem = candidate
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let extension = candidate
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for n in 1..=MAX_NAME_ATTEMPTS {
        let next = candidate.with_file_name(format!("{}-{}{}", stem, n, extension));
        if !next.exists() {
            return Ok(next);
        }
    }

    Err(ArtifactError::io(
        candidate,
        std::io::Error::new(std::io::ErrorKind::AlreadyExists, "没有可用的文件名"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> ArtifactStore {
        ArtifactStore::open(
            dir.path().join("upload"),
            TrashPolicy::Move(dir.path().join("trash")),
            "zip",
        )
        .unwrap()
    }

    fn meta(id: &str, version: &str) -> ArtifactMeta {
        ArtifactMeta {
            id: id.to_string(),
            version: version.to_string(),
        }
    }

    #[test]
    fn test_fresh_location() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let location = store.fresh_location(&meta("com.example.echo", "1.0.0"));
        assert_eq!(
            location,
            dir.path().join("upload").join("com.example.echo-v1.0.0.zip")
        );
    }

    #[test]
    fn test_persist_writes_file_without_leftovers() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let candidate = store.fresh_location(&meta("demo", "1.0"));

        let written = store.persist(&candidate, b"payload").unwrap();
        assert_eq!(written, candidate);
        assert_eq!(fs::read(&written).unwrap(), b"payload");

        // 只剩锁文件和插件文件
        let names: Vec<String> = fs::read_dir(store.upload_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 2, "unexpected files: {:?}", names);
        assert_eq!(store.blobs().unwrap(), vec![candidate]);
    }

    #[test]
    fn test_persist_never_clobbers_existing_file() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let candidate = store.fresh_location(&meta("demo", "1.0"));

        let first = store.persist(&candidate, b"old").unwrap();
        let second = store.persist(&candidate, b"new").unwrap();

        assert_ne!(first, second);
        assert_eq!(second, dir.path().join("upload").join("demo-v1.0-1.zip"));
        assert_eq!(fs::read(&first).unwrap(), b"old");
        assert_eq!(fs::read(&second).unwrap(), b"new");
    }

    #[test]
    fn test_persist_into_missing_directory_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        // 父路径是普通文件，无法创建目录
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();

        let result = store.persist(&blocker.join("demo-v1.0.zip"), b"payload");
        assert!(matches!(result, Err(ArtifactError::IoFailure { .. })));
    }

    #[test]
    fn test_trash_moves_with_reason() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let location = store
            .persist(&store.fresh_location(&meta("demo", "1.0")), b"payload")
            .unwrap();

        let dest = store.trash(&location, TrashReason::Update).unwrap();
        assert!(!location.exists());
        assert!(dest.exists());
        let name = dest.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("-update-demo-v1.0.zip"), "got {}", name);
    }

    #[test]
    fn test_trash_delete_policy() {
        let dir = TempDir::new().unwrap();
        let store =
            ArtifactStore::open(dir.path().join("upload"), TrashPolicy::Delete, ".zip").unwrap();
        assert_eq!(store.extension(), "zip");
        let location = store
            .persist(&store.fresh_location(&meta("demo", "1.0")), b"payload")
            .unwrap();

        assert!(store.trash(&location, TrashReason::Delete).is_none());
        assert!(!location.exists());
    }

    #[test]
    fn test_trash_missing_file_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let missing = dir.path().join("upload").join("missing.zip");
        assert!(store.trash(&missing, TrashReason::Error).is_none());
    }

    #[test]
    fn test_second_store_on_same_directory_is_rejected() {
        let dir = TempDir::new().unwrap();
        let _store = open_store(&dir);
        let result = ArtifactStore::open(dir.path().join("upload"), TrashPolicy::Delete, "zip");
        assert!(matches!(result, Err(ArtifactError::Config(_))));
    }

    #[test]
    fn test_derive_replacement_name_substitutes_version() {
        let old = Path::new("/plugins/com.example.echo-v1.0.0.zip");
        assert_eq!(
            derive_replacement_name(old, "1.0.0", "1.1.0"),
            PathBuf::from("/plugins/com.example.echo-v1.1.0.zip")
        );
    }

    #[test]
    fn test_derive_replacement_name_appends_suffix() {
        let old = Path::new("/plugins/echo.zip");
        assert_eq!(
            derive_replacement_name(old, "1.0.0", "1.1.0"),
            PathBuf::from("/plugins/echo-v1.1.0.zip")
        );
    }

    #[test]
    fn test_derive_replacement_name_only_last_occurrence() {
        // ID 中也出现了版本号，只替换最后一处
        let old = Path::new("/plugins/bot2-v2.zip");
        assert_eq!(
            derive_replacement_name(old, "2", "3"),
            PathBuf::from("/plugins/bot2-v3.zip")
        );
    }

    #[test]
    fn test_derive_replacement_name_without_extension() {
        let old = Path::new("/plugins/echo");
        assert_eq!(
            derive_replacement_name(old, "1.0", "2.0"),
            PathBuf::from("/plugins/echo-v2.0")
        );
    }
}

/// 属性测试模块
#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_id() -> impl Strategy<Value = String> {
        "[a-z][a-z_]{2,16}".prop_map(|s| s)
    }

    fn arb_version() -> impl Strategy<Value = String> {
        (1u32..10, 0u32..10, 0u32..10)
            .prop_map(|(major, minor, patch)| format!("{}.{}.{}", major, minor, patch))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// 文件名包含旧版本号时，只替换版本号本身
        #[test]
        fn prop_derive_substitutes_token(
            id in arb_id(),
            old_version in arb_version(),
            new_version in arb_version()
        ) {
            let old = PathBuf::from(format!("/plugins/{}-v{}.zip", id, old_version));
            let derived = derive_replacement_name(&old, &old_version, &new_version);
            prop_assert_eq!(
                derived,
                PathBuf::from(format!("/plugins/{}-v{}.zip", id, new_version))
            );
        }

        /// 文件名不包含旧版本号时，在扩展名前追加版本后缀
        #[test]
        fn prop_derive_appends_suffix(
            id in arb_id(),
            new_version in arb_version()
        ) {
            let old = PathBuf::from(format!("/plugins/{}.zip", id));
            let derived = derive_replacement_name(&old, "0.0.0-never", &new_version);
            prop_assert_eq!(
                derived,
                PathBuf::from(format!("/plugins/{}-v{}.zip", id, new_version))
            );
        }
    }
}
