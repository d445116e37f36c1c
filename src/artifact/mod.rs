//! 插件包生命周期模块
//!
//! 提供插件包的上传、替换、删除和重载：
//! - 插件包校验（ZIP + plugin.yaml）
//! - 插件文件存储与回收
//! - 插件注册表
//! - 替换协调（失败时回滚到旧版本）
//! - 替换进度回调

mod coordinator;
mod instances;
mod manifest;
mod registry;
mod store;
mod types;
mod validator;

pub use coordinator::ArtifactCoordinator;
pub use instances::{InstanceError, InstanceManager, NoopInstanceManager};
pub use manifest::{ArtifactManifest, MANIFEST_FILE};
pub use registry::ArtifactRegistry;
pub use store::{derive_replacement_name, list_blobs, ArtifactStore, TrashPolicy, TrashReason};
pub use types::{
    Accepted, Artifact, ArtifactError, ArtifactMeta, ArtifactStatus, Deleted, FnProgressCallback,
    InstallOutcome, InstanceId, NoopProgressCallback, ProgressCallback, ReplaceProgress,
    ReplaceStage,
};
pub use validator::{digest_bytes, digest_file, ArtifactValidator, ZipArtifactValidator};

#[cfg(test)]
pub(crate) use validator::fixtures;
