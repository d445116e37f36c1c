//! 插件包管理
//!
//! 插件包的上传、原地替换（失败自动回滚）、删除和重载

pub mod artifact;
pub mod commands;
pub mod config;
pub mod logger;

pub use artifact::{
    Accepted, Artifact, ArtifactCoordinator, ArtifactError, ArtifactStatus, InstanceId,
    InstanceManager,
};
pub use config::DepotConfig;
