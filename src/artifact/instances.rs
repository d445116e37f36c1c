//! 插件实例管理接口
//!
//! 实例由宿主管理，协调器只在替换前后调用停止/启动

use async_trait::async_trait;
use thiserror::Error;

use super::types::{Artifact, InstanceId};

/// 实例操作错误
#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("停止实例失败: {instance} - {message}")]
    Stop {
        instance: InstanceId,
        message: String,
    },

    #[error("启动实例失败: {instance} - {message}")]
    Start {
        instance: InstanceId,
        message: String,
    },
}

/// 实例管理器
///
/// 两个操作都针对插件当前绑定的全部实例。
/// 没有超时：停止卡住会让整个替换流程一起等待。
#[async_trait]
pub trait InstanceManager: Send + Sync {
    /// 停止插件的全部实例
    async fn stop_instances(&self, artifact: &Artifact) -> Result<(), InstanceError>;

    /// 以当前插件定义启动全部实例
    async fn start_instances(&self, artifact: &Artifact) -> Result<(), InstanceError>;
}

/// 空实例管理器
///
/// 用于没有实例需要管理的场景
pub struct NoopInstanceManager;

#[async_trait]
impl InstanceManager for NoopInstanceManager {
    async fn stop_instances(&self, _artifact: &Artifact) -> Result<(), InstanceError> {
        Ok(())
    }

    async fn start_instances(&self, _artifact: &Artifact) -> Result<(), InstanceError> {
        Ok(())
    }
}
