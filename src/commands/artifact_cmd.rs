//! 插件管理命令
//!
//! 提供插件管理的命令处理函数：
//! - list_artifacts: 列出插件
//! - get_artifact: 查询插件
//! - delete_artifact: 删除插件
//! - reload_artifact: 重新加载插件
//! - upload_artifact: 上传插件（新安装或替换）

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use super::{CommandResponse, ErrorBody};
use crate::artifact::{
    ArtifactCoordinator, ArtifactError, NoopProgressCallback, ProgressCallback, ReplaceProgress,
};

/// 协调器状态
#[derive(Clone)]
pub struct ArtifactCoordinatorState(pub Arc<ArtifactCoordinator>);

/// 通道进度回调
///
/// 将替换进度发送给订阅方，接收端关闭后静默丢弃
struct ChannelProgressCallback {
    sender: UnboundedSender<ReplaceProgress>,
}

impl ProgressCallback for ChannelProgressCallback {
    fn on_progress(&self, progress: ReplaceProgress) {
        let _ = self.sender.send(progress);
    }
}

/// 列出所有插件
pub async fn list_artifacts(state: &ArtifactCoordinatorState) -> CommandResponse {
    json_response(&state.0.list())
}

/// 查询插件
pub async fn get_artifact(state: &ArtifactCoordinatorState, id: &str) -> CommandResponse {
    match state.0.get(id) {
        Ok(artifact) => json_response(&artifact),
        Err(e) => error_response(&e),
    }
}

/// 删除插件
pub async fn delete_artifact(state: &ArtifactCoordinatorState, id: &str) -> CommandResponse {
    match state.0.delete(id).await {
        Ok(_) => CommandResponse::no_content(),
        Err(e) => error_response(&e),
    }
}

/// 重新加载插件
pub async fn reload_artifact(state: &ArtifactCoordinatorState, id: &str) -> CommandResponse {
    match state.0.reload(id).await {
        Ok(artifact) => json_response(&artifact),
        Err(e @ ArtifactError::InvalidArtifact { .. }) => CommandResponse {
            status: 500,
            body: error_body(&e, "plugin_reload_fail"),
        },
        Err(e) => error_response(&e),
    }
}

/// 上传插件
///
/// 传入 progress 时通过通道推送替换进度
pub async fn upload_artifact(
    state: &ArtifactCoordinatorState,
    bytes: &[u8],
    progress: Option<UnboundedSender<ReplaceProgress>>,
) -> CommandResponse {
    let result = match progress {
        Some(sender) => {
            let callback = ChannelProgressCallback { sender };
            state.0.install_or_replace(bytes, &callback).await
        }
        None => state.0.install_or_replace(bytes, &NoopProgressCallback).await,
    };

    match result {
        Ok(accepted) => json_response(&accepted),
        Err(e) => error_response(&e),
    }
}

/// 错误对应的状态码
pub fn status_for(error: &ArtifactError) -> u16 {
    match error {
        ArtifactError::InvalidArtifact { .. } => 400,
        ArtifactError::Unsupported(_) => 400,
        ArtifactError::NotFound(_) => 404,
        ArtifactError::InUse { .. } => 412,
        ArtifactError::IoFailure { .. } => 500,
        ArtifactError::InstanceFailure { .. } => 500,
        ArtifactError::Config(_) => 500,
    }
}

fn error_response(error: &ArtifactError) -> CommandResponse {
    CommandResponse {
        status: status_for(error),
        body: error_body(error, error.errcode()),
    }
}

fn error_body(error: &ArtifactError, errcode: &str) -> serde_json::Value {
    let body = ErrorBody {
        error: error.to_string(),
        errcode: errcode.to_string(),
        stacktrace: error.trace().map(str::to_string),
    };
    serde_json::to_value(body).unwrap_or_else(|_| serde_json::json!({ "errcode": errcode }))
}

fn json_response<T: Serialize>(value: &T) -> CommandResponse {
    match serde_json::to_value(value) {
        Ok(body) => CommandResponse::ok(body),
        Err(e) => {
            tracing::error!("[COMMAND] 序列化响应失败: {}", e);
            CommandResponse {
                status: 500,
                body: serde_json::json!({
                    "error": format!("序列化响应失败: {}", e),
                    "errcode": "serialization_error",
                }),
            }
        }
    }
}
