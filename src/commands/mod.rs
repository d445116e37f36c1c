//! 命令模块
//!
//! 与传输层无关的命令处理函数，返回状态码和 JSON 响应体

pub mod artifact_cmd;

use serde::{Deserialize, Serialize};

/// 命令响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// HTTP 风格的状态码
    pub status: u16,
    pub body: serde_json::Value,
}

impl CommandResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }

    pub fn no_content() -> Self {
        Self {
            status: 204,
            body: serde_json::Value::Null,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 错误响应体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub errcode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}
