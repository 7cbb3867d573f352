//! A2A 协议数据类型
//!
//! 出站：JSON-RPC 2.0 `message/stream` 请求体；
//! 入站：SSE 事件内的 JSON-RPC 响应（result 事件体 / error 对象）。
//! 任务层：TaskStatus / TaskOutcome，单次远端交互的折叠结果。

use std::fmt;

use serde::{Deserialize, Serialize};

/// JSON-RPC 出站请求（method 固定为 "message/stream"）
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    pub params: RpcParams,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcParams {
    pub message: OutboundMessage,
}

/// 出站用户消息：单个 text part + 确定性 messageId（便于远端幂等去重）
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    pub role: &'static str,
    pub parts: Vec<OutboundPart>,
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "contextId", skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundPart {
    pub kind: &'static str,
    pub text: String,
}

impl RpcRequest {
    pub fn message_stream(text: String, message_id: String, context_id: Option<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: 1,
            method: "message/stream",
            params: RpcParams {
                message: OutboundMessage {
                    role: "user",
                    parts: vec![OutboundPart {
                        kind: "text",
                        text,
                    }],
                    message_id,
                    context_id,
                },
            },
        }
    }
}

/// 入站 JSON-RPC 响应外壳：success 带 result，error 带 error
#[derive(Debug, Clone, Deserialize)]
pub struct RpcEnvelope {
    #[serde(default)]
    pub result: Option<EventBody>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

/// 事件体：contextId / status / final 均可缺省（协议允许部分字段多次出现）
#[derive(Debug, Clone, Deserialize)]
pub struct EventBody {
    #[serde(rename = "contextId", default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub status: Option<EventStatus>,
    #[serde(rename = "final", default)]
    pub is_final: bool,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventStatus {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub message: Option<InboundMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<InboundPart>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundPart {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// 任务状态：Completed 是唯一成功态，其余一律作为可见失败向上传递。
/// 远端自由状态串（working / submitted 等）保留在 Other 中原样展示。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Unknown,
    Completed,
    Failed,
    Timeout,
    Error,
    TokenLimit,
    ContextOverflow,
    Other(String),
}

impl TaskStatus {
    /// 从远端 status.state 字符串映射（未识别的值原样保留）
    pub fn from_state(state: &str) -> Self {
        match state {
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            other => TaskStatus::Other(other.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Unknown => write!(f, "unknown"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Timeout => write!(f, "timeout"),
            TaskStatus::Error => write!(f, "error"),
            TaskStatus::TokenLimit => write!(f, "token-limit"),
            TaskStatus::ContextOverflow => write!(f, "context-overflow"),
            TaskStatus::Other(s) => write!(f, "{}", s),
        }
    }
}

/// 单次远端交互的结果（一个任务对应一次 message/stream 往返）
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// Agent 回复文本；流中无 agent 消息时为 None（调用方视为"无回答"而非成功）
    pub response: Option<String>,
    pub status: TaskStatus,
    /// 流结束时最后观察到的 contextId
    pub context_id: Option<String>,
    /// 多目标模式下该任务指向的目标名
    pub target: Option<String>,
}

impl TaskOutcome {
    pub fn empty(target: Option<String>) -> Self {
        Self {
            response: None,
            status: TaskStatus::Unknown,
            context_id: None,
            target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization_shape() {
        let req = RpcRequest::message_stream(
            "list pods".to_string(),
            "msg-abc123".to_string(),
            Some("ctx-1".to_string()),
        );
        let v = serde_json::to_value(&req).unwrap();

        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["method"], "message/stream");
        assert_eq!(v["params"]["message"]["role"], "user");
        assert_eq!(v["params"]["message"]["messageId"], "msg-abc123");
        assert_eq!(v["params"]["message"]["contextId"], "ctx-1");
        assert_eq!(v["params"]["message"]["parts"][0]["kind"], "text");
        assert_eq!(v["params"]["message"]["parts"][0]["text"], "list pods");
    }

    #[test]
    fn test_request_omits_absent_context_id() {
        let req = RpcRequest::message_stream("hi".to_string(), "msg-1".to_string(), None);
        let v = serde_json::to_value(&req).unwrap();
        assert!(v["params"]["message"].get("contextId").is_none());
    }

    #[test]
    fn test_envelope_deserializes_status_event() {
        let raw = r#"{
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "contextId": "ctx-9",
                "final": true,
                "status": {
                    "state": "completed",
                    "message": {
                        "role": "agent",
                        "parts": [{"kind": "text", "text": "3 pods running"}]
                    }
                }
            }
        }"#;
        let env: RpcEnvelope = serde_json::from_str(raw).unwrap();
        let body = env.result.unwrap();
        assert!(body.is_final);
        assert_eq!(body.context_id.as_deref(), Some("ctx-9"));
        let status = body.status.unwrap();
        assert_eq!(status.state.as_deref(), Some("completed"));
        let msg = status.message.unwrap();
        assert_eq!(msg.role.as_deref(), Some("agent"));
        assert_eq!(msg.parts[0].text.as_deref(), Some("3 pods running"));
    }

    #[test]
    fn test_envelope_deserializes_error() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"boom"}}"#;
        let env: RpcEnvelope = serde_json::from_str(raw).unwrap();
        assert!(env.result.is_none());
        assert_eq!(env.error.unwrap().message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_status_from_state() {
        assert_eq!(TaskStatus::from_state("completed"), TaskStatus::Completed);
        assert_eq!(TaskStatus::from_state("failed"), TaskStatus::Failed);
        assert_eq!(
            TaskStatus::from_state("working"),
            TaskStatus::Other("working".to_string())
        );
        assert!(TaskStatus::Completed.is_success());
        assert!(!TaskStatus::Other("working".into()).is_success());
    }
}
