//! 响应提取：JSON-RPC 事件序列 → TaskOutcome 状态机
//!
//! 状态：等待首事件 → 流中 → 结束。逐事件折叠：
//! - error 对象立即终止（命中 token/限流签名时归为 TokenLimit，调用方需失效已存 contextId）
//! - contextId 后写覆盖；status.state 作为运行状态跟踪
//! - 仅 role == "agent" 的消息贡献回复文本（用户回显忽略），后到的 agent 消息覆盖先到的
//! - final 标志终止；流在无 final 时关闭则按已累积内容收尾（可能仍是 unknown）
//!
//! 本层不做重试，只如实报告观察到的内容。

use serde_json::Value;

use crate::a2a::types::{RpcEnvelope, TaskOutcome, TaskStatus};

/// 远端错误文本中的 token / 限流签名（命中即归类 TokenLimit）
const TOKEN_LIMIT_SIGNATURES: &[&str] = &[
    "tokens per min",
    "token limit",
    "rate limit",
    "context length",
    "context_length_exceeded",
];

fn is_token_limit_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    TOKEN_LIMIT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingFirstEvent,
    Streaming,
    Done,
}

/// 单次 message/stream 运行的折叠器
pub struct ResponseExtractor {
    phase: Phase,
    response: Option<String>,
    status: TaskStatus,
    context_id: Option<String>,
    target: Option<String>,
    events_seen: usize,
}

impl ResponseExtractor {
    pub fn new(target: Option<String>) -> Self {
        Self {
            phase: Phase::AwaitingFirstEvent,
            response: None,
            status: TaskStatus::Unknown,
            context_id: None,
            target,
            events_seen: 0,
        }
    }

    /// 应用一个已解码事件；返回 true 表示运行终止，调用方应停止读流
    pub fn apply(&mut self, value: &Value) -> bool {
        if self.phase == Phase::Done {
            return true;
        }

        let envelope: RpcEnvelope = match serde_json::from_value(value.clone()) {
            Ok(env) => env,
            Err(e) => {
                // 形状不符的单个事件跳过，不中断整个流
                tracing::warn!("Skipping JSON-RPC event with unexpected shape: {}", e);
                return false;
            }
        };

        self.events_seen += 1;
        self.phase = Phase::Streaming;

        if let Some(error) = envelope.error {
            let message = error
                .message
                .unwrap_or_else(|| "Unknown error".to_string());
            tracing::error!(
                "JSON-RPC error from agent (code {:?}): {}",
                error.code,
                message
            );
            self.status = if is_token_limit_error(&message) {
                TaskStatus::TokenLimit
            } else {
                TaskStatus::Error
            };
            self.response = Some(format!("Agent error: {}", message));
            self.phase = Phase::Done;
            return true;
        }

        let Some(body) = envelope.result else {
            tracing::warn!("Empty result in JSON-RPC response");
            return false;
        };

        if let Some(context_id) = body.context_id {
            // 协议可能多次下发 contextId，保留最后一次
            self.context_id = Some(context_id);
        }

        if let Some(status) = body.status {
            if let Some(state) = status.state {
                self.status = TaskStatus::from_state(&state);
            }
            if let Some(message) = status.message {
                if message.role.as_deref() == Some("agent") {
                    if let Some(text) = message.parts.iter().find_map(|p| p.text.clone()) {
                        self.response = Some(text);
                    }
                }
            }
        }

        if body.is_final {
            self.phase = Phase::Done;
            return true;
        }

        false
    }

    /// 收尾：流结束（final 或传输关闭）后取出结果。
    /// 零事件 ⇒ status 保持 unknown、response 为 None，调用方必须视为"无回答"。
    pub fn finish(self) -> TaskOutcome {
        tracing::debug!(
            "Stream run finished: {} events, status {}",
            self.events_seen,
            self.status
        );
        TaskOutcome {
            response: self.response,
            status: self.status,
            context_id: self.context_id,
            target: self.target,
        }
    }
}
