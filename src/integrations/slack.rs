//! Slack Events API 集成
//!
//! 通过 Webhook 接收 @提及，交给编排器处理后在原线程内回复。
//! 带签名密钥时按 Slack v0 方案校验请求（HMAC-SHA256 + 5 分钟重放窗口）；
//! 事件处理放入后台任务，HTTP 侧在 Slack 的 3 秒期限内返回 200。

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::core::Orchestrator;

type HmacSha256 = Hmac<Sha256>;

/// 单条 Slack 消息的长度上限（官方 40k，留余量按 3900 字符分段）
const SLACK_CHUNK_CHARS: usize = 3900;

/// 签名时间戳允许的偏差（秒），超出视为重放
const SIGNATURE_REPLAY_WINDOW_SECS: i64 = 300;

/// Slack 服务状态
pub struct SlackState {
    pub orchestrator: Arc<Orchestrator>,
    pub bot_token: String,
    pub signing_secret: Option<String>,
    pub http: reqwest::Client,
}

/// Events API 请求外壳（url_verification / event_callback 共用）
#[derive(Debug, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub challenge: Option<String>,
    pub event: Option<SlackEvent>,
}

#[derive(Debug, Deserialize)]
pub struct SlackEvent {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub text: Option<String>,
    pub user: Option<String>,
    pub channel: Option<String>,
    pub ts: Option<String>,
    pub thread_ts: Option<String>,
    /// 机器人自身消息带 bot_id，忽略以避免回环
    pub bot_id: Option<String>,
}

/// chat.postMessage 请求体
#[derive(Debug, Serialize)]
struct PostMessageRequest {
    channel: String,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    error: Option<String>,
}

/// 去掉开头的 <@BOT_ID> 提及，取第一个 '>' 之后的内容
pub fn strip_mention(text: &str) -> String {
    match text.split_once('>') {
        Some((_, rest)) => rest.trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// 按字符数分段（Slack 单条消息长度限制）
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }
    text.chars()
        .collect::<Vec<_>>()
        .chunks(max_chars)
        .map(|c| c.iter().collect())
        .collect()
}

/// Slack v0 请求签名校验：v0=hex(hmac_sha256(secret, "v0:{ts}:{body}"))
pub fn verify_signature(secret: &str, timestamp: &str, body: &str, signature: &str) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    let now = chrono::Utc::now().timestamp();
    if (now - ts).abs() > SIGNATURE_REPLAY_WINDOW_SECS {
        return false;
    }

    let Some(sig_hex) = signature.strip_prefix("v0=") else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("v0:{}:{}", timestamp, body).as_bytes());
    mac.verify_slice(&sig_bytes).is_ok()
}

/// 创建 Slack 路由
pub fn create_router(state: Arc<SlackState>) -> Router {
    Router::new()
        .route("/slack/events", post(receive_event))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

/// POST /slack/events - 接收 Events API 回调
async fn receive_event(
    State(state): State<Arc<SlackState>>,
    headers: HeaderMap,
    body: String,
) -> Result<String, StatusCode> {
    if let Some(secret) = &state.signing_secret {
        let timestamp = headers
            .get("x-slack-request-timestamp")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let signature = headers
            .get("x-slack-signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(secret, timestamp, &body, signature) {
            tracing::warn!("Rejected Slack request with bad signature");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }

    let envelope: EventEnvelope =
        serde_json::from_str(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    match envelope.kind.as_deref() {
        Some("url_verification") => Ok(envelope.challenge.unwrap_or_default()),
        Some("event_callback") => {
            if let Some(event) = envelope.event {
                // 先返回 200，事件在后台处理
                tokio::spawn(handle_event(state, event));
            }
            Ok(String::new())
        }
        _ => Ok(String::new()),
    }
}

/// 处理一条 app_mention：剥掉提及 → 编排器 → 线程内回复
async fn handle_event(state: Arc<SlackState>, event: SlackEvent) {
    if event.kind.as_deref() != Some("app_mention") || event.bot_id.is_some() {
        tracing::debug!("Ignoring event type {:?}", event.kind);
        return;
    }
    let Some(channel) = event.channel else { return };
    let Some(ts) = event.ts else { return };

    // 线程 id：已有线程沿用，否则以首条消息开新线程
    let thread_ts = event.thread_ts.unwrap_or(ts);
    let text = strip_mention(event.text.as_deref().unwrap_or(""));

    tracing::info!(
        "app_mention in {} (thread {}, user {:?})",
        channel,
        thread_ts,
        event.user
    );

    if text.is_empty() {
        let _ = state
            .post_reply(&channel, &thread_ts, "Please provide a message after mentioning me!")
            .await;
        return;
    }

    let _ = state
        .post_reply(&channel, &thread_ts, "🤔 Processing your request...")
        .await;

    let reply = state.orchestrator.handle(&text, &thread_ts).await;

    if let Err(e) = state.post_reply(&channel, &thread_ts, &reply).await {
        tracing::error!("Failed to post Slack reply: {}", e);
    }
}

impl SlackState {
    /// 通过 chat.postMessage 在线程内回复（超长自动分段）
    async fn post_reply(&self, channel: &str, thread_ts: &str, text: &str) -> anyhow::Result<()> {
        for chunk in chunk_message(text, SLACK_CHUNK_CHARS) {
            let request = PostMessageRequest {
                channel: channel.to_string(),
                text: chunk,
                thread_ts: Some(thread_ts.to_string()),
            };
            let response: PostMessageResponse = self
                .http
                .post("https://slack.com/api/chat.postMessage")
                .bearer_auth(&self.bot_token)
                .json(&request)
                .send()
                .await?
                .json()
                .await?;
            if !response.ok {
                anyhow::bail!(
                    "Slack API error: {}",
                    response.error.unwrap_or_else(|| "unknown".to_string())
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_mention() {
        assert_eq!(strip_mention("<@U123ABC> list pods"), "list pods");
        assert_eq!(strip_mention("no mention here"), "no mention here");
        assert_eq!(strip_mention("<@U123ABC>"), "");
    }

    #[test]
    fn test_chunk_message_short_passthrough() {
        assert_eq!(chunk_message("hello", 10), vec!["hello".to_string()]);
    }

    #[test]
    fn test_chunk_message_splits_long_text() {
        let text = "a".repeat(25);
        let chunks = chunk_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[2].len(), 5);
    }

    fn sign(secret: &str, timestamp: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("v0:{}:{}", timestamp, body).as_bytes());
        format!("v0={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_signature_accepts_valid() {
        let ts = chrono::Utc::now().timestamp().to_string();
        let body = r#"{"type":"url_verification"}"#;
        let sig = sign("secret", &ts, body);
        assert!(verify_signature("secret", &ts, body, &sig));
    }

    #[test]
    fn test_signature_rejects_tampered_body() {
        let ts = chrono::Utc::now().timestamp().to_string();
        let sig = sign("secret", &ts, "original");
        assert!(!verify_signature("secret", &ts, "tampered", &sig));
    }

    #[test]
    fn test_signature_rejects_stale_timestamp() {
        let old = (chrono::Utc::now().timestamp() - 3600).to_string();
        let body = "body";
        let sig = sign("secret", &old, body);
        assert!(!verify_signature("secret", &old, body, &sig));
    }

    #[test]
    fn test_signature_rejects_malformed() {
        let ts = chrono::Utc::now().timestamp().to_string();
        assert!(!verify_signature("secret", &ts, "body", "not-a-signature"));
        assert!(!verify_signature("secret", "not-a-number", "body", "v0=00"));
    }

    #[test]
    fn test_envelope_deserialization() {
        let raw = r#"{
            "type": "event_callback",
            "event": {
                "type": "app_mention",
                "text": "<@U1> how many pods in prod",
                "user": "U2",
                "channel": "C1",
                "ts": "1700000000.000100",
                "thread_ts": "1699999999.000100"
            }
        }"#;
        let envelope: EventEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.kind.as_deref(), Some("event_callback"));
        let event = envelope.event.unwrap();
        assert_eq!(event.kind.as_deref(), Some("app_mention"));
        assert_eq!(event.thread_ts.as_deref(), Some("1699999999.000100"));
        assert!(event.bot_id.is_none());
    }
}
