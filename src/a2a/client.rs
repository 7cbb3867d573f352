//! A2A 客户端：流式 POST + SSE 消费
//!
//! 对每个任务执行一次 message/stream 往返：构造 JSON-RPC 请求
//! （确定性 messageId + 可选 contextId），POST 到目标端点并以 SSE 读回，
//! 交给 StreamDecoder / ResponseExtractor 折叠为 TaskOutcome。
//! 本层不抛错：超时、连接失败、非 2xx 全部折叠为对应状态的 TaskOutcome。

use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::a2a::extract::ResponseExtractor;
use crate::a2a::stream::StreamDecoder;
use crate::a2a::types::{RpcRequest, TaskOutcome, TaskStatus};
use crate::core::RelayError;

/// 派发抽象：编排器只依赖该接口（测试中用 mock 替换真实 HTTP 客户端）
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// 向端点发送一条用户消息，返回折叠后的结果；永不返回 Err
    async fn send(
        &self,
        endpoint: &str,
        target: Option<&str>,
        query: &str,
        thread_id: &str,
        context_id: Option<&str>,
    ) -> TaskOutcome;
}

/// 确定性消息 id：sha256(query + thread) 前 16 个十六进制字符，
/// 同一线程内重发同一请求得到同一 id，便于远端幂等去重
pub fn derive_message_id(query: &str, thread_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update(thread_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("msg-{}", &digest[..16])
}

/// 生产实现：共享 reqwest 连接池，整体读流受请求超时约束
pub struct A2aClient {
    http: reqwest::Client,
    request_timeout: Duration,
    /// Cloudflare Access 服务令牌（配置后附加到每个请求）
    cf_access: Option<(String, String)>,
}

impl A2aClient {
    pub fn new(
        request_timeout: Duration,
        cf_access: Option<(String, String)>,
    ) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("hive/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            request_timeout,
            cf_access,
        })
    }

    fn failure(target: Option<&str>, status: TaskStatus, text: String) -> TaskOutcome {
        TaskOutcome {
            response: Some(text),
            status,
            context_id: None,
            target: target.map(String::from),
        }
    }

    async fn exchange(
        &self,
        endpoint: &str,
        target: Option<&str>,
        request: &RpcRequest,
    ) -> TaskOutcome {
        let mut req = self
            .http
            .post(endpoint)
            .json(request)
            .header("Accept", "text/event-stream");
        if let Some((client_id, client_secret)) = &self.cf_access {
            req = req
                .header("CF-Access-Client-Id", client_id)
                .header("CF-Access-Client-Secret", client_secret);
        }

        let response = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("Request to {} failed: {}", endpoint, e);
                return Self::failure(
                    target,
                    TaskStatus::Error,
                    format!("Failed to connect to agent: {}", e),
                );
            }
        };

        let http_status = response.status();
        if !http_status.is_success() {
            tracing::error!("Agent endpoint {} returned HTTP {}", endpoint, http_status);
            return Self::failure(
                target,
                TaskStatus::Error,
                format!("Agent endpoint returned HTTP {}", http_status),
            );
        }

        let mut decoder = StreamDecoder::new(response.bytes_stream());
        let mut extractor = ResponseExtractor::new(target.map(String::from));
        while let Some(value) = decoder.next_value().await {
            if extractor.apply(&value) {
                // 观察到终止事件后主动停读，不再解码剩余字节
                break;
            }
        }
        if decoder.malformed_count() > 0 {
            tracing::warn!(
                "Skipped {} malformed events from {}",
                decoder.malformed_count(),
                endpoint
            );
        }
        extractor.finish()
    }
}

#[async_trait]
impl Dispatch for A2aClient {
    async fn send(
        &self,
        endpoint: &str,
        target: Option<&str>,
        query: &str,
        thread_id: &str,
        context_id: Option<&str>,
    ) -> TaskOutcome {
        // 日志截断并去掉换行，避免日志注入
        let safe_query: String = query.chars().take(100).collect::<String>().replace(['\n', '\r'], " ");
        tracing::info!(
            "Dispatching to {} (target {:?}, thread {}, context {:?}): {}...",
            endpoint,
            target,
            thread_id,
            context_id,
            safe_query
        );

        let request = RpcRequest::message_stream(
            query.to_string(),
            derive_message_id(query, thread_id),
            context_id.map(String::from),
        );

        match tokio::time::timeout(self.request_timeout, self.exchange(endpoint, target, &request))
            .await
        {
            Ok(outcome) => {
                tracing::info!(
                    "Task done (target {:?}): status {}, context {:?}, {} chars",
                    target,
                    outcome.status,
                    outcome.context_id,
                    outcome.response.as_deref().map(str::len).unwrap_or(0)
                );
                outcome
            }
            Err(_) => {
                tracing::error!(
                    "Request to {} timed out after {}s",
                    endpoint,
                    self.request_timeout.as_secs()
                );
                Self::failure(
                    target,
                    TaskStatus::Timeout,
                    "Request timed out. Please try again.".to_string(),
                )
            }
        }
    }
}
