//! 规划与汇总（可插拔）
//!
//! Planner 把一条自由文本请求拆成 (target, query) 任务列表；
//! Summarizer 把多目标回答合并为一条回复。两者都可能失败，失败由编排器
//! 降级处理（规划降级到关键词规划器、汇总降级到分节拼接），绝不向聊天层抛错。
//!
//! 内置 KeywordPlanner 做整词/别名匹配；LlmPlanner / LlmSummarizer 走
//! OpenAI 兼容端点，受短超时约束。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde::Deserialize;

use crate::core::RelayError;
use crate::routing::registry::TargetRegistry;

/// 一个待派发任务：向哪个目标问什么（单目标模式 target 为 None）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTask {
    pub target: Option<String>,
    pub query: String,
}

/// 规划器：请求文本 + 可用目标 + 线程内先前用过的目标 → 任务列表
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(
        &self,
        text: &str,
        registry: &TargetRegistry,
        prior_targets: &[String],
    ) -> Result<Vec<PlannedTask>, RelayError>;
}

/// 汇总器：原始问题 + 各目标回答 → 合并文本
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        query: &str,
        answers: &[(String, String)],
    ) -> Result<String, RelayError>;
}

/// 内置平凡规划器：消息中整词命中的目标即为唯一任务；无命中返回空计划
/// （由编排器回退到默认目标）
#[derive(Debug, Default)]
pub struct KeywordPlanner;

#[async_trait]
impl Planner for KeywordPlanner {
    async fn plan(
        &self,
        text: &str,
        registry: &TargetRegistry,
        _prior_targets: &[String],
    ) -> Result<Vec<PlannedTask>, RelayError> {
        Ok(match registry.detect(text) {
            Some(name) => vec![PlannedTask {
                target: Some(name.to_string()),
                query: text.to_string(),
            }],
            None => Vec::new(),
        })
    }
}

/// LLM 输出中的任务项
#[derive(Debug, Deserialize)]
struct WireTask {
    target: Option<String>,
    query: String,
}

/// 从 LLM 输出中截取 JSON 数组（容忍 ```json 围栏与前后废话）
fn extract_json_array(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    let start = trimmed.find('[')?;
    let end = trimmed.rfind(']')?;
    (start < end).then(|| &trimmed[start..=end])
}

/// OpenAI 兼容端点上的 LLM 客户端（planner / summarizer 共用）
pub struct LlmClient {
    client: Client<OpenAIConfig>,
    model: String,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>, timeout: Duration) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            timeout,
        }
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, RelayError> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.to_string())
                    .build()
                    .unwrap(),
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user.to_string())
                    .build()
                    .unwrap(),
            ),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .build()
            .map_err(|e| RelayError::Planner(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| RelayError::Planner("LLM call timed out".to_string()))?
            .map_err(|e| RelayError::Planner(e.to_string()))?;

        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

/// LLM 规划器：让模型把请求拆成 JSON 任务数组
pub struct LlmPlanner {
    llm: LlmClient,
}

impl LlmPlanner {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

const PLANNER_SYSTEM_PROMPT: &str = "You route user requests to named cluster agents. \
Reply with ONLY a JSON array of tasks: [{\"target\": \"<name>\", \"query\": \"<question>\"}]. \
Use only the listed target names. Fan out to several targets when the request compares or \
spans environments. Return [] when no listed target fits.";

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(
        &self,
        text: &str,
        registry: &TargetRegistry,
        prior_targets: &[String],
    ) -> Result<Vec<PlannedTask>, RelayError> {
        let user = format!(
            "Targets: {}\nPreviously used in this thread: {}\nRequest: {}",
            registry.names().join(", "),
            if prior_targets.is_empty() {
                "none".to_string()
            } else {
                prior_targets.join(", ")
            },
            text
        );

        let output = self.llm.complete(PLANNER_SYSTEM_PROMPT, &user).await?;
        let json = extract_json_array(&output)
            .ok_or_else(|| RelayError::Planner(format!("No JSON array in output: {}", output)))?;
        let wire: Vec<WireTask> = serde_json::from_str(json)
            .map_err(|e| RelayError::JsonParse(format!("{}: {}", e, json)))?;

        Ok(wire
            .into_iter()
            .filter(|t| !t.query.trim().is_empty())
            .map(|t| PlannedTask {
                target: t.target,
                query: t.query,
            })
            .collect())
    }
}

/// LLM 汇总器：把多目标回答并成一条连贯回复
pub struct LlmSummarizer {
    llm: LlmClient,
}

impl LlmSummarizer {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

const SUMMARIZER_SYSTEM_PROMPT: &str = "You merge answers from several cluster agents into one \
concise reply. Keep every cluster's facts attributed to its name. Do not invent content.";

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(
        &self,
        query: &str,
        answers: &[(String, String)],
    ) -> Result<String, RelayError> {
        let mut user = format!("Question: {}\n\nAnswers:\n", query);
        for (target, text) in answers {
            user.push_str(&format!("[{}]\n{}\n\n", target, text));
        }

        let merged = self.llm.complete(SUMMARIZER_SYSTEM_PROMPT, &user).await?;
        if merged.trim().is_empty() {
            return Err(RelayError::Planner("Empty summarizer output".to_string()));
        }
        Ok(merged)
    }
}
