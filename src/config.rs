//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `RELAY__*` 覆盖（双下划线表示嵌套，
//! 如 `RELAY__AGENT__DEFAULT_TARGET=prod`）。凭证类字段同时接受原生环境变量
//! （SLACK_BOT_TOKEN / SLACK_SIGNING_SECRET / CF_ACCESS_CLIENT_ID 等），
//! 生产环境应只通过环境变量注入，不要写进 TOML。
//!
//! 配置缺失或不一致是启动期致命错误（RelayError::Config），不是请求期错误。

use serde::Deserialize;
use std::path::PathBuf;

use crate::core::RelayError;
use crate::routing::{Target, TargetRegistry};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub slack: SlackSection,
    pub agent: AgentSection,
    pub planner: PlannerSection,
}

/// [slack] 段：Bot 令牌、签名密钥、Webhook 监听端口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SlackSection {
    pub bot_token: Option<String>,
    /// 未配置时跳过请求签名校验（启动时 warn 一次）
    pub signing_secret: Option<String>,
    #[serde(default = "default_slack_port")]
    pub port: u16,
}

impl Default for SlackSection {
    fn default() -> Self {
        Self {
            bot_token: None,
            signing_secret: None,
            port: default_slack_port(),
        }
    }
}

fn default_slack_port() -> u16 {
    3000
}

/// [agent] 段：A2A 端点（单目标或多目标）、超时与预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 单目标：完整 A2A URL（http://host:port/api/a2a/namespace/agent）
    pub a2a_url: Option<String>,
    /// 单目标 / pattern 路由：分量式配置
    pub base_url: Option<String>,
    pub namespace: Option<String>,
    pub agent_name: Option<String>,
    /// 多目标 pattern 路由：如 "k8s-agent-{target}"
    pub pattern: Option<String>,
    pub default_target: Option<String>,
    /// 多目标列表；非空即进入多目标模式
    pub targets: Vec<TargetSection>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default = "default_max_reply_chars")]
    pub max_reply_chars: usize,
    /// Cloudflare Access 服务令牌（也可用 CF_ACCESS_CLIENT_ID/SECRET 环境变量）
    pub cf_access_client_id: Option<String>,
    pub cf_access_client_secret: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            a2a_url: None,
            base_url: None,
            namespace: None,
            agent_name: None,
            pattern: None,
            default_target: None,
            targets: Vec::new(),
            request_timeout_secs: default_request_timeout_secs(),
            max_context_tokens: default_max_context_tokens(),
            max_reply_chars: default_max_reply_chars(),
            cf_access_client_id: None,
            cf_access_client_secret: None,
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_max_context_tokens() -> usize {
    300_000
}

fn default_max_reply_chars() -> usize {
    12_000
}

/// [[agent.targets]] 项：目标名、端点（可由 pattern 推导）、别名
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TargetSection {
    pub name: String,
    pub endpoint: Option<String>,
    pub aliases: Vec<String>,
}

/// [planner] 段：可选 LLM 规划器 / 汇总器（OpenAI 兼容端点；Key 仅从环境变量读）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    pub enabled: bool,
    #[serde(default = "default_planner_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_planner_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_planner_model(),
            base_url: None,
            timeout_secs: default_planner_timeout_secs(),
        }
    }
}

fn default_planner_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_planner_timeout_secs() -> u64 {
    20
}

/// 校验后的派发模式：单目标（无名端点）或多目标（注册表）
#[derive(Debug)]
pub enum RelayMode {
    Single { endpoint: String },
    Multi { registry: TargetRegistry },
}

/// 解析完整 A2A URL 为 (base_url, namespace, agent_name)
pub fn parse_a2a_url(url: &str) -> Result<(String, String, String), RelayError> {
    let Some((base, path)) = url.split_once("/api/a2a/") else {
        return Err(RelayError::Config(format!(
            "Invalid A2A URL '{}': expected http://host:port/api/a2a/namespace/agent",
            url
        )));
    };
    let mut parts = path.trim_end_matches('/').split('/');
    let namespace = parts.next().unwrap_or("");
    let agent_name = parts.next().unwrap_or("");
    if base.is_empty() || namespace.is_empty() || agent_name.is_empty() {
        return Err(RelayError::Config(format!(
            "Could not parse A2A URL '{}' into base/namespace/agent",
            url
        )));
    }
    Ok((base.to_string(), namespace.to_string(), agent_name.to_string()))
}

fn compose_endpoint(base_url: &str, namespace: &str, agent_name: &str) -> String {
    format!(
        "{}/api/a2a/{}/{}/",
        base_url.trim_end_matches('/'),
        namespace,
        agent_name
    )
}

impl AppConfig {
    /// 范围校验（对应原部署环境的安全边界）
    pub fn validate(&self) -> Result<(), RelayError> {
        if !(30..=600).contains(&self.agent.request_timeout_secs) {
            return Err(RelayError::Config(
                "request_timeout_secs must be between 30 and 600".to_string(),
            ));
        }
        if !(10_000..=400_000).contains(&self.agent.max_context_tokens) {
            return Err(RelayError::Config(
                "max_context_tokens must be between 10000 and 400000".to_string(),
            ));
        }
        let (id, secret) = self.cf_access_pair();
        if id.is_some() != secret.is_some() {
            return Err(RelayError::Config(
                "Cloudflare Access requires both client id and client secret".to_string(),
            ));
        }
        Ok(())
    }

    /// 由配置推导派发模式；端点不可解析或默认目标不在集合内时失败
    pub fn relay_mode(&self) -> Result<RelayMode, RelayError> {
        let agent = &self.agent;

        if agent.targets.is_empty() {
            // 单目标：完整 URL 优先，否则分量组合
            let endpoint = if let Some(ref url) = agent.a2a_url {
                let (base, namespace, name) = parse_a2a_url(url)?;
                compose_endpoint(&base, &namespace, &name)
            } else {
                match (&agent.base_url, &agent.namespace, &agent.agent_name) {
                    (Some(base), Some(namespace), Some(name)) => {
                        compose_endpoint(base, namespace, name)
                    }
                    _ => {
                        return Err(RelayError::Config(
                            "Single-target mode requires agent.a2a_url, or agent.base_url + \
                             agent.namespace + agent.agent_name"
                                .to_string(),
                        ))
                    }
                }
            };
            return Ok(RelayMode::Single { endpoint });
        }

        // 多目标：逐目标解析端点（显式 endpoint > pattern 组合）
        let mut targets = Vec::with_capacity(agent.targets.len());
        for section in &agent.targets {
            if section.name.trim().is_empty() {
                return Err(RelayError::Config("Target with empty name".to_string()));
            }
            let endpoint = match (&section.endpoint, &agent.pattern) {
                (Some(endpoint), _) => endpoint.clone(),
                (None, Some(pattern)) => {
                    let (base, namespace) = match (&agent.base_url, &agent.namespace) {
                        (Some(b), Some(n)) => (b, n),
                        _ => {
                            return Err(RelayError::Config(format!(
                                "Pattern routing for target '{}' requires agent.base_url and \
                                 agent.namespace",
                                section.name
                            )))
                        }
                    };
                    let agent_name = pattern.replace("{target}", &section.name);
                    compose_endpoint(base, namespace, &agent_name)
                }
                (None, None) => {
                    return Err(RelayError::Config(format!(
                        "No endpoint for target '{}': set targets.endpoint or agent.pattern",
                        section.name
                    )))
                }
            };
            targets.push(Target {
                name: section.name.clone(),
                endpoint,
                aliases: section.aliases.clone(),
            });
        }

        let registry = TargetRegistry::new(targets, agent.default_target.clone())?;
        Ok(RelayMode::Multi { registry })
    }

    /// Slack Bot 令牌：配置值或 SLACK_BOT_TOKEN 环境变量
    pub fn slack_bot_token(&self) -> Option<String> {
        self.slack
            .bot_token
            .clone()
            .or_else(|| std::env::var("SLACK_BOT_TOKEN").ok())
    }

    /// Slack 签名密钥：配置值或 SLACK_SIGNING_SECRET 环境变量
    pub fn slack_signing_secret(&self) -> Option<String> {
        self.slack
            .signing_secret
            .clone()
            .or_else(|| std::env::var("SLACK_SIGNING_SECRET").ok())
    }

    fn cf_access_pair(&self) -> (Option<String>, Option<String>) {
        (
            self.agent
                .cf_access_client_id
                .clone()
                .or_else(|| std::env::var("CF_ACCESS_CLIENT_ID").ok()),
            self.agent
                .cf_access_client_secret
                .clone()
                .or_else(|| std::env::var("CF_ACCESS_CLIENT_SECRET").ok()),
        )
    }

    /// Cloudflare Access 服务令牌对（配置或环境变量，两者必须同时给出）
    pub fn cf_access(&self) -> Option<(String, String)> {
        match self.cf_access_pair() {
            (Some(id), Some(secret)) => Some((id, secret)),
            _ => None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 RELAY__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 RELAY__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("RELAY")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
