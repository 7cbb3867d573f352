//! Hive Slack 中继服务
//!
//! 入口：初始化日志、加载配置、构建编排器并启动 Slack Webhook 服务。
//!
//! 环境变量:
//! - SLACK_BOT_TOKEN: Slack Bot OAuth 令牌 (xoxb-...)
//! - SLACK_SIGNING_SECRET: 请求签名密钥（缺省则跳过校验，仅限本地调试）
//! - RELAY__AGENT__A2A_URL 等: 覆盖 config/default.toml 中的任意键
//! - CF_ACCESS_CLIENT_ID / CF_ACCESS_CLIENT_SECRET: 可选 Cloudflare Access 令牌
//!
//! 启动: cargo run

use std::sync::Arc;

use hive::config::load_config;
use hive::integrations::{create_router, SlackState};
use hive::Orchestrator;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();

    let cfg = load_config(None)?;
    let orchestrator = Arc::new(Orchestrator::from_config(&cfg)?);

    let bot_token = cfg
        .slack_bot_token()
        .expect("SLACK_BOT_TOKEN must be set");
    let signing_secret = cfg.slack_signing_secret();
    if signing_secret.is_none() {
        tracing::warn!("No Slack signing secret configured, request verification disabled");
    }

    let state = Arc::new(SlackState {
        orchestrator,
        bot_token,
        signing_secret,
        http: reqwest::Client::new(),
    });

    let app = create_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cfg.slack.port));
    tracing::info!("Hive Slack relay listening on http://{}", addr);
    tracing::info!("Event URL: http://YOUR_HOST:{}/slack/events", cfg.slack.port);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
