//! Hive 本地 REPL
//!
//! 不经 Slack 直接与编排器对话，便于调试目标配置与 A2A 连通性。
//! 每次启动一个新"线程"（uuid），`reset` 清空上下文，`exit` 退出。
//!
//! 启动: cargo run --bin hive-repl

use std::sync::Arc;

use hive::config::load_config;
use hive::Orchestrator;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("warn".parse().unwrap()))
        .with(fmt::layer())
        .init();

    let cfg = load_config(None)?;
    let orchestrator = Arc::new(Orchestrator::from_config(&cfg)?);

    let thread_id = format!("repl-{}", uuid::Uuid::new_v4());
    println!("Hive REPL (thread {}). Type 'exit' to quit.", thread_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            break;
        }

        let reply = orchestrator.handle(input, &thread_id).await;
        println!("{}\n", reply);
    }

    Ok(())
}
