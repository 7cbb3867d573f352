//! 中继错误类型
//!
//! 启动期（配置）错误快速失败；请求期失败不走该类型——一律折叠为
//! TaskOutcome 文本，编排器对聊天层永不抛错。

use thiserror::Error;

/// 中继运行过程中可能出现的错误（配置、传输、规划、解析）
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Planner error: {0}")]
    Planner(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Slack API error: {0}")]
    Slack(String),
}
