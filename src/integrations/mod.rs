//! 外部集成：Slack Events API Webhook（需公网可达的回调地址）

pub mod slack;

pub use slack::{create_router, SlackState};
