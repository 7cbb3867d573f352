//! Hive - Rust Slack 集群智能体中继
//!
//! 把 Slack 线程中的自然语言请求通过 A2A（Agent2Agent）流式 JSON-RPC
//! 协议转发给一个或多个远端集群 Agent，维护每线程、每目标的会话上下文，
//! 并支持单请求扇出到多目标后合并回复。
//!
//! 模块划分：
//! - **a2a**: A2A 协议层（JSON-RPC 类型、SSE 解码、响应折叠、客户端派发）
//! - **config**: 应用配置加载（TOML + 环境变量）与派发模式校验
//! - **core**: 错误类型与编排器（预算检查 → 规划 → 派发 → 合并）
//! - **integrations**: Slack Events API Webhook 前端
//! - **memory**: (thread, target) 会话状态与 token 预算估算
//! - **routing**: 目标注册表、名称检测、规划与汇总（可插拔 LLM）

pub mod a2a;
pub mod config;
pub mod core;
pub mod integrations;
pub mod memory;
pub mod routing;

pub use crate::core::{Orchestrator, RelayError};
