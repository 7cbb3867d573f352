//! 核心编排层：错误类型与单事件主控流程

pub mod error;
pub mod orchestrator;

pub use error::RelayError;
pub use orchestrator::Orchestrator;
