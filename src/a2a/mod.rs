//! A2A 协议层：出入站类型、SSE 解码、响应折叠、客户端派发

pub mod client;
pub mod extract;
pub mod stream;
pub mod types;

pub use client::{derive_message_id, A2aClient, Dispatch};
pub use extract::ResponseExtractor;
pub use stream::StreamDecoder;
pub use types::{TaskOutcome, TaskStatus};
