//! 记忆层：(thread, target) 会话状态与 token 预算估算

pub mod conversation;
pub mod tokenizer;

pub use conversation::{ConversationState, ConversationStore};
pub use tokenizer::TokenEstimator;
