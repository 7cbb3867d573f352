//! 会话上下文存储：(thread, target) → ConversationState
//!
//! 每个 Slack 线程在每个目标上各有一条会话（单目标模式下 target 为 None）。
//! 记录远端下发的 contextId、消息计数与累计 token 估算；估算超出预算时
//! 编排器应短路为"会话过大"回复而不再发起远端请求（本系统的背压机制）。
//! 进程内存态，不做持久化，生命周期即进程生命周期。

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::memory::tokenizer::TokenEstimator;

/// 一条 (thread, target) 会话的状态
#[derive(Debug, Clone)]
pub struct ConversationState {
    /// 远端下发的会话延续令牌
    pub context_id: String,
    /// 所属目标；单目标模式为 None
    pub target: Option<String>,
    pub message_count: u32,
    pub estimated_tokens: usize,
    pub last_active: DateTime<Utc>,
}

type Key = (String, Option<String>);

/// 会话存储：内部 RwLock，读写临界区都很短；不同 key 的更新互不争用语义
#[derive(Default)]
pub struct ConversationStore {
    entries: RwLock<HashMap<Key, ConversationState>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(thread_id: &str, target: Option<&str>) -> Key {
        (thread_id.to_string(), target.map(String::from))
    }

    pub fn get(&self, thread_id: &str, target: Option<&str>) -> Option<ConversationState> {
        self.entries
            .read()
            .expect("conversation store lock poisoned")
            .get(&Self::key(thread_id, target))
            .cloned()
    }

    /// 记录一次成功交换：首条创建（count = 1），后续累加计数与 token 估算。
    /// contextId 以最新值覆盖（远端可能在会话中途轮换）。
    pub fn update(
        &self,
        thread_id: &str,
        target: Option<&str>,
        context_id: &str,
        request_text: &str,
        response_text: Option<&str>,
    ) {
        let tokens = TokenEstimator::estimate(request_text)
            + TokenEstimator::estimate(response_text.unwrap_or(""));
        let mut entries = self
            .entries
            .write()
            .expect("conversation store lock poisoned");

        let entry = entries
            .entry(Self::key(thread_id, target))
            .or_insert_with(|| ConversationState {
                context_id: context_id.to_string(),
                target: target.map(String::from),
                message_count: 0,
                estimated_tokens: 0,
                last_active: Utc::now(),
            });
        entry.context_id = context_id.to_string();
        entry.message_count += 1;
        entry.estimated_tokens += tokens;
        entry.last_active = Utc::now();
    }

    /// 清除会话：带 target 只清该目标，不带则清整个线程（含单目标态）
    pub fn clear(&self, thread_id: &str, target: Option<&str>) {
        let mut entries = self
            .entries
            .write()
            .expect("conversation store lock poisoned");
        match target {
            Some(_) => {
                entries.remove(&Self::key(thread_id, target));
            }
            None => {
                entries.retain(|(thread, _), _| thread != thread_id);
            }
        }
    }

    /// 预算检查：(是否超限, 当前估算)；无会话时为 (false, None)
    pub fn check_budget(
        &self,
        thread_id: &str,
        target: Option<&str>,
        max_tokens: usize,
    ) -> (bool, Option<usize>) {
        match self.get(thread_id, target) {
            Some(state) => (state.estimated_tokens > max_tokens, Some(state.estimated_tokens)),
            None => (false, None),
        }
    }

    /// 线程内已建立会话的目标名（供规划器做"先前目标"记忆）
    pub fn thread_targets(&self, thread_id: &str) -> Vec<String> {
        self.entries
            .read()
            .expect("conversation store lock poisoned")
            .keys()
            .filter(|(thread, _)| thread == thread_id)
            .filter_map(|(_, target)| target.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .expect("conversation store lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
