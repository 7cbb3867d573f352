//! 编排器：单次聊天事件的主控流程
//!
//! handle(text, thread) 的路径：重置指令 → 规划（单目标隐式计划 /
//! LLM 规划降级到关键词规划）→ 逐任务预算检查与派发（并发）→
//! 收集结果并更新会话存储 → 单结果直通 / 多结果汇总 → 截断后返回。
//! 所有失败折叠为回复文本，对聊天层永不抛错。

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use crate::a2a::{A2aClient, Dispatch, TaskOutcome, TaskStatus};
use crate::config::{AppConfig, RelayMode};
use crate::core::RelayError;
use crate::memory::ConversationStore;
use crate::routing::{
    KeywordPlanner, LlmClient, LlmPlanner, LlmSummarizer, PlannedTask, Planner, Summarizer,
};

/// 会话重置指令（整条消息精确匹配，大小写不敏感）
const RESET_COMMANDS: &[&str] = &["reset", "new chat", "清空"];

fn is_reset_command(text: &str) -> bool {
    RESET_COMMANDS
        .iter()
        .any(|cmd| text.eq_ignore_ascii_case(cmd))
}

/// 编排器：持有派发模式、会话存储与可插拔规划/汇总器（进程级单例）
pub struct Orchestrator {
    mode: RelayMode,
    dispatch: Arc<dyn Dispatch>,
    store: ConversationStore,
    planner: Option<Arc<dyn Planner>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    max_context_tokens: usize,
    max_reply_chars: usize,
}

impl Orchestrator {
    pub fn new(
        mode: RelayMode,
        dispatch: Arc<dyn Dispatch>,
        planner: Option<Arc<dyn Planner>>,
        summarizer: Option<Arc<dyn Summarizer>>,
        max_context_tokens: usize,
        max_reply_chars: usize,
    ) -> Self {
        Self {
            mode,
            dispatch,
            store: ConversationStore::new(),
            planner,
            summarizer,
            max_context_tokens,
            max_reply_chars,
        }
    }

    /// 从校验过的配置构建完整编排器（各前端共用的组装逻辑）
    pub fn from_config(cfg: &AppConfig) -> Result<Self, RelayError> {
        cfg.validate()?;
        let mode = cfg.relay_mode()?;

        match &mode {
            RelayMode::Single { endpoint } => {
                tracing::info!("Relay initialized (single-target mode, endpoint {})", endpoint);
            }
            RelayMode::Multi { registry } => {
                tracing::info!(
                    "Relay initialized (multi-target mode, targets: {}, default: {:?})",
                    registry.names().join(", "),
                    registry.default_target()
                );
            }
        }

        let dispatch = Arc::new(A2aClient::new(
            Duration::from_secs(cfg.agent.request_timeout_secs),
            cfg.cf_access(),
        )?);

        let (planner, summarizer): (Option<Arc<dyn Planner>>, Option<Arc<dyn Summarizer>>) =
            if cfg.planner.enabled {
                let timeout = Duration::from_secs(cfg.planner.timeout_secs);
                let make_llm = || {
                    LlmClient::new(
                        cfg.planner.base_url.as_deref(),
                        &cfg.planner.model,
                        None,
                        timeout,
                    )
                };
                tracing::info!("LLM planner/summarizer enabled ({})", cfg.planner.model);
                (
                    Some(Arc::new(LlmPlanner::new(make_llm()))),
                    Some(Arc::new(LlmSummarizer::new(make_llm()))),
                )
            } else {
                (None, None)
            };

        Ok(Self::new(
            mode,
            dispatch,
            planner,
            summarizer,
            cfg.agent.max_context_tokens,
            cfg.agent.max_reply_chars,
        ))
    }

    /// 会话存储只读访问（REPL 统计与测试用）
    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// 处理一条用户消息，返回最终回复文本。每条路径都以回复串收尾。
    pub async fn handle(&self, text: &str, thread_id: &str) -> String {
        let text = text.trim();
        if text.is_empty() {
            return "Please provide a message!".to_string();
        }

        if is_reset_command(text) {
            self.store.clear(thread_id, None);
            tracing::info!("Cleared conversation contexts for thread {}", thread_id);
            return "🧹 Conversation context cleared. Starting fresh.".to_string();
        }

        let plan = self.build_plan(text, thread_id).await;
        let plan = match self.settle_plan(plan, text) {
            Ok(plan) => plan,
            Err(reply) => return reply,
        };

        // 逐任务派发（不同目标可并发；写存储统一放在收集之后，
        // 同一 (thread, target) 键的写因此天然串行）
        let futures = plan.iter().map(|task| self.run_task(task, thread_id));
        let outcomes: Vec<TaskOutcome> = join_all(futures).await;

        for (task, outcome) in plan.iter().zip(&outcomes) {
            self.record_outcome(task, outcome, thread_id);
        }

        let reply = self.merge_outcomes(text, &outcomes).await;
        truncate_reply(&reply, self.max_reply_chars)
    }

    /// 步骤 1：产出原始计划。单目标模式是隐式单任务；多目标模式先试
    /// 可插拔规划器，失败降级到关键词规划器，永不向上抛错。
    async fn build_plan(&self, text: &str, thread_id: &str) -> Vec<PlannedTask> {
        let registry = match &self.mode {
            RelayMode::Single { .. } => {
                return vec![PlannedTask {
                    target: None,
                    query: text.to_string(),
                }]
            }
            RelayMode::Multi { registry } => registry,
        };

        let prior_targets = self.store.thread_targets(thread_id);

        if let Some(planner) = &self.planner {
            match planner.plan(text, registry, &prior_targets).await {
                Ok(plan) if !plan.is_empty() => return plan,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Planner failed, falling back to keyword planning: {}", e);
                }
            }
        }

        KeywordPlanner
            .plan(text, registry, &prior_targets)
            .await
            .unwrap_or_default()
    }

    /// 步骤 2：规范化计划。多目标模式下丢弃注册表之外的目标（warn-and-skip），
    /// 空计划回退默认目标；没有默认目标则给出"无法定位目标"回复。
    fn settle_plan(&self, plan: Vec<PlannedTask>, text: &str) -> Result<Vec<PlannedTask>, String> {
        let registry = match &self.mode {
            RelayMode::Single { .. } => return Ok(plan),
            RelayMode::Multi { registry } => registry,
        };

        let mut settled = Vec::with_capacity(plan.len());
        for task in plan {
            match task.target.as_deref() {
                Some(name) => match registry.get(name) {
                    Some(target) => settled.push(PlannedTask {
                        // 规范化为注册表中的写法
                        target: Some(target.name.clone()),
                        query: task.query,
                    }),
                    None => {
                        tracing::warn!("Planner named unknown target '{}', skipping task", name);
                    }
                },
                None => match registry.default_target() {
                    Some(default) => settled.push(PlannedTask {
                        target: Some(default.to_string()),
                        query: task.query,
                    }),
                    None => {
                        tracing::warn!(
                            "Planned task has no target and no default exists, skipping"
                        );
                    }
                },
            }
        }

        if settled.is_empty() {
            match registry.default_target() {
                Some(default) => settled.push(PlannedTask {
                    target: Some(default.to_string()),
                    query: text.to_string(),
                }),
                None => {
                    return Err(format!(
                        "⚠️ I couldn't tell which cluster you mean. Mention one of: {}",
                        registry.names().join(", ")
                    ))
                }
            }
        }

        Ok(settled)
    }

    /// 步骤 3：单任务执行。先查预算（超限则不触达远端），再带已存
    /// contextId 派发。
    async fn run_task(&self, task: &PlannedTask, thread_id: &str) -> TaskOutcome {
        let target = task.target.as_deref();

        let (over_budget, estimate) =
            self.store
                .check_budget(thread_id, target, self.max_context_tokens);
        if over_budget {
            tracing::warn!(
                "Thread {} target {:?} over token budget (≈{} tokens), skipping dispatch",
                thread_id,
                target,
                estimate.unwrap_or(0)
            );
            return TaskOutcome {
                response: Some(format!(
                    "⚠️ This conversation has grown too large (≈{} tokens). \
                     Say `reset` to start a fresh one.",
                    estimate.unwrap_or(0)
                )),
                status: TaskStatus::ContextOverflow,
                context_id: None,
                target: target.map(String::from),
            };
        }

        let endpoint = match (&self.mode, target) {
            (RelayMode::Single { endpoint }, _) => endpoint.clone(),
            (RelayMode::Multi { registry }, Some(name)) => match registry.endpoint_of(name) {
                Some(endpoint) => endpoint.to_string(),
                // settle_plan 已经丢弃未知目标，这里只可能是注册表被绕过
                None => {
                    return TaskOutcome {
                        response: Some(format!("Unknown target '{}'", name)),
                        status: TaskStatus::Error,
                        context_id: None,
                        target: target.map(String::from),
                    }
                }
            },
            (RelayMode::Multi { .. }, None) => {
                return TaskOutcome {
                    response: Some("No target resolved for task".to_string()),
                    status: TaskStatus::Error,
                    context_id: None,
                    target: None,
                }
            }
        };

        let context_id = self.store.get(thread_id, target).map(|s| s.context_id);
        self.dispatch
            .send(
                &endpoint,
                target,
                &task.query,
                thread_id,
                context_id.as_deref(),
            )
            .await
    }

    /// 结果入账：成功交换累计会话状态；token 限流则失效该目标的上下文
    fn record_outcome(&self, task: &PlannedTask, outcome: &TaskOutcome, thread_id: &str) {
        let target = task.target.as_deref();
        match outcome.status {
            TaskStatus::TokenLimit => {
                tracing::warn!(
                    "Remote token limit on thread {} target {:?}, invalidating stored context",
                    thread_id,
                    target
                );
                self.store.clear(thread_id, target);
            }
            TaskStatus::Completed => {
                let context_id = outcome
                    .context_id
                    .clone()
                    .or_else(|| self.store.get(thread_id, target).map(|s| s.context_id))
                    .unwrap_or_default();
                self.store.update(
                    thread_id,
                    target,
                    &context_id,
                    &task.query,
                    outcome.response.as_deref(),
                );
            }
            _ => {}
        }
    }

    /// 步骤 4/5：合并。单结果直通（保留远端原话，错误也原样传递）；
    /// 多结果优先走汇总器，失败降级为按目标分节拼接。
    async fn merge_outcomes(&self, text: &str, outcomes: &[TaskOutcome]) -> String {
        if outcomes.len() == 1 {
            return render_outcome(&outcomes[0]);
        }

        let answers: Vec<(String, String)> = outcomes
            .iter()
            .map(|o| {
                (
                    o.target.clone().unwrap_or_else(|| "agent".to_string()),
                    render_outcome(o),
                )
            })
            .collect();

        if let Some(summarizer) = &self.summarizer {
            match summarizer.summarize(text, &answers).await {
                Ok(merged) => return merged,
                Err(e) => {
                    tracing::warn!("Summarizer failed, presenting per-target sections: {}", e);
                }
            }
        }

        answers
            .iter()
            .map(|(target, text)| format!("*{}*:\n{}", target, text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// 单个结果的用户可见文本（保留原始 bot 的措辞框架）
fn render_outcome(outcome: &TaskOutcome) -> String {
    match (&outcome.status, &outcome.response) {
        (TaskStatus::Completed, Some(text)) => text.clone(),
        (TaskStatus::Failed, text) => format!(
            "❌ Task failed: {}",
            text.as_deref().unwrap_or("(no details)")
        ),
        (
            TaskStatus::Timeout
            | TaskStatus::Error
            | TaskStatus::TokenLimit
            | TaskStatus::ContextOverflow,
            Some(text),
        ) => text.clone(),
        (status, _) => format!("⚠️ No response received from agent (status: {})", status),
    }
}

/// 聊天层无法承载任意长消息：超限按字符截断并追加标记
fn truncate_reply(reply: &str, max_chars: usize) -> String {
    if reply.chars().count() <= max_chars {
        return reply.to_string();
    }
    let kept: String = reply.chars().take(max_chars).collect();
    format!("{}… [truncated]", kept.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::core::RelayError;
    use crate::routing::{Target, TargetRegistry};

    /// Mock 派发器：按目标名返回预设结果并记录调用
    struct MockDispatch {
        outcomes: HashMap<Option<String>, TaskOutcome>,
        calls: Mutex<Vec<(String, Option<String>, Option<String>)>>,
    }

    impl MockDispatch {
        fn new() -> Self {
            Self {
                outcomes: HashMap::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn completed(mut self, target: Option<&str>, response: &str, context_id: &str) -> Self {
            self.outcomes.insert(
                target.map(String::from),
                TaskOutcome {
                    response: Some(response.to_string()),
                    status: TaskStatus::Completed,
                    context_id: Some(context_id.to_string()),
                    target: target.map(String::from),
                },
            );
            self
        }

        fn with_outcome(mut self, target: Option<&str>, outcome: TaskOutcome) -> Self {
            self.outcomes.insert(target.map(String::from), outcome);
            self
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn calls(&self) -> Vec<(String, Option<String>, Option<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dispatch for MockDispatch {
        async fn send(
            &self,
            endpoint: &str,
            target: Option<&str>,
            _query: &str,
            _thread_id: &str,
            context_id: Option<&str>,
        ) -> TaskOutcome {
            self.calls.lock().unwrap().push((
                endpoint.to_string(),
                target.map(String::from),
                context_id.map(String::from),
            ));
            self.outcomes
                .get(&target.map(String::from))
                .cloned()
                .unwrap_or_else(|| TaskOutcome::empty(target.map(String::from)))
        }
    }

    /// 固定计划的桩规划器
    struct FixedPlanner(Vec<PlannedTask>);

    #[async_trait]
    impl Planner for FixedPlanner {
        async fn plan(
            &self,
            _text: &str,
            _registry: &TargetRegistry,
            _prior_targets: &[String],
        ) -> Result<Vec<PlannedTask>, RelayError> {
            Ok(self.0.clone())
        }
    }

    /// 总是失败的桩规划器
    struct FailingPlanner;

    #[async_trait]
    impl Planner for FailingPlanner {
        async fn plan(
            &self,
            _text: &str,
            _registry: &TargetRegistry,
            _prior_targets: &[String],
        ) -> Result<Vec<PlannedTask>, RelayError> {
            Err(RelayError::Planner("llm unavailable".to_string()))
        }
    }

    /// 总是失败的桩汇总器
    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(
            &self,
            _query: &str,
            _answers: &[(String, String)],
        ) -> Result<String, RelayError> {
            Err(RelayError::Planner("llm unavailable".to_string()))
        }
    }

    fn multi_mode(default: Option<&str>) -> RelayMode {
        RelayMode::Multi {
            registry: TargetRegistry::new(
                vec![
                    Target {
                        name: "dev".into(),
                        endpoint: "http://dev/api/a2a/kagent/agent/".into(),
                        aliases: vec![],
                    },
                    Target {
                        name: "prod".into(),
                        endpoint: "http://prod/api/a2a/kagent/agent/".into(),
                        aliases: vec![],
                    },
                ],
                default.map(String::from),
            )
            .unwrap(),
        }
    }

    fn single_mode() -> RelayMode {
        RelayMode::Single {
            endpoint: "http://host/api/a2a/kagent/agent/".to_string(),
        }
    }

    #[tokio::test]
    async fn test_single_target_completed_passthrough() {
        let dispatch = Arc::new(MockDispatch::new().completed(None, "3 pods running", "ctx-1"));
        let orch = Orchestrator::new(single_mode(), dispatch.clone(), None, None, 300_000, 12_000);

        let reply = orch.handle("how many pods?", "thread-1").await;

        assert_eq!(reply, "3 pods running");
        assert_eq!(dispatch.call_count(), 1);
        // 成功交换应建立会话状态
        let state = orch.store().get("thread-1", None).unwrap();
        assert_eq!(state.context_id, "ctx-1");
        assert_eq!(state.message_count, 1);
    }

    #[tokio::test]
    async fn test_context_id_reused_on_followup() {
        let dispatch = Arc::new(MockDispatch::new().completed(None, "done", "ctx-1"));
        let orch = Orchestrator::new(single_mode(), dispatch.clone(), None, None, 300_000, 12_000);

        orch.handle("first question", "thread-1").await;
        orch.handle("follow-up", "thread-1").await;

        let calls = dispatch.calls();
        assert_eq!(calls[0].2, None);
        assert_eq!(calls[1].2.as_deref(), Some("ctx-1"));
    }

    #[tokio::test]
    async fn test_multi_target_merge_contains_both() {
        let dispatch = Arc::new(
            MockDispatch::new()
                .completed(Some("dev"), "5 pods on dev", "ctx-d")
                .completed(Some("prod"), "12 pods on prod", "ctx-p"),
        );
        let planner = Arc::new(FixedPlanner(vec![
            PlannedTask {
                target: Some("dev".into()),
                query: "pods?".into(),
            },
            PlannedTask {
                target: Some("prod".into()),
                query: "pods?".into(),
            },
        ]));
        let orch = Orchestrator::new(
            multi_mode(Some("dev")),
            dispatch.clone(),
            Some(planner),
            None,
            300_000,
            12_000,
        );

        let reply = orch.handle("compare pods everywhere", "thread-1").await;

        assert!(reply.contains("*dev*"));
        assert!(reply.contains("*prod*"));
        assert!(reply.contains("5 pods on dev"));
        assert!(reply.contains("12 pods on prod"));
        assert_eq!(dispatch.call_count(), 2);
    }

    #[tokio::test]
    async fn test_summarizer_failure_degrades_to_sections() {
        let dispatch = Arc::new(
            MockDispatch::new()
                .completed(Some("dev"), "dev answer", "ctx-d")
                .completed(Some("prod"), "prod answer", "ctx-p"),
        );
        let planner = Arc::new(FixedPlanner(vec![
            PlannedTask {
                target: Some("dev".into()),
                query: "q".into(),
            },
            PlannedTask {
                target: Some("prod".into()),
                query: "q".into(),
            },
        ]));
        let orch = Orchestrator::new(
            multi_mode(None),
            dispatch,
            Some(planner),
            Some(Arc::new(FailingSummarizer)),
            300_000,
            12_000,
        );

        let reply = orch.handle("compare", "thread-1").await;
        assert!(reply.contains("*dev*:\ndev answer"));
        assert!(reply.contains("*prod*:\nprod answer"));
    }

    #[tokio::test]
    async fn test_keyword_fallback_when_planner_fails() {
        let dispatch = Arc::new(MockDispatch::new().completed(Some("prod"), "ok", "ctx"));
        let orch = Orchestrator::new(
            multi_mode(Some("dev")),
            dispatch.clone(),
            Some(Arc::new(FailingPlanner)),
            None,
            300_000,
            12_000,
        );

        let reply = orch.handle("show prod deployments", "thread-1").await;

        assert_eq!(reply, "ok");
        let calls = dispatch.calls();
        assert_eq!(calls[0].1.as_deref(), Some("prod"));
    }

    #[tokio::test]
    async fn test_unknown_planned_target_skipped_falls_back_to_default() {
        let dispatch = Arc::new(MockDispatch::new().completed(Some("dev"), "ok from dev", "ctx"));
        let planner = Arc::new(FixedPlanner(vec![PlannedTask {
            target: Some("ghost".into()),
            query: "q".into(),
        }]));
        let orch = Orchestrator::new(
            multi_mode(Some("dev")),
            dispatch.clone(),
            Some(planner),
            None,
            300_000,
            12_000,
        );

        let reply = orch.handle("whatever", "thread-1").await;

        assert_eq!(reply, "ok from dev");
        let calls = dispatch.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.as_deref(), Some("dev"));
    }

    #[tokio::test]
    async fn test_no_target_no_default_gives_guidance() {
        let dispatch = Arc::new(MockDispatch::new());
        let orch =
            Orchestrator::new(multi_mode(None), dispatch.clone(), None, None, 300_000, 12_000);

        let reply = orch.handle("list namespaces", "thread-1").await;

        assert!(reply.contains("dev"));
        assert!(reply.contains("prod"));
        assert_eq!(dispatch.call_count(), 0);
    }

    #[tokio::test]
    async fn test_budget_overflow_short_circuits_dispatch() {
        let dispatch = Arc::new(MockDispatch::new().completed(None, &"x".repeat(4000), "ctx"));
        // 预算极小：第一轮交换后即超限
        let orch = Orchestrator::new(single_mode(), dispatch.clone(), None, None, 100, 12_000);

        orch.handle("first", "thread-1").await;
        assert_eq!(dispatch.call_count(), 1);

        let reply = orch.handle("second", "thread-1").await;
        assert!(reply.contains("too large"));
        // 超限后不再触达远端
        assert_eq!(dispatch.call_count(), 1);
    }

    #[tokio::test]
    async fn test_token_limit_invalidates_stored_context() {
        let dispatch = Arc::new(MockDispatch::new().with_outcome(
            None,
            TaskOutcome {
                response: Some("Agent error: exceeded 30000 tokens per min".to_string()),
                status: TaskStatus::TokenLimit,
                context_id: None,
                target: None,
            },
        ));
        let orch = Orchestrator::new(single_mode(), dispatch, None, None, 300_000, 12_000);
        // 先手工建立一条上下文，再命中 token 限流
        orch.store().update("thread-1", None, "ctx-x", "m", None);
        assert!(orch.store().get("thread-1", None).is_some());

        let reply = orch.handle("next question", "thread-1").await;
        assert!(reply.contains("tokens per min"));
        assert!(orch.store().get("thread-1", None).is_none());
    }

    #[tokio::test]
    async fn test_reset_command_clears_thread() {
        let dispatch = Arc::new(MockDispatch::new().completed(None, "hello", "ctx-1"));
        let orch = Orchestrator::new(single_mode(), dispatch.clone(), None, None, 300_000, 12_000);

        orch.handle("hi", "thread-1").await;
        assert!(orch.store().get("thread-1", None).is_some());

        let reply = orch.handle("reset", "thread-1").await;
        assert!(reply.contains("cleared"));
        assert!(orch.store().get("thread-1", None).is_none());
        // reset 不触达远端
        assert_eq!(dispatch.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_status_framed() {
        let dispatch = Arc::new(MockDispatch::new().with_outcome(
            None,
            TaskOutcome {
                response: Some("kubectl blew up".to_string()),
                status: TaskStatus::Failed,
                context_id: None,
                target: None,
            },
        ));
        let orch = Orchestrator::new(single_mode(), dispatch, None, None, 300_000, 12_000);

        let reply = orch.handle("do it", "thread-1").await;
        assert_eq!(reply, "❌ Task failed: kubectl blew up");
    }

    #[tokio::test]
    async fn test_unknown_status_no_response() {
        let dispatch = Arc::new(MockDispatch::new());
        let orch = Orchestrator::new(single_mode(), dispatch, None, None, 300_000, 12_000);

        let reply = orch.handle("hello?", "thread-1").await;
        assert!(reply.contains("status: unknown"));
    }

    #[tokio::test]
    async fn test_reply_truncated_with_marker() {
        let dispatch = Arc::new(MockDispatch::new().completed(None, &"a".repeat(500), "ctx"));
        let orch = Orchestrator::new(single_mode(), dispatch, None, None, 300_000, 100);

        let reply = orch.handle("long answer please", "thread-1").await;
        assert!(reply.ends_with("… [truncated]"));
        assert!(reply.chars().count() < 500);
    }

    #[tokio::test]
    async fn test_empty_message_prompts_user() {
        let dispatch = Arc::new(MockDispatch::new());
        let orch = Orchestrator::new(single_mode(), dispatch.clone(), None, None, 300_000, 12_000);
        let reply = orch.handle("   ", "thread-1").await;
        assert!(reply.contains("message"));
        assert_eq!(dispatch.call_count(), 0);
    }
}
