//! The bounded reasoning loop.
//!
//! One run repeats build context → call model → dispatch tools → decide,
//! up to a fixed iteration cap. Escalation is explicit: unknown tools end
//! the run at once, repeated all-failed batches trip a circuit breaker,
//! accumulated policy refusals stop the run, and an exhausted cap yields
//! a partial-progress summary instead of silence. Every terminal path
//! persists the `(user, answer)` pair to the task's history.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::arguments::parse_tool_arguments;
use crate::agent::prompt::system_prompt;
use crate::agent::{truncate_preview, AgentRunResult, AgentStatus, ToolCallFact};
use crate::api::{ChatMessage, ChatModel};
use crate::core::config::AgentSettings;
use crate::core::constants::{BLOCKED_STOP_THRESHOLD, MAX_CONSECUTIVE_FAILED_BATCHES};
use crate::history::{HistoryStore, HistoryTurn};
use crate::tools::{ToolCall, ToolContext, ToolRegistry, ToolResult};

pub struct AgentRequest {
    pub user_message: String,
    /// Side-channel constraint or context blocks, injected after the
    /// system instruction.
    pub context_blocks: Vec<String>,
    pub cancel_token: Option<CancellationToken>,
}

impl AgentRequest {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            context_blocks: Vec::new(),
            cancel_token: None,
        }
    }

    pub fn with_context_block(mut self, block: impl Into<String>) -> Self {
        self.context_blocks.push(block.into());
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }
}

pub struct AgentRunner {
    registry: Arc<ToolRegistry>,
    history: Arc<HistoryStore>,
    settings: AgentSettings,
}

impl AgentRunner {
    pub fn new(
        registry: Arc<ToolRegistry>,
        history: Arc<HistoryStore>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            registry,
            history,
            settings,
        }
    }

    /// Drives one run to a terminal status. The only error is external
    /// cancellation; every other outcome is an [`AgentRunResult`].
    pub async fn run(
        &self,
        model: &dyn ChatModel,
        context: &ToolContext,
        request: AgentRequest,
    ) -> Result<AgentRunResult, String> {
        let cancel = request.cancel_token.clone();
        let prior = match self.history.load(&context.task_id).await {
            Ok(turns) => turns,
            Err(err) => {
                warn!("Could not load history for '{}': {}", context.task_id, err);
                Vec::new()
            }
        };
        let definitions = self.registry.definitions(&context.allow_list);
        let tool_names = self.registry.tool_names(&context.allow_list);

        let mut scratchpad: Vec<ChatMessage> = Vec::new();
        let mut facts: Vec<ToolCallFact> = Vec::new();
        let mut blocked_count = 0usize;
        let mut consecutive_all_failed = 0usize;
        let mut last_failure = String::new();

        for iteration in 0..self.settings.max_iterations {
            let messages =
                self.build_messages(&tool_names, context, &request, &prior, &scratchpad);

            let Some(model_result) =
                run_cancellable(model.complete(&messages, &definitions), cancel.as_ref()).await
            else {
                return Err("Run cancelled.".to_string());
            };
            let turn = match model_result {
                Ok(turn) => turn,
                Err(err) => {
                    let output = format!("Model request failed: {}", err);
                    return Ok(self
                        .finish(context, &request, output, AgentStatus::Error, facts)
                        .await);
                }
            };

            if turn.tool_calls.is_empty() {
                let output = turn.content.unwrap_or_default();
                return Ok(self
                    .finish(context, &request, output, AgentStatus::Ok, facts)
                    .await);
            }

            debug!(
                "Iteration {}: dispatching {} tool calls",
                iteration + 1,
                turn.tool_calls.len()
            );
            let model_text = turn
                .content
                .as_deref()
                .is_some_and(|text| !text.trim().is_empty());
            scratchpad.push(ChatMessage::assistant_tool_calls(
                turn.content.clone(),
                turn.tool_calls.clone(),
            ));

            let calls: Vec<ToolCall> = turn
                .tool_calls
                .iter()
                .map(|call| {
                    ToolCall::new(
                        &call.id,
                        &call.function.name,
                        parse_tool_arguments(&call.function.arguments),
                    )
                })
                .collect();

            let Some(results) =
                run_cancellable(self.registry.execute_many(&calls, context), cancel.as_ref())
                    .await
            else {
                return Err("Run cancelled.".to_string());
            };

            let mut unknown_tool: Option<String> = None;
            for (call, result) in calls.iter().zip(&results) {
                facts.push(fact_for(call, result));
                if result.is_unknown_tool() {
                    unknown_tool = Some(call.name.clone());
                }
                if !result.success {
                    last_failure = result
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("Tool '{}' failed.", call.name));
                }
                let mut content = if result.success {
                    result.output.clone().unwrap_or_default()
                } else {
                    format!(
                        "Error: {}",
                        result.error.as_deref().unwrap_or("tool failed")
                    )
                };
                if result.is_blocked() {
                    blocked_count += 1;
                    content.push_str(
                        "\nThis action was declined by policy. \
                         Do not retry it or attempt a workaround.",
                    );
                }
                scratchpad.push(ChatMessage::tool(&call.id, content));
            }

            if let Some(name) = unknown_tool {
                let output = format!(
                    "The model requested a tool that does not exist: '{}'.",
                    name
                );
                return Ok(self
                    .finish(context, &request, output, AgentStatus::Error, facts)
                    .await);
            }

            let all_failed = results.iter().all(|result| !result.success);
            if all_failed && !model_text {
                consecutive_all_failed += 1;
                if consecutive_all_failed >= MAX_CONSECUTIVE_FAILED_BATCHES {
                    let output = format!(
                        "Every tool call failed in {} consecutive iterations. Last failure: {}",
                        consecutive_all_failed, last_failure
                    );
                    return Ok(self
                        .finish(context, &request, output, AgentStatus::Error, facts)
                        .await);
                }
            } else {
                consecutive_all_failed = 0;
            }

            if blocked_count >= BLOCKED_STOP_THRESHOLD {
                let output =
                    "The requested actions were declined by policy; stopping instead of retrying."
                        .to_string();
                return Ok(self
                    .finish(context, &request, output, AgentStatus::Blocked, facts)
                    .await);
            }
        }

        let output = partial_summary(self.settings.max_iterations, &facts);
        Ok(self
            .finish(context, &request, output, AgentStatus::Partial, facts)
            .await)
    }

    fn build_messages(
        &self,
        tool_names: &[String],
        context: &ToolContext,
        request: &AgentRequest,
        prior: &[HistoryTurn],
        scratchpad: &[ChatMessage],
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(system_prompt(
            tool_names,
            &context.workdir,
        ))];
        for block in &request.context_blocks {
            messages.push(ChatMessage::system(block.clone()));
        }
        for turn in prior {
            messages.push(ChatMessage::user(turn.user.clone()));
            messages.push(ChatMessage::assistant(turn.assistant.clone()));
        }
        messages.push(ChatMessage::user(request.user_message.clone()));
        messages.extend(scratchpad.iter().cloned());
        messages
    }

    async fn finish(
        &self,
        context: &ToolContext,
        request: &AgentRequest,
        output: String,
        status: AgentStatus,
        tool_calls: Vec<ToolCallFact>,
    ) -> AgentRunResult {
        if let Err(err) = self
            .history
            .append(
                &context.task_id,
                HistoryTurn::new(&request.user_message, &output),
            )
            .await
        {
            warn!("Could not persist history for '{}': {}", context.task_id, err);
        }
        AgentRunResult {
            output,
            status,
            tool_calls,
        }
    }
}

fn fact_for(call: &ToolCall, result: &ToolResult) -> ToolCallFact {
    ToolCallFact {
        name: call.name.clone(),
        arguments: truncate_preview(
            &serde_json::Value::Object(call.arguments.clone()).to_string(),
        ),
        success: result.success,
        error: result.error.clone(),
        output: result.output.as_deref().map(truncate_preview),
    }
}

fn partial_summary(cap: usize, facts: &[ToolCallFact]) -> String {
    let mut summary = format!(
        "Reached the limit of {} iterations without a final answer.",
        cap
    );
    if facts.is_empty() {
        summary.push_str(" No tool calls were made.");
        return summary;
    }
    summary.push_str(" Recent tool activity:");
    let skip = facts.len().saturating_sub(3);
    for fact in &facts[skip..] {
        let detail = if fact.success {
            fact.output.clone().unwrap_or_default()
        } else {
            format!("failed: {}", fact.error.as_deref().unwrap_or("unknown"))
        };
        summary.push_str(&format!(
            "\n- {}({}) -> {}",
            fact.name, fact.arguments, detail
        ));
    }
    summary
}

/// Awaits the future unless the token fires first; `None` means the run
/// was cancelled and in-flight work is abandoned.
async fn run_cancellable<F, T>(future: F, cancel: Option<&CancellationToken>) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    match cancel {
        Some(token) => {
            tokio::select! {
                // Cancellation wins when both are ready.
                biased;
                _ = token.cancelled() => None,
                value = future => Some(value),
            }
        }
        None => Some(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ChatToolCall, ChatToolDefinition, ModelTurn};
    use crate::core::services::SharedServices;
    use crate::tools::{AllowList, Tool, ToolSpec};
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct ScriptedModel {
        turns: Mutex<VecDeque<Result<ModelTurn, String>>>,
    }

    impl ScriptedModel {
        fn new(turns: Vec<Result<ModelTurn, String>>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ChatToolDefinition],
        ) -> Result<ModelTurn, String> {
            self.turns
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| Err("script exhausted".to_string()))
        }
    }

    fn call(name: &str, arguments: &str) -> ModelTurn {
        ModelTurn::calls(vec![ChatToolCall::function_call("call-1", name, arguments)])
    }

    struct FlakyTool {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("ping", "Checks connectivity")
        }
        async fn execute(&self, _arguments: Map<String, Value>, _context: ToolContext) -> ToolResult {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                ToolResult::fail("transient outage")
            } else {
                ToolResult::ok("pong")
            }
        }
    }

    struct SteadyTool;

    #[async_trait]
    impl Tool for SteadyTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("probe", "Always answers")
        }
        async fn execute(&self, _arguments: Map<String, Value>, _context: ToolContext) -> ToolResult {
            ToolResult::ok("reading: 42")
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("broken", "Never works")
        }
        async fn execute(&self, _arguments: Map<String, Value>, _context: ToolContext) -> ToolResult {
            ToolResult::fail("disk unavailable")
        }
    }

    struct RefusingTool;

    #[async_trait]
    impl Tool for RefusingTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("erase", "Destroys data")
        }
        async fn execute(&self, _arguments: Map<String, Value>, _context: ToolContext) -> ToolResult {
            ToolResult::blocked("erasing is not permitted")
        }
    }

    struct Harness {
        _dir: TempDir,
        runner: AgentRunner,
        history: Arc<HistoryStore>,
        context: ToolContext,
    }

    fn harness(tools: Vec<Box<dyn Tool>>, max_iterations: usize) -> Harness {
        let dir = TempDir::new().expect("temp dir");
        let services = Arc::new(SharedServices::new());
        let mut registry = ToolRegistry::new(Arc::clone(&services));
        for tool in tools {
            registry.register(tool).expect("register");
        }
        let history = Arc::new(HistoryStore::new(dir.path(), 20));
        let runner = AgentRunner::new(
            Arc::new(registry),
            Arc::clone(&history),
            AgentSettings {
                max_iterations,
                history_turns: 20,
                tool_timeout_seconds: 5,
            },
        );
        let context = ToolContext::new(dir.path(), dir.path(), "task-1", services)
            .with_allow_list(AllowList::All);
        Harness {
            _dir: dir,
            runner,
            history,
            context,
        }
    }

    #[tokio::test]
    async fn text_only_response_ends_ok() {
        let h = harness(vec![Box::new(SteadyTool)], 8);
        let model = ScriptedModel::new(vec![Ok(ModelTurn::text("Done."))]);

        let result = h
            .runner
            .run(&model, &h.context, AgentRequest::new("finish up"))
            .await
            .expect("run");
        assert_eq!(result.status, AgentStatus::Ok);
        assert_eq!(result.output, "Done.");
        assert!(result.tool_calls.is_empty());

        let turns = h.history.load("task-1").await.expect("history");
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].assistant, "Done.");
    }

    #[tokio::test]
    async fn a_single_transient_failure_does_not_abort() {
        let h = harness(
            vec![Box::new(FlakyTool {
                attempts: AtomicUsize::new(0),
            })],
            8,
        );
        let model = ScriptedModel::new(vec![
            Ok(call("ping", "{}")),
            Ok(call("ping", "{}")),
            Ok(ModelTurn::text("The service is reachable.")),
        ]);

        let result = h
            .runner
            .run(&model, &h.context, AgentRequest::new("is it up?"))
            .await
            .expect("run");
        assert_eq!(result.status, AgentStatus::Ok);
        assert_eq!(result.output, "The service is reachable.");
        assert_eq!(result.tool_calls.len(), 2);
        assert!(!result.tool_calls[0].success);
        assert!(result.tool_calls[1].success);
    }

    #[tokio::test]
    async fn unknown_tool_ends_error_within_one_iteration() {
        let h = harness(vec![Box::new(SteadyTool)], 8);
        let model = ScriptedModel::new(vec![Ok(call("teleport", "{}"))]);

        let result = h
            .runner
            .run(&model, &h.context, AgentRequest::new("go"))
            .await
            .expect("run");
        assert_eq!(result.status, AgentStatus::Error);
        assert!(result.output.contains("teleport"));
        assert_eq!(result.tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_cap_ends_partial_with_a_summary() {
        let h = harness(vec![Box::new(SteadyTool)], 3);
        let model = ScriptedModel::new(vec![
            Ok(call("probe", "{}")),
            Ok(call("probe", "{}")),
            Ok(call("probe", "{}")),
        ]);

        let result = h
            .runner
            .run(&model, &h.context, AgentRequest::new("keep probing"))
            .await
            .expect("run");
        assert_eq!(result.status, AgentStatus::Partial);
        assert!(result.output.contains("3 iterations"));
        assert!(result.output.contains("probe"));
        assert_eq!(result.tool_calls.len(), 3);
    }

    #[tokio::test]
    async fn three_consecutive_all_failed_batches_end_error() {
        let h = harness(vec![Box::new(FailingTool)], 8);
        let model = ScriptedModel::new(vec![
            Ok(call("broken", "{}")),
            Ok(call("broken", "{}")),
            Ok(call("broken", "{}")),
        ]);

        let result = h
            .runner
            .run(&model, &h.context, AgentRequest::new("try anyway"))
            .await
            .expect("run");
        assert_eq!(result.status, AgentStatus::Error);
        assert!(result.output.contains("disk unavailable"));
        assert_eq!(result.tool_calls.len(), 3);
    }

    #[tokio::test]
    async fn accumulated_refusals_end_blocked() {
        let h = harness(vec![Box::new(RefusingTool)], 8);
        let model = ScriptedModel::new(vec![
            Ok(call("erase", "{}")),
            Ok(call("erase", "{}")),
        ]);

        let result = h
            .runner
            .run(&model, &h.context, AgentRequest::new("erase it all"))
            .await
            .expect("run");
        assert_eq!(result.status, AgentStatus::Blocked);
        assert_eq!(result.tool_calls.len(), 2);
    }

    #[tokio::test]
    async fn model_transport_error_ends_error() {
        let h = harness(vec![Box::new(SteadyTool)], 8);
        let model = ScriptedModel::new(vec![Err("connection reset".to_string())]);

        let result = h
            .runner
            .run(&model, &h.context, AgentRequest::new("hello"))
            .await
            .expect("run");
        assert_eq!(result.status, AgentStatus::Error);
        assert!(result.output.contains("connection reset"));
    }

    #[tokio::test]
    async fn cancellation_abandons_the_run_without_history() {
        let h = harness(vec![Box::new(SteadyTool)], 8);
        let model = ScriptedModel::new(vec![Ok(ModelTurn::text("never seen"))]);
        let token = CancellationToken::new();
        token.cancel();

        let err = h
            .runner
            .run(
                &model,
                &h.context,
                AgentRequest::new("stop me").with_cancel_token(token),
            )
            .await
            .expect_err("cancelled");
        assert!(err.contains("cancelled"));
        assert!(h.history.load("task-1").await.expect("history").is_empty());
    }

    #[tokio::test]
    async fn malformed_arguments_are_repaired_before_dispatch() {
        let h = harness(vec![Box::new(SteadyTool)], 8);
        let model = ScriptedModel::new(vec![
            Ok(call("probe", "{'target': 'db', }")),
            Ok(ModelTurn::text("checked")),
        ]);

        let result = h
            .runner
            .run(&model, &h.context, AgentRequest::new("check the db"))
            .await
            .expect("run");
        assert_eq!(result.status, AgentStatus::Ok);
        assert!(result.tool_calls[0].arguments.contains("target"));
    }
}
