//! Step Executor：单步工具调用循环
//!
//! 一轮 turn = 一次模型调用 + 零或多次顺序工具分发（同一 turn 内后面的调用可能依赖
//! 前面的结果，绝不并行）。工具失败不抛异常，折叠为 success=false 的 ToolResult
//! 喂回上下文让模型自行调整；直到模型给出非工具调用的终结回复，或 turn 上限 /
//! step_timeout_ms 耗尽（步骤标记 failed，运行继续）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Deserialize;

use crate::core::EngineError;
use crate::llm::{LlmClient, Message};
use crate::tools::ToolDispatcher;
use crate::workflow::events::{EventSink, WorkflowEvent};
use crate::workflow::guard::RunBudget;
use crate::workflow::planner::extract_json_block;
use crate::workflow::types::{PlanStep, StepStatus, ToolCall, ToolResult, WorkflowStep};

/// 运行级中断：取消或整体超时，向上传播并终止运行
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Cancelled,
    DeadlineExceeded,
}

/// 单步执行结果：执行记录 + 可选的运行级中断
pub struct StepRun {
    pub record: WorkflowStep,
    pub interrupt: Option<Interrupt>,
}

/// 模型单轮输出：一批顺序工具调用，或终结性文本
#[derive(Debug)]
pub enum TurnOutput {
    ToolCalls(Vec<RawToolCall>),
    Response(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawToolCallBatch {
    tool_calls: Vec<RawToolCall>,
}

/// 解析模型单轮输出：合法的 tool_calls JSON（批量或单个）为工具调用，
/// 其余一律视为终结回复（步骤结束）
pub fn parse_turn_output(output: &str) -> TurnOutput {
    let trimmed = output.trim();
    if let Some(json_str) = extract_json_block(trimmed) {
        if let Ok(batch) = serde_json::from_str::<RawToolCallBatch>(json_str) {
            if !batch.tool_calls.is_empty() {
                return TurnOutput::ToolCalls(batch.tool_calls);
            }
        }
        if let Ok(single) = serde_json::from_str::<RawToolCall>(json_str) {
            if !single.tool.is_empty() {
                return TurnOutput::ToolCalls(vec![single]);
            }
        }
    }
    TurnOutput::Response(trimmed.to_string())
}

/// Step Executor：持有 LLM 与工具分发器
pub struct StepExecutor {
    llm: Arc<dyn LlmClient>,
    dispatcher: Arc<ToolDispatcher>,
}

impl StepExecutor {
    pub fn new(llm: Arc<dyn LlmClient>, dispatcher: Arc<ToolDispatcher>) -> Self {
        Self { llm, dispatcher }
    }

    /// 执行一个计划步骤；context 为跨步骤累积的对话（本函数会向其追加本步内容）
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_step(
        &self,
        step: &PlanStep,
        execution_index: usize,
        context: &mut Vec<Message>,
        max_turns: usize,
        step_timeout_ms: u64,
        sink: &EventSink,
        budget: &RunBudget,
    ) -> StepRun {
        let started = Instant::now();
        let step_deadline = Duration::from_millis(step_timeout_ms);
        let mut record = WorkflowStep {
            plan_step_id: step.id.clone(),
            execution_index,
            description: step.description.clone(),
            status: StepStatus::Running,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            output: None,
            reflection: None,
            error: None,
        };

        context.push(Message::user(format!(
            "Current step: {}\nSuccess criteria: {}\n\
             Use tool calls if needed; when the step is done, reply with a plain-text result.",
            step.description,
            if step.success_criteria.is_empty() {
                "(none)"
            } else {
                &step.success_criteria
            }
        )));

        for turn in 0..max_turns {
            if let Some(interrupt) = check_interrupt(budget) {
                finish(&mut record, StepStatus::Failed, Some(interrupt_error(interrupt)));
                return StepRun { record, interrupt: Some(interrupt) };
            }
            if started.elapsed() >= step_deadline {
                finish(
                    &mut record,
                    StepStatus::Failed,
                    Some(format!("step timed out after {}ms", step_timeout_ms)),
                );
                return StepRun { record, interrupt: None };
            }

            let cap = step_deadline.saturating_sub(started.elapsed());
            let output = match budget.complete(&self.llm, context, Some(cap)).await {
                Ok(o) => o,
                Err(EngineError::Cancelled) => {
                    finish(&mut record, StepStatus::Failed, Some("cancelled".to_string()));
                    return StepRun { record, interrupt: Some(Interrupt::Cancelled) };
                }
                Err(EngineError::DeadlineExceeded) => {
                    finish(&mut record, StepStatus::Failed, Some("workflow timed out".to_string()));
                    return StepRun { record, interrupt: Some(Interrupt::DeadlineExceeded) };
                }
                Err(EngineError::ToolTimeout(_)) => {
                    // 步骤预算内未等到模型回复
                    finish(
                        &mut record,
                        StepStatus::Failed,
                        Some(format!("step timed out after {}ms", step_timeout_ms)),
                    );
                    return StepRun { record, interrupt: None };
                }
                Err(e) => {
                    finish(&mut record, StepStatus::Failed, Some(e.to_string()));
                    return StepRun { record, interrupt: None };
                }
            };

            match parse_turn_output(&output) {
                TurnOutput::Response(text) => {
                    context.push(Message::assistant(text.clone()));
                    record.output = Some(text);
                    finish(&mut record, StepStatus::Success, None);
                    return StepRun { record, interrupt: None };
                }
                TurnOutput::ToolCalls(calls) => {
                    for raw in calls {
                        // 取消一经观察到即不再分发后续调用
                        if let Some(interrupt) = check_interrupt(budget) {
                            finish(&mut record, StepStatus::Failed, Some(interrupt_error(interrupt)));
                            return StepRun { record, interrupt: Some(interrupt) };
                        }
                        let call = ToolCall {
                            id: uuid::Uuid::new_v4().to_string(),
                            name: raw.tool.clone(),
                            arguments: raw.args.clone(),
                            step_id: step.id.clone(),
                            call_index: record.tool_calls.len(),
                            started_at: Utc::now(),
                        };
                        sink.emit(WorkflowEvent::ToolCall {
                            step_id: step.id.clone(),
                            turn,
                            call: call.clone(),
                        });
                        record.tool_calls.push(call.clone());

                        let result = match budget
                            .dispatch(&self.dispatcher, &raw.tool, raw.args.clone())
                            .await
                        {
                            Ok(content) => ToolResult {
                                call_id: call.id.clone(),
                                success: true,
                                content,
                                error: None,
                            },
                            Err(EngineError::Cancelled) => {
                                // 在途调用的结果直接丢弃
                                finish(&mut record, StepStatus::Failed, Some("cancelled".to_string()));
                                return StepRun { record, interrupt: Some(Interrupt::Cancelled) };
                            }
                            Err(EngineError::DeadlineExceeded) => {
                                finish(
                                    &mut record,
                                    StepStatus::Failed,
                                    Some("workflow timed out".to_string()),
                                );
                                return StepRun {
                                    record,
                                    interrupt: Some(Interrupt::DeadlineExceeded),
                                };
                            }
                            // 工具失败优雅折叠进对话，不中断步骤
                            Err(e) => ToolResult {
                                call_id: call.id.clone(),
                                success: false,
                                content: String::new(),
                                error: Some(e.to_string()),
                            },
                        };
                        sink.emit(WorkflowEvent::ToolResult {
                            step_id: step.id.clone(),
                            result: result.clone(),
                        });

                        let observation = if result.success {
                            result.content.clone()
                        } else {
                            format!("Error: {}", result.error.as_deref().unwrap_or("unknown"))
                        };
                        record.tool_results.push(result);
                        context.push(Message::assistant(format!(
                            "Tool call: {} | Result: {}",
                            raw.tool,
                            preview(&observation)
                        )));
                        context.push(Message::user(format!(
                            "Observation from {}: {}",
                            raw.tool, observation
                        )));
                    }
                }
            }
        }

        finish(
            &mut record,
            StepStatus::Failed,
            Some(format!("turn limit reached ({})", max_turns)),
        );
        StepRun { record, interrupt: None }
    }
}

fn check_interrupt(budget: &RunBudget) -> Option<Interrupt> {
    match budget.check() {
        Ok(()) => None,
        Err(EngineError::Cancelled) => Some(Interrupt::Cancelled),
        Err(_) => Some(Interrupt::DeadlineExceeded),
    }
}

fn interrupt_error(interrupt: Interrupt) -> String {
    match interrupt {
        Interrupt::Cancelled => "cancelled".to_string(),
        Interrupt::DeadlineExceeded => "workflow timed out".to_string(),
    }
}

fn finish(record: &mut WorkflowStep, status: StepStatus, error: Option<String>) {
    record.status = status;
    record.error = error;
    let now = Utc::now();
    record.completed_at = Some(now);
    record.duration_ms = Some((now - record.started_at).num_milliseconds().max(0) as u64);
}

fn preview(s: &str) -> String {
    const MAX: usize = 200;
    if s.chars().count() > MAX {
        format!("{}...", s.chars().take(MAX).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::tools::{EchoTool, Tool, ToolRegistry};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct FailTool;

    #[async_trait]
    impl Tool for FailTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        async fn execute(&self, _args: serde_json::Value) -> Result<String, String> {
            Err("simulated failure".to_string())
        }
    }

    fn dispatcher() -> Arc<ToolDispatcher> {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(FailTool);
        Arc::new(ToolDispatcher::new(registry, 5))
    }

    fn plan_step(description: &str) -> PlanStep {
        PlanStep {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.to_string(),
            expected_tools: vec![],
            depends_on: vec![],
            success_criteria: String::new(),
        }
    }

    fn budget() -> RunBudget {
        RunBudget::new(CancellationToken::new(), 60_000)
    }

    #[test]
    fn test_parse_turn_output_variants() {
        assert!(matches!(
            parse_turn_output(r#"{"tool_calls": [{"tool": "echo", "args": {"text": "a"}}]}"#),
            TurnOutput::ToolCalls(calls) if calls.len() == 1
        ));
        assert!(matches!(
            parse_turn_output(r#"{"tool": "echo", "args": {"text": "a"}}"#),
            TurnOutput::ToolCalls(calls) if calls.len() == 1
        ));
        assert!(matches!(
            parse_turn_output("All done, the answer is 42."),
            TurnOutput::Response(_)
        ));
        // 空 tool_calls 数组不是工具调用
        assert!(matches!(
            parse_turn_output(r#"{"tool_calls": []}"#),
            TurnOutput::Response(_)
        ));
    }

    #[tokio::test]
    async fn test_step_tool_call_then_response() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::with_responses(vec![
            r#"{"tool_calls": [{"tool": "echo", "args": {"text": "pong"}}]}"#,
            "The echo returned pong.",
        ]));
        let executor = StepExecutor::new(llm, dispatcher());
        let (sink, mut rx) = EventSink::channel();
        let mut context = vec![Message::system("test")];
        let run = executor
            .execute_step(&plan_step("ping the echo tool"), 0, &mut context, 8, 60_000, &sink, &budget())
            .await;

        assert!(run.interrupt.is_none());
        assert_eq!(run.record.status, StepStatus::Success);
        assert_eq!(run.record.tool_calls.len(), 1);
        assert_eq!(run.record.tool_results.len(), 1);
        assert!(run.record.tool_results[0].success);
        assert_eq!(run.record.output.as_deref(), Some("The echo returned pong."));
        // 每个 ToolCall 至多一条对应 ToolResult
        assert_eq!(
            run.record.tool_results[0].call_id,
            run.record.tool_calls[0].id
        );

        drop(sink);
        let mut tool_events = 0;
        while let Some(ev) = rx.recv().await {
            if matches!(ev, WorkflowEvent::ToolCall { .. } | WorkflowEvent::ToolResult { .. }) {
                tool_events += 1;
            }
        }
        assert_eq!(tool_events, 2);
    }

    #[tokio::test]
    async fn test_tool_failure_is_fed_back_not_fatal() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::with_responses(vec![
            r#"{"tool_calls": [{"tool": "flaky", "args": {}}]}"#,
            "Recovered without the tool.",
        ]));
        let executor = StepExecutor::new(llm, dispatcher());
        let (sink, _rx) = EventSink::channel();
        let mut context = vec![Message::system("test")];
        let run = executor
            .execute_step(&plan_step("try the flaky tool"), 0, &mut context, 8, 60_000, &sink, &budget())
            .await;

        // 失败结果带非空 error，但步骤因模型恢复而成功
        assert_eq!(run.record.status, StepStatus::Success);
        assert!(!run.record.tool_results[0].success);
        assert!(run.record.tool_results[0].error.as_deref().unwrap().len() > 0);
        // 失败以 Error: 前缀喂回了上下文
        assert!(context
            .iter()
            .any(|m| m.content.starts_with("Observation from flaky: Error:")));
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_failed_result() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::with_responses(vec![
            r#"{"tool_calls": [{"tool": "no_such_tool", "args": {}}]}"#,
            "Gave up on that tool.",
        ]));
        let executor = StepExecutor::new(llm, dispatcher());
        let (sink, _rx) = EventSink::channel();
        let mut context = vec![Message::system("test")];
        let run = executor
            .execute_step(&plan_step("use a hallucinated tool"), 0, &mut context, 8, 60_000, &sink, &budget())
            .await;

        assert_eq!(run.record.status, StepStatus::Success);
        assert!(!run.record.tool_results[0].success);
        assert!(run.record.tool_results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_turn_limit_marks_step_failed() {
        // 模型永远要求工具调用
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::with_responses(vec![
            r#"{"tool_calls": [{"tool": "echo", "args": {"text": "again"}}]}"#;
            5
        ]));
        let executor = StepExecutor::new(llm, dispatcher());
        let (sink, _rx) = EventSink::channel();
        let mut context = vec![Message::system("test")];
        let run = executor
            .execute_step(&plan_step("loop forever"), 0, &mut context, 3, 60_000, &sink, &budget())
            .await;

        assert!(run.interrupt.is_none());
        assert_eq!(run.record.status, StepStatus::Failed);
        assert!(run.record.error.as_deref().unwrap().contains("turn limit"));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_step() {
        let token = CancellationToken::new();
        token.cancel();
        let budget = RunBudget::new(token, 60_000);
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new());
        let executor = StepExecutor::new(llm, dispatcher());
        let (sink, _rx) = EventSink::channel();
        let mut context = vec![];
        let run = executor
            .execute_step(&plan_step("anything"), 0, &mut context, 8, 60_000, &sink, &budget)
            .await;

        assert_eq!(run.interrupt, Some(Interrupt::Cancelled));
        assert_eq!(run.record.status, StepStatus::Failed);
    }
}
