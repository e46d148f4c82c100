//! 工作流引擎端到端测试：脚本化 LLM + 真实 Orchestrator / 持久化
//!
//! 覆盖：完整计划-执行-反思-流式回复链路、工具失败触发重规划、
//! 运行中取消、整体超时、单活跃运行约束，以及 NDJSON 行协议的消费端折叠。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use mantis::core::EngineError;
use mantis::llm::{LlmClient, MockLlmClient};
use mantis::store::{HistoryStore, SnapshotStore};
use mantis::tools::{EchoTool, Tool, ToolDispatcher, ToolRegistry};
use mantis::workflow::events::{encode_event_line, EventFold, EventSink, WorkflowEvent};
use mantis::workflow::types::{StepStatus, WorkflowConfig, WorkflowStatus};
use mantis::workflow::Orchestrator;

struct FlakyTool;

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        "flaky"
    }
    fn description(&self) -> &str {
        "always fails"
    }
    async fn execute(&self, _args: serde_json::Value) -> Result<String, String> {
        Err("backend unreachable".to_string())
    }
}

struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "takes a long time"
    }
    async fn execute(&self, _args: serde_json::Value) -> Result<String, String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("finally".to_string())
    }
}

fn build_orchestrator(responses: Vec<&str>) -> (Arc<Orchestrator>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::with_responses(responses));
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(FlakyTool);
    registry.register(SlowTool);
    let orchestrator = Orchestrator::new(
        llm,
        ToolDispatcher::new(registry, 60),
        SnapshotStore::new(dir.path().join("snapshots")),
        HistoryStore::new(dir.path().join("history.jsonl")),
    );
    (Arc::new(orchestrator), dir)
}

async fn drain(mut rx: tokio::sync::mpsc::UnboundedReceiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    events
}

#[tokio::test]
async fn full_run_streams_ordered_events() {
    let (orchestrator, _dir) = build_orchestrator(vec![
        // 计划：两步，第二步依赖第一步
        r#"{"steps": [
            {"description": "echo the greeting", "expected_tools": ["echo"], "success_criteria": "echo returned the text"},
            {"description": "compose a reply", "depends_on": [0], "success_criteria": "reply written"}
        ]}"#,
        // 步骤 1：一次工具调用，然后终结回复
        r#"{"tool_calls": [{"tool": "echo", "args": {"text": "hello"}}]}"#,
        "Echo returned: hello.",
        r#"{"assessment": "success", "next_action": "continue", "comment": "criteria met"}"#,
        // 步骤 2：纯文本完成
        "Composed the reply.",
        r#"{"assessment": "success", "next_action": "complete"}"#,
        // 最终回复（流式）
        "Hello! The echo round-trip worked.",
    ]);

    let (sink, rx) = EventSink::channel();
    let state = orchestrator
        .run("conv-full", "greet me via echo", WorkflowConfig::default(), &sink)
        .await
        .unwrap();
    drop(sink);
    let events = drain(rx).await;

    assert_eq!(state.status, WorkflowStatus::Done);
    assert_eq!(state.steps.len(), 2);
    assert!(state.steps.iter().all(|s| s.status == StepStatus::Success));
    assert_eq!(
        state.final_answer.as_deref(),
        Some("Hello! The echo round-trip worked.")
    );

    // 事件顺序：start 开头、end 收尾，plan 先于首个 step_start，
    // 每个 step_start 都有对应 step_end，message 全部在 workflow_end 之前
    assert!(matches!(events.first(), Some(WorkflowEvent::WorkflowStart { .. })));
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::WorkflowEnd { status: WorkflowStatus::Done, .. })
    ));
    let plan_pos = events
        .iter()
        .position(|e| matches!(e, WorkflowEvent::Plan { .. }))
        .unwrap();
    let first_step_pos = events
        .iter()
        .position(|e| matches!(e, WorkflowEvent::StepStart { .. }))
        .unwrap();
    assert!(plan_pos < first_step_pos);
    let starts = events
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::StepStart { .. }))
        .count();
    let ends = events
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::StepEnd { .. }))
        .count();
    assert_eq!(starts, 2);
    assert_eq!(starts, ends);

    // 行协议：每条事件编码为一行 NDJSON，消费端折叠无丢行
    let mut fold = EventFold::new();
    for ev in &events {
        fold.fold_line(&encode_event_line(ev));
    }
    assert_eq!(fold.dropped_lines, 0);
    assert_eq!(fold.workflow_id.as_deref(), Some(state.id.as_str()));
    assert_eq!(fold.status, Some(WorkflowStatus::Done));
    assert_eq!(fold.tool_calls.len(), fold.tool_results.len());
    assert_eq!(fold.reflections, 2);
    assert_eq!(fold.message, "Hello! The echo round-trip worked.");
    assert!(fold.message_done);
}

#[tokio::test]
async fn tool_failure_triggers_replan_then_succeeds() {
    let (orchestrator, _dir) = build_orchestrator(vec![
        r#"{"steps": [{"description": "fetch via flaky", "expected_tools": ["flaky"], "success_criteria": "data fetched"}]}"#,
        r#"{"tool_calls": [{"tool": "flaky", "args": {}}]}"#,
        "The flaky tool keeps failing, no data.",
        r#"{"assessment": "failure", "next_action": "adjust_plan", "comment": "flaky backend is down, use echo instead"}"#,
        // 调整后的计划
        r#"{"steps": [{"description": "fetch via echo", "expected_tools": ["echo"], "success_criteria": "data fetched"}]}"#,
        r#"{"tool_calls": [{"tool": "echo", "args": {"text": "data"}}]}"#,
        "Got the data via echo.",
        r#"{"assessment": "success", "next_action": "complete"}"#,
        "Here is your data.",
    ]);

    let (sink, rx) = EventSink::channel();
    let state = orchestrator
        .run("conv-replan", "fetch data", WorkflowConfig::default(), &sink)
        .await
        .unwrap();
    drop(sink);
    let events = drain(rx).await;

    assert_eq!(state.status, WorkflowStatus::Done);
    assert_eq!(state.replan_count, 1);
    assert_eq!(state.steps.len(), 2);
    // 第一步的失败调用保留在记录里
    assert!(!state.steps[0].tool_results[0].success);
    assert!(state.steps[1].tool_results[0].success);

    // 首个 plan 事件是初始计划，调整后的计划带 is_adjustment 标记
    let adjustment_flags: Vec<bool> = events
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::Plan { is_adjustment, .. } => Some(*is_adjustment),
            _ => None,
        })
        .collect();
    assert_eq!(adjustment_flags, vec![false, true]);

    let mut fold = EventFold::new();
    for ev in events {
        fold.fold(ev);
    }
    // 计划版本单调递增
    assert_eq!(fold.plan_versions_seen, vec![1, 2]);
}

#[tokio::test]
async fn cancellation_mid_step_reaches_cancelled_state() {
    let (orchestrator, _dir) = build_orchestrator(vec![
        r#"{"steps": [{"description": "wait on the slow tool", "expected_tools": ["slow"]}]}"#,
        r#"{"tool_calls": [{"tool": "slow", "args": {}}]}"#,
    ]);

    let (sink, rx) = EventSink::channel();
    let runner = Arc::clone(&orchestrator);
    let handle = tokio::spawn(async move {
        runner
            .run("conv-cancel", "do the slow thing", WorkflowConfig::default(), &sink)
            .await
    });

    // 等运行进入工具调用后再取消
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(orchestrator.cancel("conv-cancel"));

    let state = handle.await.unwrap().unwrap();
    let events = drain(rx).await;

    assert_eq!(state.status, WorkflowStatus::Cancelled);
    // 半成品步骤保留，标记为 failed
    assert_eq!(state.steps.len(), 1);
    assert_eq!(state.steps[0].status, StepStatus::Failed);
    assert_eq!(state.steps[0].error.as_deref(), Some("cancelled"));
    // 在途工具调用的结果被丢弃
    assert!(state.steps[0].tool_results.is_empty());

    assert!(events.iter().any(|e| matches!(e, WorkflowEvent::Cancelled)));
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::WorkflowEnd { status: WorkflowStatus::Cancelled, .. })
    ));

    // 终态照常入历史，占位已释放
    let history = orchestrator.history_store().recent(Some("conv-cancel"), 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, WorkflowStatus::Cancelled);
    assert!(!orchestrator.is_active("conv-cancel"));
}

#[tokio::test]
async fn overall_timeout_reaches_timeout_state() {
    let (orchestrator, _dir) = build_orchestrator(vec![
        r#"{"steps": [{"description": "wait on the slow tool", "expected_tools": ["slow"]}]}"#,
        r#"{"tool_calls": [{"tool": "slow", "args": {}}]}"#,
    ]);
    let config = WorkflowConfig {
        timeout_ms: 300,
        ..WorkflowConfig::default()
    };

    let (sink, rx) = EventSink::channel();
    let state = orchestrator
        .run("conv-timeout", "do the slow thing", config, &sink)
        .await
        .unwrap();
    drop(sink);
    let events = drain(rx).await;

    assert_eq!(state.status, WorkflowStatus::Timeout);
    assert!(state.error_message.as_deref().unwrap().contains("timed out"));
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::WorkflowEnd { status: WorkflowStatus::Timeout, .. })
    ));
    let history = orchestrator.history_store().recent(Some("conv-timeout"), 10).unwrap();
    assert_eq!(history[0].status, WorkflowStatus::Timeout);
}

#[tokio::test]
async fn second_start_on_same_conversation_is_rejected() {
    let (orchestrator, _dir) = build_orchestrator(vec![
        r#"{"steps": [{"description": "wait on the slow tool", "expected_tools": ["slow"]}]}"#,
        r#"{"tool_calls": [{"tool": "slow", "args": {}}]}"#,
    ]);

    let (sink, _rx) = EventSink::channel();
    let runner = Arc::clone(&orchestrator);
    let sink_spawn = sink.clone();
    let handle = tokio::spawn(async move {
        runner
            .run("conv-busy", "first", WorkflowConfig::default(), &sink_spawn)
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(orchestrator.is_active("conv-busy"));

    // 同一 conversation 的第二次启动被拒绝，其他 conversation 不受影响
    let err = orchestrator
        .run("conv-busy", "second", WorkflowConfig::default(), &sink)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::WorkflowActive(_)));
    assert_eq!(orchestrator.active_conversations(), vec!["conv-busy".to_string()]);

    orchestrator.cancel("conv-busy");
    let state = handle.await.unwrap().unwrap();
    assert_eq!(state.status, WorkflowStatus::Cancelled);
    assert!(!orchestrator.is_active("conv-busy"));
}

#[tokio::test]
async fn snapshot_visible_mid_run_and_cleared_after() {
    let (orchestrator, _dir) = build_orchestrator(vec![
        r#"{"steps": [{"description": "wait on the slow tool", "expected_tools": ["slow"]}]}"#,
        r#"{"tool_calls": [{"tool": "slow", "args": {}}]}"#,
    ]);

    let (sink, _rx) = EventSink::channel();
    let runner = Arc::clone(&orchestrator);
    let handle = tokio::spawn(async move {
        runner
            .run("conv-snap", "slow run", WorkflowConfig::default(), &sink)
            .await
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // 运行中快照落盘，记录了计划
    let snapshot = orchestrator.snapshot_store().load("conv-snap").unwrap().unwrap();
    assert!(snapshot.plan.is_some());
    assert!(!snapshot.status.is_terminal());

    orchestrator.cancel("conv-snap");
    handle.await.unwrap().unwrap();

    // 终态后快照清除
    assert!(orchestrator.snapshot_store().load("conv-snap").unwrap().is_none());
}
