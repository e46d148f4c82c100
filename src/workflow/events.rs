//! 工作流过程事件：NDJSON 流式协议
//!
//! Orchestrator 的每次状态迁移都序列化为一条带 type 判别符的 JSON 记录，按行推送给调用方。
//! 消费端逐行解析并按到达顺序折叠出累计视图；解析失败的行跳过但计数（不中断流）。

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::workflow::types::{
    Assessment, NextAction, StepStatus, ToolCall, ToolResult, WorkflowConfig, WorkflowPlan,
    WorkflowState, WorkflowStatus,
};

/// 单条过程事件（可序列化为 JSON 供前端折叠展示）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// 流式接口的首行握手：回传本次运行的 conversation_id（与客户端预设 id）
    ConversationId {
        conversation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preset_id: Option<String>,
    },
    /// 运行已受理
    WorkflowStart {
        workflow_id: String,
        timestamp: chrono::DateTime<chrono::Utc>,
        config: WorkflowConfig,
    },
    /// 生成（或调整）了计划
    Plan {
        plan: WorkflowPlan,
        #[serde(default)]
        is_adjustment: bool,
    },
    /// 步骤开始
    StepStart {
        step_id: String,
        step_index: usize,
        total_steps: usize,
        description: String,
        expected_tools: Vec<String>,
    },
    /// 发出一次工具调用
    ToolCall {
        step_id: String,
        turn: usize,
        call: ToolCall,
    },
    /// 工具调用完成
    ToolResult { step_id: String, result: ToolResult },
    /// 步骤结束
    StepEnd {
        step_id: String,
        status: StepStatus,
        duration_ms: u64,
    },
    /// 步骤反思结果
    Reflection {
        step_id: String,
        assessment: Assessment,
        next_action: NextAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
    /// 最终回复的一小段（流式输出）；done=true 表示结束
    Message { content: String, done: bool },
    /// 运行到达终态
    WorkflowEnd {
        status: WorkflowStatus,
        duration_ms: u64,
    },
    /// 发生错误（recoverable=true 时运行继续）
    Error { message: String, recoverable: bool },
    /// 运行被取消
    Cancelled,
    /// 全量状态同步点（持久化用）
    StateSnapshot { state: WorkflowState },
}

/// 事件发送端：包装 mpsc，发送失败静默忽略（消费端断开不影响运行收尾）
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<WorkflowEvent>,
}

impl EventSink {
    /// 创建通道，返回 (sink, receiver)
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: WorkflowEvent) {
        let _ = self.tx.send(event);
    }

    /// 消费端是否已断开（Web 层据此把流中断视为取消）
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// 编码为一行 NDJSON（含换行符）
pub fn encode_event_line(event: &WorkflowEvent) -> String {
    let mut line = serde_json::to_string(event).unwrap_or_else(|e| {
        // 事件编码失败不应中断流，降级为 error 事件
        tracing::warn!("event encode failed: {}", e);
        encode_failure_line(&e.to_string())
    });
    line.push('\n');
    line
}

/// 降级行也必须是合法 JSON（错误信息可能含引号等需转义的字符）
fn encode_failure_line(reason: &str) -> String {
    serde_json::json!({
        "type": "error",
        "message": format!("event encode failed: {}", reason),
        "recoverable": true
    })
    .to_string()
}

/// 解析一行；非法 JSON 或未知 type 返回 None（调用方负责计数）
pub fn decode_event_line(line: &str) -> Option<WorkflowEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// 消费端累计视图：纯按到达顺序折叠事件重建，不假设除 start/end 外任何事件恰出现一次
#[derive(Debug, Default)]
pub struct EventFold {
    pub conversation_id: Option<String>,
    pub workflow_id: Option<String>,
    pub status: Option<WorkflowStatus>,
    pub plan: Option<WorkflowPlan>,
    pub plan_versions_seen: Vec<u32>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub reflections: usize,
    pub message: String,
    pub message_done: bool,
    pub errors: Vec<String>,
    pub cancelled: bool,
    pub last_snapshot: Option<WorkflowState>,
    /// 解析失败被跳过的行数（用于发现系统性编码问题）
    pub dropped_lines: usize,
}

impl EventFold {
    pub fn new() -> Self {
        Self::default()
    }

    /// 折叠一行原始输入；非法行计数后跳过
    pub fn fold_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match decode_event_line(line) {
            Some(ev) => self.fold(ev),
            None => self.dropped_lines += 1,
        }
    }

    pub fn fold(&mut self, event: WorkflowEvent) {
        match event {
            WorkflowEvent::ConversationId {
                conversation_id, ..
            } => {
                self.conversation_id = Some(conversation_id);
            }
            WorkflowEvent::WorkflowStart { workflow_id, .. } => {
                self.workflow_id = Some(workflow_id);
                self.status = Some(WorkflowStatus::Planning);
            }
            WorkflowEvent::Plan { plan, .. } => {
                self.plan_versions_seen.push(plan.version);
                self.plan = Some(plan);
            }
            WorkflowEvent::StepStart { .. } => {
                self.status = Some(WorkflowStatus::Executing);
            }
            WorkflowEvent::ToolCall { call, .. } => self.tool_calls.push(call),
            WorkflowEvent::ToolResult { result, .. } => self.tool_results.push(result),
            WorkflowEvent::StepEnd { .. } => {}
            WorkflowEvent::Reflection { .. } => {
                self.reflections += 1;
                self.status = Some(WorkflowStatus::Reflecting);
            }
            WorkflowEvent::Message { content, done } => {
                self.message.push_str(&content);
                if done {
                    self.message_done = true;
                }
            }
            WorkflowEvent::WorkflowEnd { status, .. } => self.status = Some(status),
            WorkflowEvent::Error { message, .. } => self.errors.push(message),
            WorkflowEvent::Cancelled => self.cancelled = true,
            WorkflowEvent::StateSnapshot { state } => self.last_snapshot = Some(state),
        }
    }
}
