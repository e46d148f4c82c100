//! 工作流类型定义
//!
//! 计划、步骤执行记录、工具调用、反思结果与整次运行状态。
//! 终态后的 WorkflowState 不再变更，是 HistoryStore 持久化的单位。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type WorkflowId = String;
pub type ConversationId = String;
pub type StepId = String;

/// 工作流运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// 已创建，尚未开始
    Idle,
    /// 正在生成/调整计划
    Planning,
    /// 正在执行计划步骤
    Executing,
    /// 正在反思上一步结果
    Reflecting,
    /// 正常完成
    Done,
    /// 出错终止
    Error,
    /// 用户取消
    Cancelled,
    /// 整体超时
    Timeout,
}

impl WorkflowStatus {
    /// 是否为终态（done / error / cancelled / timeout）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Done
                | WorkflowStatus::Error
                | WorkflowStatus::Cancelled
                | WorkflowStatus::Timeout
        )
    }
}

/// 步骤执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

/// 计划中的单个步骤；创建后不可变，调整计划会在新版本下生成新记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: StepId,
    pub description: String,
    /// 预期用到的工具（仅提示，不强制）
    #[serde(default)]
    pub expected_tools: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// 自然语言成功标准，由 Reflector 评估，不做机器校验
    #[serde(default)]
    pub success_criteria: String,
}

/// 执行计划
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub goal: String,
    pub steps: Vec<PlanStep>,
    pub max_steps: usize,
    pub created_at: DateTime<Utc>,
    /// 每次调整 +1，单次运行内单调递增
    pub version: u32,
}

/// 一次工具调用（执行中发出）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// 调用唯一 id
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub step_id: StepId,
    pub call_index: usize,
    pub started_at: DateTime<Utc>,
}

/// 工具调用结果；每个 ToolCall 至多对应一条，分发返回后追加
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub success: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 反思评估
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assessment {
    Success,
    Partial,
    Failure,
}

/// 反思给出的下一步动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Continue,
    AdjustPlan,
    Complete,
    Abort,
}

/// 单步反思结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReflection {
    pub assessment: Assessment,
    pub next_action: NextAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl StepReflection {
    /// 反思关闭或解析失败时的隐式结果
    pub fn implicit_continue() -> Self {
        Self {
            assessment: Assessment::Success,
            next_action: NextAction::Continue,
            comment: None,
        }
    }

    /// 反思调用失败/输出不合法时的保守默认（不终止运行）
    pub fn conservative_default() -> Self {
        Self {
            assessment: Assessment::Partial,
            next_action: NextAction::Continue,
            comment: None,
        }
    }
}

/// 每个被执行的 PlanStep 对应一条执行记录；仅 Orchestrator 持有，
/// 执行中由 Step Executor / Reflector 追加内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub plan_step_id: StepId,
    pub execution_index: usize,
    pub description: String,
    pub status: StepStatus,
    pub tool_calls: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// 模型给出的终结性文本（非工具调用），供最终汇总使用
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<StepReflection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 运行配置：显式传入，替代模块级默认值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub model: String,
    pub enabled_tools: Vec<String>,
    pub max_steps: usize,
    pub max_replans: u32,
    pub timeout_ms: u64,
    pub step_timeout_ms: u64,
    /// 单步内部 turn（模型调用 + 工具分发一轮）上限
    pub max_turns_per_step: usize,
    pub enable_planning: bool,
    pub enable_reflection: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            model: "qwen2.5:14b".to_string(),
            enabled_tools: Vec::new(),
            max_steps: 8,
            max_replans: 2,
            timeout_ms: 300_000,
            step_timeout_ms: 120_000,
            max_turns_per_step: 8,
            enable_planning: true,
            enable_reflection: true,
        }
    }
}

/// 整次运行状态；到达终态后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: WorkflowId,
    pub conversation_id: ConversationId,
    pub status: WorkflowStatus,
    pub user_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<WorkflowPlan>,
    pub steps: Vec<WorkflowStep>,
    pub current_step_index: usize,
    pub replan_count: u32,
    pub config: WorkflowConfig,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl WorkflowState {
    pub fn new(
        conversation_id: impl Into<ConversationId>,
        user_message: impl Into<String>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            status: WorkflowStatus::Idle,
            user_message: user_message.into(),
            plan: None,
            steps: Vec::new(),
            current_step_index: 0,
            replan_count: 0,
            config,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            final_answer: None,
            error_message: None,
        }
    }

    /// 进入终态：写入 completed_at / duration_ms
    pub fn finalize(&mut self, status: WorkflowStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        let now = Utc::now();
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }
}
