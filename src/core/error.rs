//! 引擎错误类型
//!
//! 工作流运行过程中的所有错误类别；Orchestrator 在顶层兜底，
//! 将未处理错误转为 error 事件与终态 error，进程永不崩溃。

use thiserror::Error;

/// 工作流引擎运行过程中可能出现的错误（LLM、解析、工具、取消、超时等）
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    /// Planner 返回无法解析的计划：直接终止运行（不用部分计划兜底）
    #[error("Plan parse error: {0}")]
    PlanParse(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// 用户取消，映射到终态 cancelled（不算失败）
    #[error("Cancelled")]
    Cancelled,

    /// 整体 timeout_ms 耗尽，映射到终态 timeout（与 error 区分）
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Reflector 给出 abort，映射到终态 error
    #[error("Aborted by reflection: {0}")]
    Aborted(String),

    /// 同一 conversation 已有非终态运行（单活跃运行不变量）
    #[error("Workflow already active for conversation: {0}")]
    WorkflowActive(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}
