//! Mantis - 本地个人 AI 助手的 Agent 工作流引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）与 WorkflowConfig 默认值
//! - **core**: 引擎错误类型
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: tracing 初始化
//! - **store**: 快照缓存（恢复用）与运行历史日志
//! - **tools**: 工具 trait、注册表与带超时的分发器
//! - **workflow**: Planner、Step Executor、Reflector、Orchestrator 与事件协议
//!
//! UI、工具实现、文档索引、图像/音频生成均为外部协作方，仅在边界上出现。

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod store;
pub mod tools;
pub mod workflow;
