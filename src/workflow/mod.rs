//! 工作流引擎：计划 → 执行 → 反思的状态机与流式事件
//!
//! - types：计划 / 步骤 / 运行状态的数据模型
//! - events：NDJSON 过程事件与消费端折叠视图
//! - guard：取消令牌 + 整体截止时间
//! - planner / executor / reflector：三个模型驱动的组件
//! - orchestrator：状态机本体与单活跃运行约束

pub mod events;
pub mod executor;
pub mod guard;
pub mod orchestrator;
pub mod planner;
pub mod reflector;
pub mod types;

pub use events::{EventFold, EventSink, WorkflowEvent};
pub use guard::RunBudget;
pub use orchestrator::{ActiveRuns, Orchestrator};
pub use planner::Planner;
pub use reflector::Reflector;
pub use types::{
    WorkflowConfig, WorkflowPlan, WorkflowState, WorkflowStatus, WorkflowStep,
};
