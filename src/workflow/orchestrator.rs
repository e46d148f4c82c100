//! Orchestrator：工作流状态机
//!
//! idle → planning → (executing → reflecting)* → done，
//! 任何阶段可被取消 / 超时打断（cancelled / timeout），未兜住的错误进终态 error。
//! 同一 conversation 同时至多一个非终态运行；终态必然伴随一条 workflow_end 事件、
//! 一条历史记录落盘、快照清除。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::EngineError;
use crate::llm::{LlmClient, Message};
use crate::store::{HistoryStore, SnapshotStore};
use crate::tools::ToolDispatcher;
use crate::workflow::events::{EventSink, WorkflowEvent};
use crate::workflow::executor::{Interrupt, StepExecutor};
use crate::workflow::guard::RunBudget;
use crate::workflow::planner::Planner;
use crate::workflow::reflector::Reflector;
use crate::workflow::types::{
    ConversationId, NextAction, PlanStep, StepReflection, StepStatus, WorkflowConfig,
    WorkflowPlan, WorkflowState, WorkflowStatus, WorkflowStep,
};

/// 活跃运行表：conversation_id → 取消令牌
///
/// try_begin 占位（已占则 WorkflowActive），RunGuard 析构时释放，
/// 保证运行无论如何退出都不会泄漏占位。
#[derive(Clone, Default)]
pub struct ActiveRuns {
    inner: Arc<RwLock<HashMap<ConversationId, CancellationToken>>>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self, conversation_id: &str) -> Result<RunGuard, EngineError> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| EngineError::ConfigError("active runs lock poisoned".to_string()))?;
        if map.contains_key(conversation_id) {
            return Err(EngineError::WorkflowActive(conversation_id.to_string()));
        }
        let token = CancellationToken::new();
        map.insert(conversation_id.to_string(), token.clone());
        Ok(RunGuard {
            conversation_id: conversation_id.to_string(),
            token,
            runs: self.clone(),
        })
    }

    /// 请求取消；返回是否存在该活跃运行
    pub fn cancel(&self, conversation_id: &str) -> bool {
        match self.inner.read() {
            Ok(map) => match map.get(conversation_id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.inner
            .read()
            .map(|map| map.contains_key(conversation_id))
            .unwrap_or(false)
    }

    pub fn active_ids(&self) -> Vec<ConversationId> {
        self.inner
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn release(&self, conversation_id: &str) {
        if let Ok(mut map) = self.inner.write() {
            map.remove(conversation_id);
        }
    }
}

/// 占位凭据；Drop 时从活跃表移除
pub struct RunGuard {
    conversation_id: ConversationId,
    token: CancellationToken,
    runs: ActiveRuns,
}

impl RunGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.runs.release(&self.conversation_id);
    }
}

/// 单次运行的组件组：按运行构造，支持逐次覆盖模型端点
struct RunComponents {
    llm: Arc<dyn LlmClient>,
    planner: Planner,
    executor: StepExecutor,
    reflector: Reflector,
}

/// 工作流 Orchestrator
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    dispatcher: Arc<ToolDispatcher>,
    active: ActiveRuns,
    snapshots: SnapshotStore,
    history: HistoryStore,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        dispatcher: ToolDispatcher,
        snapshots: SnapshotStore,
        history: HistoryStore,
    ) -> Self {
        Self {
            llm,
            dispatcher: Arc::new(dispatcher),
            active: ActiveRuns::new(),
            snapshots,
            history,
        }
    }

    pub fn active_conversations(&self) -> Vec<ConversationId> {
        self.active.active_ids()
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active.is_active(conversation_id)
    }

    /// 请求取消指定 conversation 的运行；无活跃运行返回 false
    pub fn cancel(&self, conversation_id: &str) -> bool {
        self.active.cancel(conversation_id)
    }

    pub fn history_store(&self) -> &HistoryStore {
        &self.history
    }

    pub fn snapshot_store(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// 运行一次工作流。事件推到 sink；返回终态 WorkflowState。
    /// 唯一的 Err 情形是同 conversation 已有活跃运行（WorkflowActive）。
    pub async fn run(
        &self,
        conversation_id: &str,
        user_message: &str,
        config: WorkflowConfig,
        sink: &EventSink,
    ) -> Result<WorkflowState, EngineError> {
        self.run_with_client(conversation_id, user_message, &[], config, None, sink)
            .await
    }

    /// 同 run，另可带入对话历史与按次覆盖的模型端点
    pub async fn run_with_client(
        &self,
        conversation_id: &str,
        user_message: &str,
        history: &[Message],
        config: WorkflowConfig,
        llm_override: Option<Arc<dyn LlmClient>>,
        sink: &EventSink,
    ) -> Result<WorkflowState, EngineError> {
        let guard = self.active.try_begin(conversation_id)?;
        let llm = llm_override.unwrap_or_else(|| self.llm.clone());
        let components = RunComponents {
            planner: Planner::new(llm.clone()),
            executor: StepExecutor::new(llm.clone(), self.dispatcher.clone()),
            reflector: Reflector::new(llm.clone()),
            llm,
        };
        let budget = RunBudget::new(guard.token(), config.timeout_ms);
        let mut state = WorkflowState::new(conversation_id, user_message, config);
        info!(workflow_id = %state.id, conversation_id, "workflow started");

        sink.emit(WorkflowEvent::WorkflowStart {
            workflow_id: state.id.clone(),
            timestamp: Utc::now(),
            config: state.config.clone(),
        });

        let status = match self
            .run_inner(&components, &mut state, history, sink, &budget)
            .await
        {
            Ok(()) => WorkflowStatus::Done,
            Err(EngineError::Cancelled) => {
                sink.emit(WorkflowEvent::Cancelled);
                WorkflowStatus::Cancelled
            }
            Err(EngineError::DeadlineExceeded) => {
                let message = format!("workflow timed out after {}ms", state.config.timeout_ms);
                sink.emit(WorkflowEvent::Error {
                    message: message.clone(),
                    recoverable: false,
                });
                state.error_message = Some(message);
                WorkflowStatus::Timeout
            }
            Err(e) => {
                let message = e.to_string();
                sink.emit(WorkflowEvent::Error {
                    message: message.clone(),
                    recoverable: false,
                });
                state.error_message = Some(message);
                WorkflowStatus::Error
            }
        };

        state.finalize(status);
        sink.emit(WorkflowEvent::StateSnapshot {
            state: state.clone(),
        });
        sink.emit(WorkflowEvent::WorkflowEnd {
            status,
            duration_ms: state.duration_ms.unwrap_or(0),
        });

        if let Err(e) = self.history.append(&state) {
            warn!(workflow_id = %state.id, "history append failed: {:#}", e);
        }
        if let Err(e) = self.snapshots.clear(conversation_id) {
            warn!(workflow_id = %state.id, "snapshot clear failed: {:#}", e);
        }
        info!(workflow_id = %state.id, status = ?status, "workflow finished");

        drop(guard);
        Ok(state)
    }

    async fn run_inner(
        &self,
        components: &RunComponents,
        state: &mut WorkflowState,
        history: &[Message],
        sink: &EventSink,
        budget: &RunBudget,
    ) -> Result<(), EngineError> {
        let tools = self.catalogue(&state.config);

        // ---- planning ----
        state.status = WorkflowStatus::Planning;
        let mut plan = if state.config.enable_planning {
            let mut plan = components
                .planner
                .plan(&state.user_message, &tools, state.config.max_steps, budget)
                .await?;
            self.truncate_plan(&mut plan, state.config.max_steps, sink);
            sink.emit(WorkflowEvent::Plan {
                plan: plan.clone(),
                is_adjustment: false,
            });
            plan
        } else {
            // 规划关闭：整条用户消息作为唯一隐式步骤，不发 plan 事件
            WorkflowPlan {
                goal: state.user_message.clone(),
                steps: vec![PlanStep {
                    id: uuid::Uuid::new_v4().to_string(),
                    description: state.user_message.clone(),
                    expected_tools: Vec::new(),
                    depends_on: Vec::new(),
                    success_criteria: String::new(),
                }],
                max_steps: 1,
                created_at: Utc::now(),
                version: 1,
            }
        };
        state.plan = Some(plan.clone());
        self.save_snapshot(state);

        // ---- executing / reflecting ----
        let mut context = Vec::with_capacity(history.len() + 2);
        context.push(Message::system(execution_system_prompt(&tools)));
        context.extend_from_slice(history);
        context.push(Message::user(format!("Overall goal:\n{}", state.user_message)));

        let mut cursor = 0usize;
        'run: while cursor < plan.steps.len() {
            budget.check()?;
            // 重规划也不能突破已执行步骤总数上限
            if state.steps.len() >= state.config.max_steps {
                warn!(
                    workflow_id = %state.id,
                    "step budget ({}) exhausted, finalizing with current results",
                    state.config.max_steps
                );
                sink.emit(WorkflowEvent::Error {
                    message: format!(
                        "step budget ({}) exhausted, finalizing with current results",
                        state.config.max_steps
                    ),
                    recoverable: true,
                });
                break 'run;
            }
            let plan_step = plan.steps[cursor].clone();
            state.current_step_index = cursor;

            // 依赖步骤失败/被跳过时本步也跳过
            if self.dependency_failed(&plan_step, &state.steps) {
                self.emit_skipped(state, &plan_step, sink);
                cursor += 1;
                continue;
            }

            state.status = WorkflowStatus::Executing;
            sink.emit(WorkflowEvent::StepStart {
                step_id: plan_step.id.clone(),
                step_index: cursor,
                total_steps: plan.steps.len(),
                description: plan_step.description.clone(),
                expected_tools: plan_step.expected_tools.clone(),
            });

            let run = components
                .executor
                .execute_step(
                    &plan_step,
                    state.steps.len(),
                    &mut context,
                    state.config.max_turns_per_step,
                    state.config.step_timeout_ms,
                    sink,
                    budget,
                )
                .await;
            sink.emit(WorkflowEvent::StepEnd {
                step_id: plan_step.id.clone(),
                status: run.record.status,
                duration_ms: run.record.duration_ms.unwrap_or(0),
            });
            let record = run.record.clone();
            state.steps.push(run.record);

            if let Some(interrupt) = run.interrupt {
                self.save_snapshot(state);
                return Err(match interrupt {
                    Interrupt::Cancelled => EngineError::Cancelled,
                    Interrupt::DeadlineExceeded => EngineError::DeadlineExceeded,
                });
            }

            let reflection = if state.config.enable_reflection {
                state.status = WorkflowStatus::Reflecting;
                let reflection = components.reflector.reflect(&record, &plan, budget).await;
                sink.emit(WorkflowEvent::Reflection {
                    step_id: plan_step.id.clone(),
                    assessment: reflection.assessment,
                    next_action: reflection.next_action,
                    comment: reflection.comment.clone(),
                });
                reflection
            } else {
                StepReflection::implicit_continue()
            };
            if let Some(record) = state.steps.last_mut() {
                record.reflection = Some(reflection.clone());
            }
            self.save_snapshot(state);

            match reflection.next_action {
                NextAction::Continue => cursor += 1,
                NextAction::Complete => break 'run,
                NextAction::Abort => {
                    return Err(EngineError::Aborted(
                        reflection
                            .comment
                            .unwrap_or_else(|| "reflection chose abort".to_string()),
                    ));
                }
                NextAction::AdjustPlan => {
                    if state.replan_count >= state.config.max_replans {
                        warn!(
                            workflow_id = %state.id,
                            "replan limit ({}) reached, completing with current results",
                            state.config.max_replans
                        );
                        sink.emit(WorkflowEvent::Error {
                            message: format!(
                                "replan limit ({}) reached, completing with current results",
                                state.config.max_replans
                            ),
                            recoverable: true,
                        });
                        break 'run;
                    }
                    state.replan_count += 1;
                    state.status = WorkflowStatus::Planning;
                    let reason = reflection
                        .comment
                        .clone()
                        .or_else(|| state.steps.last().and_then(|s| s.error.clone()))
                        .unwrap_or_else(|| "step did not meet its success criteria".to_string());
                    let mut adjusted = components
                        .planner
                        .adjust_plan(&plan, &state.steps, &reason, &tools, budget)
                        .await?;
                    self.truncate_plan(&mut adjusted, state.config.max_steps, sink);
                    sink.emit(WorkflowEvent::Plan {
                        plan: adjusted.clone(),
                        is_adjustment: true,
                    });
                    state.plan = Some(adjusted.clone());
                    plan = adjusted;
                    cursor = 0;
                    self.save_snapshot(state);
                }
            }
        }

        // ---- final answer ----
        let answer = self
            .finalize_answer(&components.llm, state, sink, budget)
            .await?;
        state.final_answer = Some(answer);
        Ok(())
    }

    /// 流式生成最终回复：每个分片作为一条 message 事件，结尾 done=true
    async fn finalize_answer(
        &self,
        llm: &Arc<dyn LlmClient>,
        state: &WorkflowState,
        sink: &EventSink,
        budget: &RunBudget,
    ) -> Result<String, EngineError> {
        budget.check()?;
        let results: String = if state.steps.is_empty() {
            "(no steps were needed, answer directly)".to_string()
        } else {
            state
                .steps
                .iter()
                .map(|s| {
                    let outcome = s
                        .output
                        .as_deref()
                        .or(s.error.as_deref())
                        .unwrap_or("(no output)");
                    format!("- [{:?}] {}: {}", s.status, s.description, outcome)
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        let messages = vec![
            Message::system(
                "You are a helpful local AI assistant. Write the final answer to the \
                 user's request based on the executed step results below. Answer the user \
                 directly; do not mention the internal plan or steps."
                    .to_string(),
            ),
            Message::user(format!(
                "Request:\n{}\n\nStep results:\n{}",
                state.user_message, results
            )),
        ];

        let mut stream = llm
            .complete_stream(&messages)
            .await
            .map_err(EngineError::LlmError)?;
        let mut answer = String::new();
        loop {
            tokio::select! {
                _ = budget.cancelled() => return Err(EngineError::Cancelled),
                chunk = tokio::time::timeout(budget.remaining(), stream.next()) => {
                    match chunk {
                        Err(_) => return Err(EngineError::DeadlineExceeded),
                        Ok(None) => break,
                        Ok(Some(Err(e))) => return Err(EngineError::LlmError(e)),
                        Ok(Some(Ok(delta))) => {
                            answer.push_str(&delta);
                            sink.emit(WorkflowEvent::Message {
                                content: delta,
                                done: false,
                            });
                        }
                    }
                }
            }
        }
        sink.emit(WorkflowEvent::Message {
            content: String::new(),
            done: true,
        });
        Ok(answer)
    }

    /// enabled_tools 为空表示全部可用
    fn catalogue(&self, config: &WorkflowConfig) -> Vec<(String, String)> {
        let all = self.dispatcher.tool_descriptions();
        if config.enabled_tools.is_empty() {
            all
        } else {
            all.into_iter()
                .filter(|(name, _)| config.enabled_tools.iter().any(|t| t == name))
                .collect()
        }
    }

    fn truncate_plan(&self, plan: &mut WorkflowPlan, max_steps: usize, sink: &EventSink) {
        if plan.steps.len() > max_steps {
            warn!(
                "plan has {} steps, truncating to max_steps={}",
                plan.steps.len(),
                max_steps
            );
            sink.emit(WorkflowEvent::Error {
                message: format!(
                    "plan exceeded max_steps ({} > {}), extra steps dropped",
                    plan.steps.len(),
                    max_steps
                ),
                recoverable: true,
            });
            plan.steps.truncate(max_steps);
        }
    }

    fn dependency_failed(&self, plan_step: &PlanStep, records: &[WorkflowStep]) -> bool {
        plan_step.depends_on.iter().any(|dep| {
            records
                .iter()
                .rev()
                .find(|r| &r.plan_step_id == dep)
                .is_some_and(|r| r.status != StepStatus::Success)
        })
    }

    fn emit_skipped(&self, state: &mut WorkflowState, plan_step: &PlanStep, sink: &EventSink) {
        let now = Utc::now();
        sink.emit(WorkflowEvent::StepStart {
            step_id: plan_step.id.clone(),
            step_index: state.current_step_index,
            total_steps: state.plan.as_ref().map(|p| p.steps.len()).unwrap_or(0),
            description: plan_step.description.clone(),
            expected_tools: plan_step.expected_tools.clone(),
        });
        sink.emit(WorkflowEvent::StepEnd {
            step_id: plan_step.id.clone(),
            status: StepStatus::Skipped,
            duration_ms: 0,
        });
        state.steps.push(WorkflowStep {
            plan_step_id: plan_step.id.clone(),
            execution_index: state.steps.len(),
            description: plan_step.description.clone(),
            status: StepStatus::Skipped,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            started_at: now,
            completed_at: Some(now),
            duration_ms: Some(0),
            output: None,
            reflection: None,
            error: Some("dependency step did not succeed".to_string()),
        });
    }

    fn save_snapshot(&self, state: &WorkflowState) {
        if let Err(e) = self.snapshots.save(state) {
            warn!(workflow_id = %state.id, "snapshot save failed: {:#}", e);
        }
    }
}

fn execution_system_prompt(tools: &[(String, String)]) -> String {
    let tool_list: String = tools
        .iter()
        .map(|(name, desc)| format!("- {}: {}", name, desc))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You are executing one step at a time of a plan for a local AI assistant.\n\n\
         Available tools:\n{}\n\n\
         To call tools, respond with ONLY JSON (no prose outside it):\n\
         {{\"tool_calls\": [{{\"tool\": \"name\", \"args\": {{...}}}}]}}\n\
         Calls in one batch run in order; later calls may use earlier results.\n\
         When the current step is complete, reply with a plain-text result instead.",
        if tool_list.is_empty() {
            "(none)".to_string()
        } else {
            tool_list
        }
    )
}
