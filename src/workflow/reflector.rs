//! Reflector：步骤结果评估
//!
//! 步骤结束后用一次轻量模型调用判断「是否达成成功标准」并给出下一步动作
//! （continue / adjust_plan / complete / abort）。调用失败或输出不合法时
//! 保守降级为 {partial, continue}，绝不因此终止运行。

use std::sync::Arc;

use serde::Deserialize;

use crate::llm::{LlmClient, Message};
use crate::workflow::guard::RunBudget;
use crate::workflow::planner::extract_json_block;
use crate::workflow::types::{
    Assessment, NextAction, StepReflection, WorkflowPlan, WorkflowStep,
};

#[derive(Debug, Deserialize)]
struct RawReflection {
    assessment: String,
    next_action: String,
    #[serde(default)]
    comment: Option<String>,
}

/// Reflector：持有 LLM，reflect(step, plan) 返回 StepReflection
pub struct Reflector {
    llm: Arc<dyn LlmClient>,
}

impl Reflector {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn reflect(
        &self,
        step: &WorkflowStep,
        plan: &WorkflowPlan,
        budget: &RunBudget,
    ) -> StepReflection {
        let criteria = plan
            .steps
            .iter()
            .find(|p| p.id == step.plan_step_id)
            .map(|p| p.success_criteria.as_str())
            .unwrap_or("");
        let tool_summary: String = step
            .tool_calls
            .iter()
            .map(|c| {
                let result = step
                    .tool_results
                    .iter()
                    .find(|r| r.call_id == c.id)
                    .map(|r| {
                        if r.success {
                            preview(&r.content)
                        } else {
                            format!("FAILED: {}", r.error.as_deref().unwrap_or("unknown"))
                        }
                    })
                    .unwrap_or_else(|| "(no result)".to_string());
                format!("- {} -> {}", c.name, result)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let system = "You assess one executed step of a plan.\n\
             Respond with ONLY JSON: {\"assessment\": \"success|partial|failure\", \
             \"next_action\": \"continue|adjust_plan|complete|abort\", \"comment\": \"...\"}\n\
             Use adjust_plan when the remaining plan no longer fits, complete when the \
             overall goal is already satisfied, abort only when continuing is pointless.";
        let user = format!(
            "Overall goal:\n{}\n\nStep: {}\nStep status: {:?}\nSuccess criteria: {}\n\n\
             Tool calls:\n{}\n\nStep output:\n{}",
            plan.goal,
            step.description,
            step.status,
            if criteria.is_empty() { "(none)" } else { criteria },
            if tool_summary.is_empty() {
                "(none)".to_string()
            } else {
                tool_summary
            },
            step.output.as_deref().unwrap_or("(none)"),
        );
        let messages = vec![Message::system(system.to_string()), Message::user(user)];

        match budget.complete(&self.llm, &messages, None).await {
            Ok(output) => parse_reflection(&output),
            Err(e) => {
                tracing::warn!("reflection call failed, defaulting to continue: {}", e);
                StepReflection::conservative_default()
            }
        }
    }
}

/// 解析反思输出；任何不合法形态都降级为保守默认
pub fn parse_reflection(output: &str) -> StepReflection {
    let Some(json_str) = extract_json_block(output) else {
        return StepReflection::conservative_default();
    };
    let Ok(raw) = serde_json::from_str::<RawReflection>(json_str) else {
        return StepReflection::conservative_default();
    };
    let assessment = match raw.assessment.trim().to_lowercase().as_str() {
        "success" => Assessment::Success,
        "partial" => Assessment::Partial,
        "failure" => Assessment::Failure,
        _ => return StepReflection::conservative_default(),
    };
    let next_action = match raw.next_action.trim().to_lowercase().as_str() {
        "continue" => NextAction::Continue,
        "adjust_plan" => NextAction::AdjustPlan,
        "complete" => NextAction::Complete,
        "abort" => NextAction::Abort,
        _ => return StepReflection::conservative_default(),
    };
    StepReflection {
        assessment,
        next_action,
        comment: raw.comment.filter(|c| !c.trim().is_empty()),
    }
}

fn preview(s: &str) -> String {
    const MAX: usize = 200;
    if s.chars().count() > MAX {
        format!("{}...", s.chars().take(MAX).collect::<String>())
    } else {
        s.to_string()
    }
}
