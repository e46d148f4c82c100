//! Planner：任务拆解与计划调整
//!
//! plan 用一次模型调用把目标拆成有序步骤；adjust_plan 在运行中按反思理由
//! 重排/替换未执行的步骤（版本 +1，已完成步骤的记录不动）。
//! 模型必须返回结构化 JSON；解析失败是 Planner 失败，不做部分计划兜底。

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;

use crate::core::EngineError;
use crate::llm::{LlmClient, Message};
use crate::workflow::guard::RunBudget;
use crate::workflow::types::{PlanStep, WorkflowPlan, WorkflowStep};

/// 从模型输出中提取 JSON 块（```json ... ``` 或首个 { 到末个 }）
pub fn extract_json_block(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(
            rest.find("```")
                .map(|end| rest[..end].trim())
                .unwrap_or_else(|| rest.trim()),
        );
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end >= start {
        Some(&trimmed[start..=end])
    } else {
        None
    }
}

/// 模型返回的单步（depends_on 用数组下标表示，入库时转为步骤 id）
#[derive(Debug, Deserialize)]
struct RawPlanStep {
    description: String,
    #[serde(default)]
    expected_tools: Vec<String>,
    #[serde(default)]
    depends_on: Vec<usize>,
    #[serde(default)]
    success_criteria: String,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    steps: Vec<RawPlanStep>,
}

/// Planner：持有 LLM，负责 plan / adjust_plan
pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 把目标拆成至多 max_steps 个有序步骤；空 steps 合法（无需工具即可回答）
    pub async fn plan(
        &self,
        goal: &str,
        available_tools: &[(String, String)],
        max_steps: usize,
        budget: &RunBudget,
    ) -> Result<WorkflowPlan, EngineError> {
        let system = plan_system_prompt(available_tools, max_steps);
        let messages = vec![
            Message::system(system),
            Message::user(format!("Goal:\n{}", goal)),
        ];
        let output = budget.complete(&self.llm, &messages, None).await?;
        let steps = parse_plan_output(&output)?;
        Ok(WorkflowPlan {
            goal: goal.to_string(),
            steps,
            max_steps,
            created_at: Utc::now(),
            version: 1,
        })
    }

    /// 按反思理由调整计划：可重排/替换/删除未执行步骤；返回新版本（version+1）。
    /// 已完成步骤只作为上下文传入，其执行记录由 Orchestrator 保留，这里绝不改写。
    pub async fn adjust_plan(
        &self,
        current: &WorkflowPlan,
        completed_steps: &[WorkflowStep],
        reason: &str,
        available_tools: &[(String, String)],
        budget: &RunBudget,
    ) -> Result<WorkflowPlan, EngineError> {
        let system = plan_system_prompt(available_tools, current.max_steps);
        let completed: String = completed_steps
            .iter()
            .map(|s| {
                format!(
                    "- [{}] {}{}",
                    match s.status {
                        crate::workflow::types::StepStatus::Success => "ok",
                        crate::workflow::types::StepStatus::Failed => "failed",
                        crate::workflow::types::StepStatus::Skipped => "skipped",
                        crate::workflow::types::StepStatus::Running => "running",
                    },
                    s.description,
                    s.error
                        .as_deref()
                        .map(|e| format!(" (error: {})", e))
                        .unwrap_or_default(),
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let user = format!(
            "Goal:\n{}\n\nSteps already executed (do NOT repeat them):\n{}\n\n\
             Reason for adjustment:\n{}\n\n\
             Produce a fresh plan covering only the REMAINING work.",
            current.goal, completed, reason
        );
        let messages = vec![Message::system(system), Message::user(user)];
        let output = budget.complete(&self.llm, &messages, None).await?;
        let steps = parse_plan_output(&output)?;
        Ok(WorkflowPlan {
            goal: current.goal.clone(),
            steps,
            max_steps: current.max_steps,
            created_at: Utc::now(),
            version: current.version + 1,
        })
    }
}

fn plan_system_prompt(available_tools: &[(String, String)], max_steps: usize) -> String {
    let tool_list: String = available_tools
        .iter()
        .map(|(name, desc)| format!("- {}: {}", name, desc))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You are a task planner for a local AI assistant.\n\
         Break the user's goal into an ordered list of concrete steps.\n\n\
         Available tools:\n{}\n\n\
         Respond with ONLY a JSON object of this shape (no prose outside the JSON):\n\
         ```json\n\
         {{\"steps\": [{{\"description\": \"...\", \"expected_tools\": [\"tool\"], \
         \"depends_on\": [0], \"success_criteria\": \"...\"}}]}}\n\
         ```\n\
         Rules: at most {} steps; \"depends_on\" lists indices of earlier steps; \
         an empty \"steps\" array means the goal can be answered directly without tools.",
        if tool_list.is_empty() {
            "(none)".to_string()
        } else {
            tool_list
        },
        max_steps
    )
}

/// 解析计划输出：非法 JSON / 缺 steps 字段 → PlanParse（运行终止）
fn parse_plan_output(output: &str) -> Result<Vec<PlanStep>, EngineError> {
    let json_str = extract_json_block(output)
        .ok_or_else(|| EngineError::PlanParse(format!("no JSON object in output: {}", output)))?;
    let raw: RawPlan = serde_json::from_str(json_str)
        .map_err(|e| EngineError::PlanParse(format!("{}: {}", e, json_str)))?;

    let ids: Vec<String> = raw
        .steps
        .iter()
        .map(|_| uuid::Uuid::new_v4().to_string())
        .collect();
    let steps = raw
        .steps
        .into_iter()
        .enumerate()
        .map(|(i, s)| PlanStep {
            id: ids[i].clone(),
            description: s.description,
            expected_tools: s.expected_tools,
            depends_on: s
                .depends_on
                .into_iter()
                .filter(|&d| d < i)
                .map(|d| ids[d].clone())
                .collect(),
            success_criteria: s.success_criteria,
        })
        .collect();
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use tokio_util::sync::CancellationToken;

    fn budget() -> RunBudget {
        RunBudget::new(CancellationToken::new(), 60_000)
    }

    const PLAN_JSON: &str = r#"{"steps": [
        {"description": "search the docs", "expected_tools": ["search"], "success_criteria": "found relevant passages"},
        {"description": "summarize findings", "depends_on": [0], "success_criteria": "summary written"}
    ]}"#;

    #[tokio::test]
    async fn test_plan_parses_steps() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::with_responses(vec![PLAN_JSON]));
        let planner = Planner::new(llm);
        let plan = planner.plan("do research", &[], 5, &budget()).await.unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.version, 1);
        assert_eq!(plan.steps[1].depends_on, vec![plan.steps[0].id.clone()]);
    }

    #[tokio::test]
    async fn test_plan_accepts_fenced_json() {
        let fenced = format!("Here is the plan:\n```json\n{}\n```", PLAN_JSON);
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::with_responses(vec![fenced]));
        let planner = Planner::new(llm);
        let plan = planner.plan("do research", &[], 5, &budget()).await.unwrap();
        assert_eq!(plan.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_plan_invalid_json_is_fatal() {
        let llm: Arc<dyn LlmClient> =
            Arc::new(MockLlmClient::with_responses(vec!["I cannot plan this."]));
        let planner = Planner::new(llm);
        let err = planner.plan("goal", &[], 5, &budget()).await.unwrap_err();
        assert!(matches!(err, EngineError::PlanParse(_)));
    }

    #[tokio::test]
    async fn test_empty_plan_is_degenerate_completion() {
        let llm: Arc<dyn LlmClient> =
            Arc::new(MockLlmClient::with_responses(vec![r#"{"steps": []}"#]));
        let planner = Planner::new(llm);
        let plan = planner.plan("just chat", &[], 5, &budget()).await.unwrap();
        assert!(plan.steps.is_empty());
    }

    #[tokio::test]
    async fn test_adjust_plan_bumps_version() {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::with_responses(vec![
            PLAN_JSON,
            r#"{"steps": [{"description": "try a different source"}]}"#,
        ]));
        let planner = Planner::new(llm);
        let plan = planner.plan("do research", &[], 5, &budget()).await.unwrap();
        let adjusted = planner
            .adjust_plan(&plan, &[], "first source was empty", &[], &budget())
            .await
            .unwrap();
        assert_eq!(adjusted.version, 2);
        assert_eq!(adjusted.steps.len(), 1);
        // 新步骤是全新记录
        assert!(adjusted.steps.iter().all(|s| plan.steps.iter().all(|p| p.id != s.id)));
    }

    #[test]
    fn test_extract_json_block_bare() {
        let s = "prefix {\"a\": 1} suffix";
        assert_eq!(extract_json_block(s), Some("{\"a\": 1}"));
    }
}
