//! 运行预算守卫：取消令牌 + 整体截止时间
//!
//! 穿入 Planner / Step Executor / Reflector / 最终汇总的每个挂起点：
//! 每次模型调用与工具分发前检查，调用本身用剩余预算包裹超时。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::core::EngineError;
use crate::llm::{LlmClient, Message};
use crate::tools::ToolDispatcher;

/// 单次运行的取消与截止预算
#[derive(Clone)]
pub struct RunBudget {
    cancel: CancellationToken,
    deadline: Instant,
}

impl RunBudget {
    pub fn new(cancel: CancellationToken, timeout_ms: u64) -> Self {
        Self {
            cancel,
            deadline: Instant::now() + Duration::from_millis(timeout_ms),
        }
    }

    /// 挂起点检查：取消优先于超时
    pub fn check(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(EngineError::DeadlineExceeded);
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 到整体截止时间还剩多少
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// 等待取消信号（供流式输出的 select 使用）
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// 受守卫的模型调用：取消立即返回，超时按剩余预算（可再被 cap 进一步收紧）
    pub async fn complete(
        &self,
        llm: &Arc<dyn LlmClient>,
        messages: &[Message],
        cap: Option<Duration>,
    ) -> Result<String, EngineError> {
        self.check()?;
        let budget = match cap {
            Some(c) => self.remaining().min(c),
            None => self.remaining(),
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            result = tokio::time::timeout(budget, llm.complete(messages)) => match result {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) => Err(EngineError::LlmError(e)),
                Err(_) => {
                    // 区分整体截止与局部 cap：前者终止运行，后者由调用方按步骤超时处理
                    if self.remaining().is_zero() {
                        Err(EngineError::DeadlineExceeded)
                    } else {
                        Err(EngineError::ToolTimeout("llm call".to_string()))
                    }
                }
            }
        }
    }

    /// 受守卫的工具分发；分发器自身的超时仍然生效。
    /// 取消/整体截止时不强杀在途调用，直接丢弃其结果返回
    pub async fn dispatch(
        &self,
        dispatcher: &ToolDispatcher,
        name: &str,
        args: serde_json::Value,
    ) -> Result<String, EngineError> {
        self.check()?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            result = tokio::time::timeout(self.remaining(), dispatcher.dispatch(name, args)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(EngineError::DeadlineExceeded),
                }
            }
        }
    }
}
