//! 工具分发器
//!
//! 持有 ToolRegistry 与全局超时，dispatch(tool_name, args) 在超时内调用 registry.execute，
//! 超时或失败时转为 EngineError（ToolTimeout / ToolExecutionFailed / UnknownTool）；
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::core::EngineError;
use crate::tools::ToolRegistry;

/// 工具分发器：对每次调用施加超时，并将结果映射为 EngineError
pub struct ToolDispatcher {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 分发指定工具；超时返回 ToolTimeout，工具返回 Err 则转为 ToolExecutionFailed，
    /// 未注册返回 UnknownTool；输出 JSON 审计日志
    pub async fn dispatch(
        &self,
        tool_name: &str,
        args: serde_json::Value,
    ) -> Result<String, EngineError> {
        if self.registry.get(tool_name).is_none() {
            return Err(EngineError::UnknownTool(tool_name.to_string()));
        }

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, self.registry.execute(tool_name, args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(EngineError::ToolExecutionFailed(e)),
            Err(_) => Err(EngineError::ToolTimeout(tool_name.to_string())),
        }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        self.registry.tool_descriptions()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[tokio::test]
    async fn test_dispatch_unknown_tool() {
        let dispatcher = ToolDispatcher::new(ToolRegistry::new(), 5);
        let err = dispatcher
            .dispatch("nope", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn test_dispatch_echo() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let dispatcher = ToolDispatcher::new(registry, 5);
        let out = dispatcher
            .dispatch("echo", serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, "hi");
    }
}
