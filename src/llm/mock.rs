//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 脚本化：按顺序返回预置回复，耗尽后回落到一条固定文本；
//! 便于在本地驱动完整的 计划 -> 执行 -> 反思 -> 汇总 流程。

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmClient, Message};

/// Mock 客户端：FIFO 返回预置回复
#[derive(Debug, Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<String>>,
}

impl MockLlmClient {
    /// 无脚本：所有调用返回固定文本
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置回复队列，每次 complete 弹出一条
    pub fn with_responses(responses: Vec<impl Into<String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
        }
    }

    /// 追加一条回复到队列尾部
    pub fn push_response(&self, response: impl Into<String>) {
        self.responses.lock().unwrap().push_back(response.into());
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
        let next = self.responses.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| "OK".to_string()))
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
    ) -> Result<Pin<Box<dyn futures_util::Stream<Item = Result<String, String>> + Send>>, String>
    {
        // 将整条回复按 6 字符切片，模拟 token 流
        let content = self.complete(messages).await?;
        let chunks: Vec<Result<String, String>> = content
            .chars()
            .collect::<Vec<_>>()
            .chunks(6)
            .map(|c| Ok(c.iter().collect::<String>()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let mock = MockLlmClient::with_responses(vec!["first", "second"]);
        assert_eq!(mock.complete(&[]).await.unwrap(), "first");
        assert_eq!(mock.complete(&[]).await.unwrap(), "second");
        // 耗尽后回落
        assert_eq!(mock.complete(&[]).await.unwrap(), "OK");
    }

    #[tokio::test]
    async fn test_stream_chunks_rejoin() {
        use futures_util::StreamExt;
        let mock = MockLlmClient::with_responses(vec!["hello streaming world"]);
        let mut stream = mock.complete_stream(&[]).await.unwrap();
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            out.push_str(&chunk.unwrap());
        }
        assert_eq!(out, "hello streaming world");
    }
}
