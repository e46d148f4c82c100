//! 运行历史：终态 WorkflowState 的 JSONL 追加存储
//!
//! 每次运行结束（done / error / cancelled / timeout 都算）追加一行；
//! 读取时逐行解析，坏行跳过并告警，不让单条损坏毁掉整个历史。

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::workflow::types::WorkflowState;

pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 追加一条终态运行记录
    pub fn append(&self, state: &WorkflowState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create history dir {:?}", parent))?;
        }
        let line = serde_json::to_string(state).context("serialize history entry")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open history {:?}", self.path))?;
        writeln!(file, "{}", line).with_context(|| format!("append history {:?}", self.path))?;
        Ok(())
    }

    /// 最近的 limit 条记录，新的在前；可按 conversation 过滤
    pub fn recent(
        &self,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<WorkflowState>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path)
            .with_context(|| format!("open history {:?}", self.path))?;
        let mut entries: Vec<WorkflowState> = Vec::new();
        let mut bad_lines = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("read history {:?}", self.path))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WorkflowState>(&line) {
                Ok(state) => {
                    if conversation_id.map_or(true, |id| state.conversation_id == id) {
                        entries.push(state);
                    }
                }
                Err(_) => bad_lines += 1,
            }
        }
        if bad_lines > 0 {
            tracing::warn!("history {:?}: skipped {} malformed lines", self.path, bad_lines);
        }
        entries.reverse();
        entries.truncate(limit);
        Ok(entries)
    }
}
