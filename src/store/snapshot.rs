//! 运行中状态快照
//!
//! 每个 conversation 至多一份在途快照（JSON 文件），在规划后、每步反思后覆盖写入，
//! 终态时清除。进程中途挂掉后可据此向用户解释"上次进行到哪了"。

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::workflow::types::WorkflowState;

pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, conversation_id: &str) -> PathBuf {
        // conversation_id 可能来自外部输入，落盘前只保留安全字符
        let safe: String = conversation_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    /// 覆盖写入快照（先写临时文件再改名，避免读到半截文件）
    pub fn save(&self, state: &WorkflowState) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create snapshot dir {:?}", self.dir))?;
        let path = self.path_for(&state.conversation_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state).context("serialize snapshot")?;
        fs::write(&tmp, json).with_context(|| format!("write snapshot {:?}", tmp))?;
        fs::rename(&tmp, &path).with_context(|| format!("rename snapshot to {:?}", path))?;
        Ok(())
    }

    pub fn load(&self, conversation_id: &str) -> Result<Option<WorkflowState>> {
        let path = self.path_for(conversation_id);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("read snapshot {:?}", path))?;
        let state = serde_json::from_str(&json)
            .with_context(|| format!("parse snapshot {:?}", path))?;
        Ok(Some(state))
    }

    /// 恢复检查：仅当快照处于非终态时返回它；
    /// 终态残留（进程在清理前挂掉）顺手清除并返回 None
    pub fn check_active(&self, conversation_id: &str) -> Result<Option<WorkflowState>> {
        match self.load(conversation_id)? {
            Some(state) if !state.status.is_terminal() => Ok(Some(state)),
            Some(_) => {
                self.clear(conversation_id)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// 终态时清除快照；不存在视为成功
    pub fn clear(&self, conversation_id: &str) -> Result<()> {
        let path = self.path_for(conversation_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove snapshot {:?}", path)),
        }
    }
}
