//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MANTIS__*` 覆盖
//! （双下划线表示嵌套，如 `MANTIS__LLM__MODEL=qwen2.5:32b`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::workflow::types::WorkflowConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub web: WebSection,
}

/// [app] 段：应用名与数据目录
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 快照与历史落盘的根目录
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// [llm] 段：本地推理后端（OpenAI 兼容接口，如 Ollama / vLLM）
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// 本地后端一般不校验，留空即可
    pub api_key: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_model() -> String {
    "qwen2.5:14b".to_string()
}

/// [workflow] 段：运行上限与开关
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    /// 整次运行超时（毫秒）
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 单步超时（毫秒）
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default = "default_max_turns_per_step")]
    pub max_turns_per_step: usize,
    #[serde(default = "default_true")]
    pub enable_planning: bool,
    #[serde(default = "default_true")]
    pub enable_reflection: bool,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_replans: default_max_replans(),
            timeout_ms: default_timeout_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            max_turns_per_step: default_max_turns_per_step(),
            enable_planning: true,
            enable_reflection: true,
        }
    }
}

fn default_max_steps() -> usize {
    8
}

fn default_max_replans() -> u32 {
    2
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_step_timeout_ms() -> u64 {
    120_000
}

fn default_max_turns_per_step() -> usize {
    8
}

fn default_true() -> bool {
    true
}

/// [tools] 段：启用的工具与单次调用超时
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 空表示注册表里的工具全部可用
    #[serde(default)]
    pub enabled: Vec<String>,
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            enabled: Vec::new(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// [web] 段：HTTP 服务监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl AppConfig {
    /// 由配置段生成单次运行的 WorkflowConfig
    pub fn workflow_defaults(&self) -> WorkflowConfig {
        WorkflowConfig {
            model: self.llm.model.clone(),
            enabled_tools: self.tools.enabled.clone(),
            max_steps: self.workflow.max_steps,
            max_replans: self.workflow.max_replans,
            timeout_ms: self.workflow.timeout_ms,
            step_timeout_ms: self.workflow.step_timeout_ms,
            max_turns_per_step: self.workflow.max_turns_per_step,
            enable_planning: self.workflow.enable_planning,
            enable_reflection: self.workflow.enable_reflection,
        }
    }
}

/// 从 config 目录加载配置，环境变量 MANTIS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MANTIS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MANTIS")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.llm.base_url, "http://localhost:11434/v1");
        assert_eq!(config.workflow.max_steps, 8);
        assert_eq!(config.workflow.max_replans, 2);
        assert!(config.workflow.enable_reflection);
        assert_eq!(config.web.bind, "127.0.0.1:8080");
    }

    #[test]
    fn test_workflow_defaults_mapping() {
        let mut config = AppConfig::default();
        config.llm.model = "qwen2.5:32b".to_string();
        config.tools.enabled = vec!["echo".to_string()];
        let wf = config.workflow_defaults();
        assert_eq!(wf.model, "qwen2.5:32b");
        assert_eq!(wf.enabled_tools, vec!["echo".to_string()]);
        assert_eq!(wf.timeout_ms, 300_000);
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let toml = r#"
            [workflow]
            max_steps = 3
            enable_reflection = false

            [tools]
            enabled = ["echo"]
        "#;
        let config: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.workflow.max_steps, 3);
        assert!(!config.workflow.enable_reflection);
        // 未覆盖的键保持默认
        assert_eq!(config.workflow.max_replans, 2);
        assert_eq!(config.tools.enabled, vec!["echo".to_string()]);
    }
}
