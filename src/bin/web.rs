//! Mantis Web 服务
//!
//! 启动: cargo run --bin mantis-web --features web
//! POST /api/workflow/stream 发起一次工作流，按 NDJSON 逐行推送过程事件。

#![cfg(feature = "web")]

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures_util::stream;
use serde::{Deserialize, Serialize};

use mantis::config::{load_config, AppConfig};
use mantis::llm::{LlmClient, Message, OpenAiClient};
use mantis::store::{HistoryStore, SnapshotStore};
use mantis::tools::{EchoTool, ToolDispatcher, ToolRegistry};
use mantis::workflow::events::{encode_event_line, EventSink, WorkflowEvent};
use mantis::workflow::types::{WorkflowConfig, WorkflowState};
use mantis::workflow::Orchestrator;

struct AppState {
    config: AppConfig,
    orchestrator: Arc<Orchestrator>,
}

#[derive(Debug, Deserialize)]
struct StreamRequest {
    message: String,
    #[serde(default)]
    conversation_id: Option<String>,
    /// 模型端点按次覆盖（如切到另一个本地推理服务）
    #[serde(default)]
    host: Option<String>,
    /// 之前的对话消息，按序注入执行上下文
    #[serde(default, alias = "history")]
    conversation_history: Vec<WireMessage>,
    /// 客户端的参数预设 id；本服务只透传回首行，由设置层解析
    #[serde(default)]
    preset_id: Option<String>,
    /// 嵌套形式的覆盖对象；与顶层字段等效，顶层优先
    #[serde(default)]
    overrides: Option<RunOverrides>,
    /// 覆盖项直接写在请求体顶层（enable_planning、max_steps 等）
    #[serde(flatten)]
    inline: RunOverrides,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

impl WireMessage {
    fn to_message(&self) -> Message {
        match self.role.as_str() {
            "user" => Message::user(&self.content),
            "system" => Message::system(&self.content),
            _ => Message::assistant(&self.content),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RunOverrides {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    enabled_tools: Option<Vec<String>>,
    #[serde(default)]
    max_steps: Option<usize>,
    #[serde(default)]
    max_replans: Option<u32>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    step_timeout_ms: Option<u64>,
    #[serde(default)]
    enable_planning: Option<bool>,
    #[serde(default)]
    enable_reflection: Option<bool>,
}

impl RunOverrides {
    fn apply(&self, mut config: WorkflowConfig) -> WorkflowConfig {
        if let Some(ref model) = self.model {
            config.model = model.clone();
        }
        if let Some(ref tools) = self.enabled_tools {
            config.enabled_tools = tools.clone();
        }
        if let Some(v) = self.max_steps {
            config.max_steps = v;
        }
        if let Some(v) = self.max_replans {
            config.max_replans = v;
        }
        if let Some(v) = self.timeout_ms {
            config.timeout_ms = v;
        }
        if let Some(v) = self.step_timeout_ms {
            config.step_timeout_ms = v;
        }
        if let Some(v) = self.enable_planning {
            config.enable_planning = v;
        }
        if let Some(v) = self.enable_reflection {
            config.enable_reflection = v;
        }
        config
    }
}

#[derive(Debug, Deserialize)]
struct CancelRequest {
    conversation_id: String,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    conversation_id: String,
    cancelled: bool,
}

#[derive(Debug, Serialize)]
struct ActiveResponse {
    conversation_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ResumeQuery {
    conversation_id: String,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    20
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mantis::observability::init();

    let config = load_config(None).unwrap_or_default();
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(
        Some(&config.llm.base_url),
        &config.llm.model,
        config.llm.api_key.as_deref(),
    ));
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    let dispatcher = ToolDispatcher::new(registry, config.tools.tool_timeout_secs);

    let orchestrator = Arc::new(Orchestrator::new(
        llm,
        dispatcher,
        SnapshotStore::new(config.app.data_dir.join("snapshots")),
        HistoryStore::new(config.app.data_dir.join("history.jsonl")),
    ));

    let bind = config.web.bind.clone();
    let state = Arc::new(AppState {
        config,
        orchestrator,
    });

    let app = Router::new()
        .route("/api/workflow/stream", post(api_workflow_stream))
        .route("/api/workflow/cancel", post(api_workflow_cancel))
        .route("/api/workflow/active", get(api_workflow_active))
        .route("/api/workflow/history", get(api_workflow_history))
        .route("/api/workflow/resume", get(api_workflow_resume))
        .route("/api/health", get(|| async { "OK" }))
        .with_state(Arc::clone(&state));

    tracing::info!("Mantis web: http://{}", bind);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// 流被丢弃（客户端断开）时请求取消；运行已结束则是无害的空操作
struct CancelOnDrop {
    orchestrator: Arc<Orchestrator>,
    conversation_id: String,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.orchestrator.cancel(&self.conversation_id) {
            tracing::info!(
                conversation_id = %self.conversation_id,
                "stream dropped, cancellation requested"
            );
        }
    }
}

/// POST /api/workflow/stream：发起一次工作流，NDJSON 逐行推送事件。
/// 同一 conversation 已有活跃运行时返回 409。
async fn api_workflow_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StreamRequest>,
) -> Result<Response, (StatusCode, String)> {
    let message = req.message.trim().to_string();
    if message.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message is required".to_string()));
    }
    let conversation_id = req
        .conversation_id
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    if state.orchestrator.is_active(&conversation_id) {
        return Err((
            StatusCode::CONFLICT,
            format!("workflow already active for conversation {}", conversation_id),
        ));
    }

    let mut config = state.config.workflow_defaults();
    if let Some(ref overrides) = req.overrides {
        config = overrides.apply(config);
    }
    let config = req.inline.apply(config);
    let llm_override: Option<Arc<dyn LlmClient>> = req
        .host
        .filter(|h| !h.is_empty())
        .map(|host| {
            Arc::new(OpenAiClient::new(
                Some(&host),
                &config.model,
                state.config.llm.api_key.as_deref(),
            )) as Arc<dyn LlmClient>
        });
    let history: Vec<Message> = req
        .conversation_history
        .iter()
        .map(WireMessage::to_message)
        .collect();

    let (sink, event_rx) = EventSink::channel();
    let orchestrator = Arc::clone(&state.orchestrator);
    let conversation_spawn = conversation_id.clone();
    tokio::spawn(async move {
        // try_begin 还会兜住与预检之间的并发窗口
        if let Err(e) = orchestrator
            .run_with_client(
                &conversation_spawn,
                &message,
                &history,
                config,
                llm_override,
                &sink,
            )
            .await
        {
            sink.emit(WorkflowEvent::Error {
                message: e.to_string(),
                recoverable: false,
            });
        }
    });

    // 首行握手也是协议内事件，消费端折叠不会计为丢行
    let first_line = encode_event_line(&WorkflowEvent::ConversationId {
        conversation_id: conversation_id.clone(),
        preset_id: req.preset_id,
    });
    let guard = CancelOnDrop {
        orchestrator: Arc::clone(&state.orchestrator),
        conversation_id,
    };

    let stream = stream::unfold(
        (event_rx, Some(first_line), guard),
        |(mut event_rx, first_line_opt, guard)| async move {
            if let Some(line) = first_line_opt {
                return Some((
                    Ok::<Bytes, std::convert::Infallible>(Bytes::from(line)),
                    (event_rx, None, guard),
                ));
            }
            match event_rx.recv().await {
                Some(ev) => Some((
                    Ok(Bytes::from(encode_event_line(&ev))),
                    (event_rx, None, guard),
                )),
                None => None,
            }
        },
    );

    let mut res = Response::new(Body::from_stream(stream));
    res.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        "application/x-ndjson; charset=utf-8"
            .parse()
            .map_err(|_| (StatusCode::INTERNAL_SERVER_ERROR, "header".to_string()))?,
    );
    Ok(res)
}

/// POST /api/workflow/cancel：请求取消；无活跃运行返回 404
async fn api_workflow_cancel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<CancelResponse>, (StatusCode, String)> {
    let cancelled = state.orchestrator.cancel(&req.conversation_id);
    if !cancelled {
        return Err((
            StatusCode::NOT_FOUND,
            format!("no active workflow for conversation {}", req.conversation_id),
        ));
    }
    Ok(Json(CancelResponse {
        conversation_id: req.conversation_id,
        cancelled,
    }))
}

/// GET /api/workflow/active：当前活跃运行的 conversation 列表
async fn api_workflow_active(State(state): State<Arc<AppState>>) -> Json<ActiveResponse> {
    Json(ActiveResponse {
        conversation_ids: state.orchestrator.active_conversations(),
    })
}

/// GET /api/workflow/resume?conversation_id=：进程重启后查询残留的在途快照。
/// 快照处于非终态时返回它，否则返回 null（终态残留会被顺手清理）
async fn api_workflow_resume(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ResumeQuery>,
) -> Result<Json<Option<WorkflowState>>, (StatusCode, String)> {
    let snapshot = state
        .orchestrator
        .snapshot_store()
        .check_active(&q.conversation_id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(snapshot))
}

/// GET /api/workflow/history?conversation_id=&limit=：最近的终态运行记录，新的在前
async fn api_workflow_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<WorkflowState>>, (StatusCode, String)> {
    let entries = state
        .orchestrator
        .history_store()
        .recent(q.conversation_id.as_deref(), q.limit)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(entries))
}
