//! HTTP 服务：流式对话端点与诊断端点
//!
//! POST /chat/stream 返回 text/event-stream，事件由流水线异步产出；
//! 客户端断开时接收端随响应一起释放，流水线在下一次发送时感知并中止。
//! 其余端点提供存活探针、provider 健康、执行端传输诊断、资源清单与
//! 上下文摘要器自省（全部不含密钥）。

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::executor::{detect_transport, DetectedTransport};
use crate::llm::ProviderRegistry;
use crate::memory::ContextSummarizer;
use crate::pipeline::{Pipeline, StreamEvent};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<AppConfig>,
    pub pipeline: Arc<Pipeline>,
    pub registry: Arc<ProviderRegistry>,
    pub summarizer: Arc<tokio::sync::Mutex<ContextSummarizer>>,
    pub http: reqwest::Client,
    pub forced_sse: bool,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/chat/stream", post(chat_stream))
        .route("/health", get(health))
        .route("/health/llm", get(health_llm))
        .route("/health/executor", get(health_executor))
        .route("/api/resources/list", get(resources_list))
        .route("/context/stats", get(context_stats))
        .route("/context/formatted", get(context_formatted))
        .route("/context/clear", post(context_clear))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!("queen orchestrator listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

/// POST /chat/stream：整条流水线的事件流
async fn chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)>
{
    let message = req.message.trim().to_string();
    if message.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "message is required".to_string()));
    }

    let (tx, rx) = mpsc::unbounded_channel::<StreamEvent>();
    let pipeline = Arc::clone(&state.pipeline);
    tokio::spawn(async move {
        pipeline.run(&message, req.session_id, tx).await;
    });

    let event_stream = stream::unfold(rx, |mut rx| async move {
        let ev = rx.recv().await?;
        let sse_event = Event::default()
            .json_data(&ev)
            .unwrap_or_else(|_| Event::default().data("{}"));
        Some((Ok(sse_event), rx))
    });

    Ok(Sse::new(event_stream))
}

/// GET /health：存活与已配置的外部服务（无密钥）
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "services": { "executor": state.cfg.executor.base_url },
        "time": chrono::Utc::now().timestamp_millis(),
    }))
}

/// GET /health/llm：现场探活后的 provider 健康快照
async fn health_llm(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.registry.check_all().await;
    Json(serde_json::json!({ "providers": state.registry.snapshot() }))
}

/// GET /health/executor：执行端传输诊断
async fn health_executor(State(state): State<AppState>) -> Json<serde_json::Value> {
    let base = state.cfg.executor.base_url.clone();
    let detected = detect_transport(&state.http, &base).await;
    let ui_detected = detected == DetectedTransport::WebSocketUi;
    let will_use_sse = state.forced_sse || !ui_detected;
    Json(serde_json::json!({
        "base": base,
        "provider": if state.cfg.executor.provider_override.is_empty() {
            "unknown"
        } else {
            state.cfg.executor.provider_override.as_str()
        },
        "uiDetected": ui_detected,
        "willUseSSE": will_use_sse,
        "forcedSse": state.forced_sse,
        "notes": if state.forced_sse { "SSE forced for provider/rule" } else { "Auto-detect" },
    }))
}

/// GET /api/resources/list：配置的资源服务器
async fn resources_list(State(state): State<AppState>) -> Json<serde_json::Value> {
    let source = if state.cfg.resources.is_empty() {
        "none"
    } else {
        "config"
    };
    Json(serde_json::json!({ "servers": state.cfg.resources, "source": source }))
}

/// GET /context/stats：摘要器统计
async fn context_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    let summarizer = state.summarizer.lock().await;
    Json(serde_json::to_value(summarizer.stats()).unwrap_or_default())
}

/// GET /context/formatted：渲染后的上下文文本
async fn context_formatted(State(state): State<AppState>) -> Json<serde_json::Value> {
    let summarizer = state.summarizer.lock().await;
    Json(serde_json::json!({ "formatted": summarizer.format_for_prompt() }))
}

/// POST /context/clear：清空摘要器状态
async fn context_clear(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut summarizer = state.summarizer.lock().await;
    summarizer.clear();
    Json(serde_json::json!({ "status": "cleared" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionOptions, Executor, TransportError};
    use crate::llm::client::mock::ScriptedChatClient;
    use crate::llm::{CallLayer, LlmError};
    use crate::memory::CharsPerToken;
    use crate::pipeline::Roles;
    use crate::session::SessionStore;
    use axum::body::Body;
    use axum::http::Request;
    use self::http_body_util_shim::collect_body;
    use tower::ServiceExt;

    // axum 0.7 测试里读 body 的小工具（避免额外依赖）
    mod http_body_util_shim {
        use axum::body::Body;
        use futures_util::StreamExt;

        pub async fn collect_body(body: Body) -> Vec<u8> {
            let mut stream = body.into_data_stream();
            let mut out = Vec::new();
            while let Some(chunk) = stream.next().await {
                out.extend_from_slice(&chunk.unwrap());
            }
            out
        }
    }

    struct NoExecutor;

    #[async_trait::async_trait]
    impl Executor for NoExecutor {
        async fn run_execution(
            &self,
            _message: &str,
            _session_id: &str,
            _opts: &ExecutionOptions,
            _text_tx: &tokio::sync::mpsc::UnboundedSender<String>,
        ) -> Result<String, TransportError> {
            Err(TransportError::EndpointNotFound)
        }
    }

    fn test_state(script: Vec<Result<String, LlmError>>) -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.providers.primary.api_key_env = String::new();
        cfg.context.state_file = dir.path().join("ctx.json");
        let cfg = Arc::new(cfg);

        let http = reqwest::Client::new();
        let registry = Arc::new(ProviderRegistry::from_config(&cfg, http.clone()));
        let summarizer = Arc::new(tokio::sync::Mutex::new(ContextSummarizer::new(
            cfg.context.max_tokens,
            cfg.context.summary_ratio,
            &cfg.context.state_file,
            Arc::new(CharsPerToken),
        )));
        let call = Arc::new(CallLayer::new(
            Arc::clone(&registry),
            Arc::new(ScriptedChatClient::new(script)),
            Arc::clone(&summarizer),
            Arc::new(CharsPerToken),
            cfg.limits.clone(),
            cfg.backoff.clone(),
        ));
        let roles = Arc::new(Roles::new(call, Arc::clone(&cfg)));
        let sessions = Arc::new(SessionStore::new(cfg.session.ttl_secs));
        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&cfg),
            roles,
            Arc::new(NoExecutor),
            sessions,
            Arc::clone(&summarizer),
        ));

        (
            AppState {
                cfg,
                pipeline,
                registry,
                summarizer,
                http,
                forced_sse: false,
            },
            dir,
        )
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (state, _dir) = test_state(vec![]);
        let app = create_router(state);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = collect_body(response.into_body()).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["services"]["executor"].is_string());
    }

    #[tokio::test]
    async fn test_resources_list_from_config() {
        let (mut state, _dir) = test_state(vec![]);
        let mut cfg = (*state.cfg).clone();
        cfg.resources.push(crate::config::ResourceServer {
            name: "playwright".to_string(),
            endpoint: "http://127.0.0.1:4001".to_string(),
            description: "browser automation".to_string(),
        });
        state.cfg = Arc::new(cfg);
        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/resources/list")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = collect_body(response.into_body()).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["source"], "config");
        assert_eq!(json["servers"][0]["name"], "playwright");
    }

    #[tokio::test]
    async fn test_context_stats_and_clear() {
        let (state, _dir) = test_state(vec![]);
        let app = create_router(state.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/context/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = collect_body(response.into_body()).await;
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["current_session_len"], 0);

        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/context/clear")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_chat_stream_requires_message() {
        let (state, _dir) = test_state(vec![]);
        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat/stream")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message": "   "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_chat_stream_is_event_stream() {
        // chat 意图：planner 回复 + chat spec → start/agent_message/complete
        let planner_reply =
            "Hello!\n{\"title\":\"Chat\",\"intent\":\"chat\",\"do_not_execute\":true}".to_string();
        let (state, _dir) = test_state(vec![Ok(planner_reply)]);
        let app = create_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/chat/stream")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"message": "hi there"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ct = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(ct.starts_with("text/event-stream"));
        let body = String::from_utf8(collect_body(response.into_body()).await).unwrap();
        assert!(body.contains("\"type\":\"start\""));
        assert!(body.contains("\"type\":\"complete\""));
    }
}
