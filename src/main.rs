//! queen 服务入口
//!
//! 装配顺序：配置 → 注册表（后台探活）→ 摘要器（磁盘回载）→ 弹性调用层
//! → 角色 → 执行端适配器 → 流水线 → HTTP 服务。

use std::sync::Arc;

use queen::config::load_config;
use queen::executor::ExecutionAdapter;
use queen::llm::{CallLayer, HttpChatClient, ProviderRegistry};
use queen::memory::{CharsPerToken, ContextSummarizer};
use queen::pipeline::{Pipeline, Roles};
use queen::server::{serve, AppState};
use queen::session::SessionStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    queen::observability::init();

    let cfg = Arc::new(load_config(None).unwrap_or_else(|e| {
        tracing::warn!("config load failed ({}), using defaults", e);
        queen::config::AppConfig::default()
    }));

    let http = reqwest::Client::new();

    let registry = Arc::new(ProviderRegistry::from_config(&cfg, http.clone()));
    let _health_task = registry.spawn_health_loop();

    let estimator = Arc::new(CharsPerToken);
    let summarizer = Arc::new(tokio::sync::Mutex::new(ContextSummarizer::new(
        cfg.context.max_tokens,
        cfg.context.summary_ratio,
        &cfg.context.state_file,
        estimator.clone(),
    )));
    {
        let s = summarizer.lock().await;
        tracing::info!(
            "context summarizer ready: {} max tokens, {}% summary ratio",
            s.max_tokens(),
            (s.summary_ratio() * 100.0).round()
        );
    }

    let call = Arc::new(CallLayer::new(
        Arc::clone(&registry),
        Arc::new(HttpChatClient::new(http.clone())),
        Arc::clone(&summarizer),
        estimator,
        cfg.limits.clone(),
        cfg.backoff.clone(),
    ));
    let roles = Arc::new(Roles::new(call, Arc::clone(&cfg)));

    let adapter = Arc::new(ExecutionAdapter::new(
        http.clone(),
        cfg.executor.clone(),
        Arc::clone(&roles) as Arc<dyn queen::executor::QuestionAnswerer>,
        cfg.limits.max_user_chars,
    ));
    let forced_sse = adapter.forced_sse();

    let sessions = Arc::new(SessionStore::new(cfg.session.ttl_secs));
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&cfg),
        roles,
        adapter,
        sessions,
        Arc::clone(&summarizer),
    ));

    let port = cfg.server.port;
    let state = AppState {
        cfg,
        pipeline,
        registry,
        summarizer,
        http,
        forced_sse,
    };

    serve(state, port).await
}
