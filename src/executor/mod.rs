//! 执行端适配器：双传输桥接外部工具代理
//!
//! 执行端是一个不透明能力，通过持久 WebSocket 或 SSE-over-HTTP 到达。
//! 传输方式运行时探测，配置可强制 SSE（某些上游在 WS 下的 tool 帧时序
//! 有问题）。`run_execution` 在明确要求工具时优先 SSE，否则先试 WS、
//! 失败再退 SSE（不带工具）。流式文本增量转发；流中问题帧先经「这真的
//! 是问题吗」启发式分类，再由规划角色生成简短回答回注同一会话（仅 SSE
//! 模式）。执行端报上下文溢出时压缩消息换备用传输重发一次；端点确定
//! 不可用时上抛诊断错误而非静默失败。

pub mod detect;
pub mod evidence;
pub mod sse;
pub mod ws;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::ExecutorSection;
use crate::llm::cap_tail;

pub use detect::{detect_transport, DetectedTransport};
pub use evidence::{extract_evidence, Evidence};
pub use sse::SseTransport;
pub use ws::WsTransport;

/// 传输层错误
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("execution endpoint not found (404)")]
    EndpointNotFound,

    /// 执行端报告上下文溢出，可压缩后换传输重发
    #[error("executor reported context overflow: {0}")]
    ContextOverflow(String),

    /// 上游要求客户端管理 tool 帧时序（WS 不可用，须走 SSE）
    #[error("tool-call sequencing unsupported over this transport: {0}")]
    ToolSequencing(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// 按远端报文内容分类错误
pub fn classify_remote_error(status: u16, message: &str) -> TransportError {
    let m = message.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
    if status == 404 || m.contains("not found") {
        return TransportError::EndpointNotFound;
    }
    if m.contains("model_max_prompt_tokens_exceeded")
        || m.contains("prompt token count")
        || m.contains("context length")
    {
        return TransportError::ContextOverflow(truncate(message, 200));
    }
    if m.contains("tool_calls") || m.contains("tool messages") {
        return TransportError::ToolSequencing(truncate(message, 200));
    }
    TransportError::Protocol(truncate(message, 300))
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// 一次执行请求
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub message: String,
    pub session_id: String,
    pub system_instruction: Option<String>,
    pub working_dir: String,
    pub enable_tools: bool,
}

/// 执行选项（对外接口）
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub enable_tools: bool,
    pub system_instruction: Option<String>,
    pub working_dir_hint: Option<String>,
}

/// 传输帧回调：文本增量与流中问题
pub trait FrameSink: Send + Sync {
    fn on_text(&self, text: &str);
    fn on_question(&self, question: &str);
}

/// 单一能力接口：发送消息并以流式回传（两种传输各自实现）
#[async_trait]
pub trait ExecutionTransport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(
        &self,
        req: &ExecutionRequest,
        sink: &dyn FrameSink,
    ) -> Result<String, TransportError>;
}

/// 流中问题的自动应答者（由规划角色实现）
#[async_trait]
pub trait QuestionAnswerer: Send + Sync {
    /// 这段文本是不是一个需要回答的澄清问题
    async fn is_clarifying_question(&self, text: &str) -> bool;
    /// 生成简短回答
    async fn short_answer(&self, question: &str) -> Option<String>;
}

/// 执行器对外接口（流水线只依赖这个 trait，便于替换与测试）
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run_execution(
        &self,
        message: &str,
        session_id: &str,
        opts: &ExecutionOptions,
        text_tx: &mpsc::UnboundedSender<String>,
    ) -> Result<String, TransportError>;
}

struct SinkInner {
    text_tx: mpsc::UnboundedSender<String>,
    answered: Mutex<HashSet<String>>,
    answerer: Arc<dyn QuestionAnswerer>,
    client: reqwest::Client,
    base_url: String,
    secret: Option<String>,
    session_id: String,
    working_dir: String,
    auto_answer: bool,
}

/// 帧回调实现：文本转发 + 问题去重后异步自动应答
#[derive(Clone)]
struct AdapterSink {
    inner: Arc<SinkInner>,
}

impl AdapterSink {
    /// 归一化前 160 个字符作为去重键
    fn dedup_key(text: &str) -> String {
        text.trim().to_lowercase().chars().take(160).collect()
    }

    fn spawn_answer(&self, question: String, pre_classified: bool) {
        if !self.inner.auto_answer {
            tracing::debug!("executor question received, auto-answer disabled for this transport");
            return;
        }
        {
            let mut answered = self.inner.answered.lock().unwrap();
            if !answered.insert(Self::dedup_key(&question)) {
                return;
            }
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if !pre_classified {
                // 快速启发式：明显不是问题就不打扰规划角色
                if !looks_like_question(&question) {
                    return;
                }
                if !inner.answerer.is_clarifying_question(&question).await {
                    return;
                }
            }
            if let Some(answer) = inner.answerer.short_answer(&question).await {
                let _ = inner.text_tx.send(format!("[auto-answer] {}", answer));
                sse::post_answer_back(
                    &inner.client,
                    &inner.base_url,
                    inner.secret.as_deref(),
                    &inner.session_id,
                    &answer,
                    &inner.working_dir,
                )
                .await;
            }
        });
    }
}

impl FrameSink for AdapterSink {
    fn on_text(&self, text: &str) {
        let _ = self.inner.text_tx.send(text.to_string());
        // 流式文本也可能内嵌澄清问题，交给分类器判定
        if looks_like_question(text) {
            self.spawn_answer(text.to_string(), false);
        }
    }

    fn on_question(&self, question: &str) {
        // 显式问题帧跳过启发式，直接请求回答
        self.spawn_answer(question.to_string(), true);
    }
}

/// 粗筛：疑问句措辞才进入 LLM 分类
pub fn looks_like_question(text: &str) -> bool {
    let t = text.trim();
    if t.len() < 3 {
        return false;
    }
    if t.contains('?') {
        return true;
    }
    let lower = t.to_lowercase();
    ["which ", "what ", "should i", "do you want", "please confirm", "clarify"]
        .iter()
        .any(|p| lower.starts_with(p) || lower.contains(p))
}

/// 生产实现：探测 + 双传输 + 单次换传输重试
pub struct ExecutionAdapter {
    client: reqwest::Client,
    cfg: ExecutorSection,
    secret: Option<String>,
    answerer: Arc<dyn QuestionAnswerer>,
    max_message_chars: usize,
}

impl ExecutionAdapter {
    pub fn new(
        client: reqwest::Client,
        cfg: ExecutorSection,
        answerer: Arc<dyn QuestionAnswerer>,
        max_message_chars: usize,
    ) -> Self {
        let secret = if cfg.secret_key_env.is_empty() {
            None
        } else {
            std::env::var(&cfg.secret_key_env).ok().filter(|v| !v.is_empty())
        };
        Self {
            client,
            cfg,
            secret,
            answerer,
            max_message_chars,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.cfg.base_url
    }

    /// 配置是否强制 SSE（全局开关或已知问题 provider 命中）
    pub fn forced_sse(&self) -> bool {
        if self.cfg.force_sse {
            return true;
        }
        let provider = self.cfg.provider_override.to_lowercase();
        !provider.is_empty()
            && self
                .cfg
                .sse_only_providers
                .iter()
                .any(|p| p.to_lowercase() == provider)
    }

    fn make_sink(
        &self,
        session_id: &str,
        working_dir: &str,
        text_tx: &mpsc::UnboundedSender<String>,
        auto_answer: bool,
    ) -> AdapterSink {
        AdapterSink {
            inner: Arc::new(SinkInner {
                text_tx: text_tx.clone(),
                answered: Mutex::new(HashSet::new()),
                answerer: Arc::clone(&self.answerer),
                client: self.client.clone(),
                base_url: self.cfg.base_url.clone(),
                secret: self.secret.clone(),
                session_id: session_id.to_string(),
                working_dir: working_dir.to_string(),
                auto_answer,
            }),
        }
    }

    fn request(
        &self,
        message: &str,
        session_id: &str,
        opts: &ExecutionOptions,
        working_dir: &str,
    ) -> ExecutionRequest {
        ExecutionRequest {
            message: cap_tail(message, self.max_message_chars),
            session_id: session_id.to_string(),
            system_instruction: opts.system_instruction.clone(),
            working_dir: working_dir.to_string(),
            enable_tools: opts.enable_tools,
        }
    }
}

#[async_trait]
impl Executor for ExecutionAdapter {
    async fn run_execution(
        &self,
        message: &str,
        session_id: &str,
        opts: &ExecutionOptions,
        text_tx: &mpsc::UnboundedSender<String>,
    ) -> Result<String, TransportError> {
        let working_dir = opts
            .working_dir_hint
            .clone()
            .unwrap_or_else(|| self.cfg.working_dir.clone());
        let sse = SseTransport::new(self.client.clone(), &self.cfg.base_url, self.secret.clone());
        let ws = WsTransport::new(&self.cfg.base_url);
        let req = self.request(message, session_id, opts, &working_dir);

        // 明确要求工具：SSE 优先（代理侧自行管理工具），失败退 WS
        if opts.enable_tools {
            let sink = self.make_sink(session_id, &working_dir, text_tx, true);
            match sse.execute(&req, &sink).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!("sse with tools failed ({}), trying websocket", e);
                    let ws_sink = self.make_sink(session_id, &working_dir, text_tx, false);
                    let mut ws_req = req.clone();
                    ws_req.enable_tools = false;
                    return ws.execute(&ws_req, &ws_sink).await;
                }
            }
        }

        let use_ws = !self.forced_sse()
            && detect_transport(&self.client, &self.cfg.base_url).await
                == DetectedTransport::WebSocketUi;

        if use_ws {
            let ws_sink = self.make_sink(session_id, &working_dir, text_tx, false);
            match ws.execute(&req, &ws_sink).await {
                Ok(text) => Ok(text),
                Err(TransportError::ContextOverflow(msg)) => {
                    // 压缩一半换 SSE 重发一次
                    tracing::warn!("websocket reported context overflow ({}), recompressing for sse", msg);
                    let mut compressed = req.clone();
                    compressed.message =
                        cap_tail(&req.message, (self.max_message_chars / 2).max(2000));
                    let sink = self.make_sink(session_id, &working_dir, text_tx, true);
                    sse.execute(&compressed, &sink).await
                }
                Err(TransportError::ToolSequencing(msg)) => {
                    tracing::warn!("websocket tool sequencing issue ({}), falling back to sse", msg);
                    let sink = self.make_sink(session_id, &working_dir, text_tx, true);
                    sse.execute(&req, &sink).await
                }
                Err(TransportError::EndpointNotFound) => {
                    let sink = self.make_sink(session_id, &working_dir, text_tx, true);
                    sse.execute(&req, &sink).await
                }
                Err(e) => Err(e),
            }
        } else {
            let sink = self.make_sink(session_id, &working_dir, text_tx, true);
            match sse.execute(&req, &sink).await {
                Ok(text) => Ok(text),
                Err(TransportError::ContextOverflow(msg)) => {
                    tracing::warn!("sse reported context overflow ({}), recompressing for websocket", msg);
                    let mut compressed = req.clone();
                    compressed.message =
                        cap_tail(&req.message, (self.max_message_chars / 2).max(2000));
                    let ws_sink = self.make_sink(session_id, &working_dir, text_tx, false);
                    ws.execute(&compressed, &ws_sink).await
                }
                Err(TransportError::EndpointNotFound) if !self.forced_sse() => {
                    // /reply 缺失（常见于 Web UI），换 WS 试一次
                    tracing::warn!("/reply not available, trying websocket once");
                    let ws_sink = self.make_sink(session_id, &working_dir, text_tx, false);
                    ws.execute(&req, &ws_sink).await
                }
                Err(e) => Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_remote_error() {
        assert!(matches!(
            classify_remote_error(404, "whatever"),
            TransportError::EndpointNotFound
        ));
        assert!(matches!(
            classify_remote_error(0, "model_max_prompt_tokens_exceeded: 50000"),
            TransportError::ContextOverflow(_)
        ));
        // 报文被折行也要能识别
        assert!(matches!(
            classify_remote_error(0, "tool_calls  must be\nfollowed by tool messages"),
            TransportError::ToolSequencing(_)
        ));
        assert!(matches!(
            classify_remote_error(500, "boom"),
            TransportError::Protocol(_)
        ));
    }

    #[test]
    fn test_looks_like_question() {
        assert!(looks_like_question("Which directory should I use?"));
        assert!(looks_like_question("what branch do you want"));
        assert!(looks_like_question("Please confirm the target host"));
        assert!(!looks_like_question("Installed dependencies successfully."));
        assert!(!looks_like_question("ok"));
    }

    #[test]
    fn test_forced_sse_by_provider_rule() {
        let mut cfg = ExecutorSection::default();
        cfg.provider_override = "github_copilot".to_string();
        let adapter = ExecutionAdapter::new(
            reqwest::Client::new(),
            cfg,
            Arc::new(NoAnswers),
            28000,
        );
        assert!(adapter.forced_sse());

        let mut cfg = ExecutorSection::default();
        cfg.provider_override = "some_other".to_string();
        let adapter = ExecutionAdapter::new(
            reqwest::Client::new(),
            cfg,
            Arc::new(NoAnswers),
            28000,
        );
        assert!(!adapter.forced_sse());
    }

    struct NoAnswers;

    #[async_trait]
    impl QuestionAnswerer for NoAnswers {
        async fn is_clarifying_question(&self, _text: &str) -> bool {
            false
        }
        async fn short_answer(&self, _question: &str) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_dedup_key_normalizes() {
        let a = AdapterSink::dedup_key("  Which PORT should I use?  ");
        let b = AdapterSink::dedup_key("which port should i use?");
        assert_eq!(a, b);
    }
}
