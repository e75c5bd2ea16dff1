//! 弹性调用层：结构化输出的多级级联调用
//!
//! `call_json_only` 在一次调用里组合了：上下文摘要拼接、提示词预截断、
//! 逐次尝试的 JSON 解析与指令收紧、「提示词过长」时按次递增的收缩因子、
//! 429/5xx 的指数退避加抖动。底层 `cascade` 按注册表给出的路由逐个候选
//! 调用：主 provider 的模型序列 → 本地 OpenAI 兼容兜底（404 时交换
//! /v1 与 /api 再试一次）→ 可选的多模型网关，前一级候选耗尽才进入下一级。
//! 成功结果携带 attempts_used 供可观测性使用。

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;

use crate::config::{BackoffSection, LimitsSection};
use crate::llm::client::{CallTarget, ChatClient, ChatMessage};
use crate::llm::registry::ProviderRegistry;
use crate::llm::LlmError;
use crate::memory::{ContextSummarizer, TokenEstimator};

/// 一次弹性调用的选项
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub max_attempts: u32,
    pub temperature: f32,
    pub timeout: Duration,
    pub session_id: Option<String>,
    pub intent_hint: Option<String>,
}

impl CallOptions {
    pub fn new(max_attempts: u32, temperature: f32, timeout_secs: u64) -> Self {
        Self {
            max_attempts,
            temperature,
            timeout: Duration::from_secs(timeout_secs),
            session_id: None,
            intent_hint: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent_hint = Some(intent.into());
        self
    }
}

/// JSON 调用结果：解析后的值 + 实际用掉的尝试次数
#[derive(Debug, Clone)]
pub struct JsonOutcome {
    pub value: Value,
    pub attempts_used: u32,
}

/// 文本调用结果
#[derive(Debug, Clone)]
pub struct TextOutcome {
    pub text: String,
    pub attempts_used: u32,
}

const JSON_TIGHTEN_INSTRUCTION: &str = "IMPORTANT: Return ONLY valid minified JSON \
(no markdown, no prose, no comments). If you previously included any non-JSON text, remove it.";

pub struct CallLayer {
    registry: Arc<ProviderRegistry>,
    client: Arc<dyn ChatClient>,
    summarizer: Arc<tokio::sync::Mutex<ContextSummarizer>>,
    estimator: Arc<dyn TokenEstimator>,
    limits: LimitsSection,
    backoff: BackoffSection,
}

impl CallLayer {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        client: Arc<dyn ChatClient>,
        summarizer: Arc<tokio::sync::Mutex<ContextSummarizer>>,
        estimator: Arc<dyn TokenEstimator>,
        limits: LimitsSection,
        backoff: BackoffSection,
    ) -> Self {
        Self {
            registry,
            client,
            summarizer,
            estimator,
            limits,
            backoff,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// 强制 JSON 输出的弹性调用
    pub async fn call_json_only(
        &self,
        role: &str,
        system: &str,
        user: &str,
        opts: &CallOptions,
    ) -> Result<JsonOutcome, LlmError> {
        let (mut sys, mut usr) = self.prepare_prompts(system, user).await;

        let mut attempts = 0u32;
        let mut last: Option<LlmError> = None;

        while attempts < opts.max_attempts.max(1) {
            attempts += 1;
            let sys_safe = cap_head(&sys, self.limits.max_system_chars);
            let usr_safe = cap_tail(&usr, self.limits.max_user_chars);

            match self
                .cascade(role, &sys_safe, &usr_safe, opts.temperature, opts.intent_hint.as_deref(), opts.timeout)
                .await
            {
                Ok(text) => match parse_json_lenient(&text) {
                    Some(value) => {
                        return Ok(JsonOutcome {
                            value,
                            attempts_used: attempts,
                        })
                    }
                    None => {
                        last = Some(LlmError::MalformedOutput(cap_head(&text, 120)));
                        // 只收紧 system 指令，user 内容保持不动以免语义漂移
                        sys = format!("{}\n\n{}", system, JSON_TIGHTEN_INSTRUCTION);
                    }
                },
                Err(e) => {
                    self.handle_call_error(&e, attempts, &mut sys, &mut usr).await;
                    last = Some(e);
                }
            }
        }

        Err(LlmError::Exhausted {
            last: last.map(|e| e.to_string()).unwrap_or_else(|| "unknown".into()),
        })
    }

    /// 自由文本输出的弹性调用（规划角色的 reply + TaskSpec 混合输出走这里）
    pub async fn call_text(
        &self,
        role: &str,
        system: &str,
        user: &str,
        opts: &CallOptions,
    ) -> Result<TextOutcome, LlmError> {
        let (mut sys, mut usr) = self.prepare_prompts(system, user).await;

        let mut attempts = 0u32;
        let mut last: Option<LlmError> = None;

        while attempts < opts.max_attempts.max(1) {
            attempts += 1;
            let sys_safe = cap_head(&sys, self.limits.max_system_chars);
            let usr_safe = cap_tail(&usr, self.limits.max_user_chars);

            match self
                .cascade(role, &sys_safe, &usr_safe, opts.temperature, opts.intent_hint.as_deref(), opts.timeout)
                .await
            {
                Ok(text) => {
                    return Ok(TextOutcome {
                        text,
                        attempts_used: attempts,
                    })
                }
                Err(e) => {
                    self.handle_call_error(&e, attempts, &mut sys, &mut usr).await;
                    last = Some(e);
                }
            }
        }

        Err(LlmError::Exhausted {
            last: last.map(|e| e.to_string()).unwrap_or_else(|| "unknown".into()),
        })
    }

    /// 尝试前的公共准备：超预算时拼接摘要器上下文，再整体预截断
    async fn prepare_prompts(&self, system: &str, user: &str) -> (String, String) {
        let mut sys = system.to_string();
        let usr = user.to_string();

        {
            let summarizer = self.summarizer.lock().await;
            if summarizer.should_summarize(&format!("{}{}", sys, usr)) {
                let optimized = summarizer.format_for_prompt();
                if !optimized.is_empty() {
                    tracing::info!("input over budget, splicing summarized context into system prompt");
                    sys = format!("{}\n\n{}", system, optimized);
                }
            }
        }

        smart_truncate(&sys, &usr, self.limits.precheck_tokens, self.estimator.as_ref())
    }

    /// 按错误类别就地调整提示词：过长则收缩，瞬时错误则退避
    async fn handle_call_error(
        &self,
        err: &LlmError,
        attempt: u32,
        sys: &mut String,
        usr: &mut String,
    ) {
        match err {
            LlmError::PromptTooLarge(_) => {
                // 收缩因子随尝试次数递增，但不低于 0.3
                let factor = (0.8 - 0.15 * attempt as f64).max(0.3);
                let usr_target = ((usr.chars().count() as f64 * factor) as usize).max(1000);
                let sys_target = ((sys.chars().count() as f64 * factor) as usize).max(1000);
                let old = (sys.chars().count(), usr.chars().count());
                *usr = cap_tail(usr, usr_target.min(self.limits.max_user_chars));
                *sys = cap_head(sys, sys_target.min(self.limits.max_system_chars));
                tracing::info!(
                    "attempt {}: token limit exceeded, shrinking system {} -> {}, user {} -> {}",
                    attempt,
                    old.0,
                    sys.chars().count(),
                    old.1,
                    usr.chars().count()
                );
            }
            LlmError::RateLimited | LlmError::Server { .. } => {
                let delay = backoff_delay(attempt, self.backoff.base_ms, self.backoff.max_ms)
                    + jitter(self.backoff.jitter_ms);
                tracing::info!("attempt {}: transient provider error, backing off {:?}", attempt, delay);
                tokio::time::sleep(delay).await;
                // 顺带略减 system，给下一轮候选留余量
                *sys = cap_head(sys, self.limits.max_system_chars * 8 / 10);
            }
            _ => {}
        }
    }

    /// 一轮完整级联：按路由顺序逐候选调用，回报结果；不可重试错误跳过该
    /// provider 余下的候选。最后一个错误按原类别上抛，供上层分类处理。
    pub async fn cascade(
        &self,
        role: &str,
        system: &str,
        user: &str,
        temperature: f32,
        intent_hint: Option<&str>,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let routes = self.registry.get_routes(role, intent_hint);
        if routes.is_empty() {
            return Err(LlmError::Exhausted {
                last: format!("no routes available for role '{}'", role),
            });
        }

        let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let mut last: Option<LlmError> = None;
        let mut skip_provider: Option<String> = None;

        for route in &routes {
            if skip_provider.as_deref() == Some(route.provider.as_str()) {
                continue;
            }

            let started = Instant::now();
            match self
                .client
                .complete(&route.target, &messages, temperature, timeout)
                .await
            {
                Ok(text) => {
                    self.registry
                        .report_success(&route.provider, Some(started.elapsed().as_millis() as u64));
                    return Ok(text);
                }
                Err(e) => {
                    self.registry.report_failure(&route.provider);
                    tracing::debug!(
                        "candidate {}@{} failed: {}",
                        route.target.model,
                        route.provider,
                        e
                    );

                    // 本地兜底端点 404：一些部署暴露 /api 而非 /v1，交换后再试一次
                    if route.provider == "fallback" && matches!(e, LlmError::EndpointNotFound) {
                        if let Some(alt_base) = swap_api_base(&route.target.base_url) {
                            tracing::warn!(
                                "fallback endpoint 404, retrying with alternate base {}",
                                alt_base
                            );
                            let alt = CallTarget {
                                base_url: alt_base,
                                model: route.target.model.clone(),
                                api_key: route.target.api_key.clone(),
                            };
                            if let Ok(text) = self
                                .client
                                .complete(&alt, &messages, temperature, timeout)
                                .await
                            {
                                self.registry.report_success(&route.provider, None);
                                return Ok(text);
                            }
                        }
                    }

                    if !e.is_retriable() {
                        skip_provider = Some(route.provider.clone());
                    }
                    last = Some(e);
                }
            }
        }

        Err(last.unwrap_or(LlmError::Exhausted {
            last: "no candidates attempted".into(),
        }))
    }
}

/// 纯函数退避：base · 2^(attempt-1)，封顶 max（抖动由 `jitter` 单独加）
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let expo = base_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    Duration::from_millis(expo.min(max_ms))
}

fn jitter(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}

/// 保留开头 max 个字符
pub fn cap_head(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// 保留末尾 max 个字符
pub fn cap_tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// 整体超预算时的预截断：system 头部保留（至多 30% 预算），user 尾部保留
pub fn smart_truncate(
    system: &str,
    user: &str,
    max_tokens: usize,
    estimator: &dyn TokenEstimator,
) -> (String, String) {
    let sys_tokens = estimator.estimate(system);
    let user_tokens = estimator.estimate(user);
    if sys_tokens + user_tokens <= max_tokens {
        return (system.to_string(), user.to_string());
    }

    let sys_target = sys_tokens.min(max_tokens * 3 / 10);
    let user_target = max_tokens - sys_target;
    tracing::info!(
        "smart truncate: {} tokens over target {}, system -> {}, user -> {}",
        sys_tokens + user_tokens,
        max_tokens,
        sys_target,
        user_target
    );
    (
        cap_head(system, sys_target * 4),
        cap_tail(user, user_target * 4),
    )
}

/// 宽松 JSON 解析：直接解析 → ```json 围栏 → 任意围栏 → 首尾花括号块
pub fn parse_json_lenient(text: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str::<Value>(text.trim()) {
        if v.is_object() || v.is_array() {
            return Some(v);
        }
    }

    for fence in ["```json", "```"] {
        if let Some(start) = text.find(fence) {
            let inner = &text[start + fence.len()..];
            if let Some(end) = inner.find("```") {
                let candidate = inner[..end].trim();
                if let Ok(v) = serde_json::from_str::<Value>(candidate) {
                    if v.is_object() || v.is_array() {
                        return Some(v);
                    }
                }
            }
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end]).ok()
}

fn swap_api_base(base: &str) -> Option<String> {
    if base.contains("/v1") {
        Some(base.replace("/v1", "/api"))
    } else if base.contains("/api") {
        Some(base.replace("/api", "/v1"))
    } else {
        Some(format!("{}/v1", base.trim_end_matches('/')))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::llm::client::mock::ScriptedChatClient;
    use crate::memory::CharsPerToken;

    fn layer_with(script: Vec<Result<String, LlmError>>) -> (CallLayer, tempfile::TempDir) {
        let mut cfg = AppConfig::default();
        cfg.providers.primary.models = vec!["m1".to_string(), "m2".to_string()];
        cfg.providers.primary.api_key_env = String::new();
        cfg.backoff = BackoffSection {
            base_ms: 1,
            max_ms: 2,
            jitter_ms: 1,
        };
        let registry = Arc::new(ProviderRegistry::from_config(&cfg, reqwest::Client::new()));
        let dir = tempfile::tempdir().unwrap();
        let summarizer = Arc::new(tokio::sync::Mutex::new(ContextSummarizer::new(
            45000,
            0.3,
            dir.path().join("ctx.json"),
            Arc::new(CharsPerToken),
        )));
        let layer = CallLayer::new(
            registry,
            Arc::new(ScriptedChatClient::new(script)),
            summarizer,
            Arc::new(CharsPerToken),
            cfg.limits.clone(),
            cfg.backoff.clone(),
        );
        (layer, dir)
    }

    fn opts(max_attempts: u32) -> CallOptions {
        CallOptions::new(max_attempts, 0.0, 5)
    }

    #[test]
    fn test_backoff_delay_is_pure_and_capped() {
        assert_eq!(backoff_delay(1, 400, 8000), Duration::from_millis(400));
        assert_eq!(backoff_delay(2, 400, 8000), Duration::from_millis(800));
        assert_eq!(backoff_delay(3, 400, 8000), Duration::from_millis(1600));
        assert_eq!(backoff_delay(10, 400, 8000), Duration::from_millis(8000));
    }

    #[test]
    fn test_cap_head_tail_unicode_safe() {
        assert_eq!(cap_head("héllo wörld", 5), "héllo");
        assert_eq!(cap_tail("héllo wörld", 5), "wörld");
        assert_eq!(cap_head("ab", 10), "ab");
    }

    #[test]
    fn test_smart_truncate_splits_budget() {
        let system = "s".repeat(8000);
        let user = "u".repeat(80000);
        let (s, u) = smart_truncate(&system, &user, 10000, &CharsPerToken);
        let total = CharsPerToken.estimate(&s) + CharsPerToken.estimate(&u);
        assert!(total <= 10000);
        // system 保头，user 保尾
        assert!(s.starts_with('s'));
        assert!(u.ends_with('u'));
    }

    #[test]
    fn test_parse_json_lenient_variants() {
        assert!(parse_json_lenient(r#"{"a":1}"#).is_some());
        assert!(parse_json_lenient("Sure!\n```json\n{\"a\":1}\n```").is_some());
        assert!(parse_json_lenient("prefix {\"a\": {\"b\": 2}} suffix").is_some());
        assert!(parse_json_lenient("no json here").is_none());
        assert!(parse_json_lenient("").is_none());
    }

    #[tokio::test]
    async fn test_json_call_first_attempt_success() {
        let (layer, _dir) = layer_with(vec![Ok(r#"{"ok":true}"#.to_string())]);
        let out = layer
            .call_json_only("planner", "sys", "user", &opts(3))
            .await
            .unwrap();
        assert_eq!(out.attempts_used, 1);
        assert_eq!(out.value["ok"], true);
    }

    #[tokio::test]
    async fn test_json_call_tightens_instruction_on_parse_failure() {
        let (layer, _dir) = layer_with(vec![
            Ok("not json at all".to_string()),
            Ok(r#"{"ok":1}"#.to_string()),
        ]);
        let out = layer
            .call_json_only("planner", "sys", "user", &opts(3))
            .await
            .unwrap();
        assert_eq!(out.attempts_used, 2);
    }

    #[tokio::test]
    async fn test_json_call_retries_rate_limit_with_backoff() {
        let (layer, _dir) = layer_with(vec![
            Err(LlmError::RateLimited),
            Err(LlmError::RateLimited),
            Ok(r#"{"done":true}"#.to_string()),
        ]);
        let out = layer
            .call_json_only("auditor", "sys", "user", &opts(5))
            .await
            .unwrap();
        // 前两个候选失败属于同一次级联尝试，成功仍落在第一轮
        assert_eq!(out.attempts_used, 1);
        assert_eq!(out.value["done"], true);
    }

    #[tokio::test]
    async fn test_json_call_exhaustion_yields_error() {
        let (layer, _dir) = layer_with(vec![Ok("still not json".to_string())]);
        let err = layer
            .call_json_only("planner", "sys", "user", &opts(2))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn test_prompt_too_large_shrinks_user_tail() {
        let big_user = format!("{}END", "x".repeat(20000));
        let (layer, _dir) = layer_with(vec![
            Err(LlmError::PromptTooLarge("too big".into())),
            Err(LlmError::PromptTooLarge("too big".into())),
            Err(LlmError::PromptTooLarge("too big".into())),
            Err(LlmError::PromptTooLarge("too big".into())),
            Ok(r#"{"ok":true}"#.to_string()),
        ]);
        let out = layer
            .call_json_only("planner", "sys", &big_user, &opts(5))
            .await
            .unwrap();
        assert!(out.attempts_used >= 2);
    }

    #[tokio::test]
    async fn test_non_retriable_skips_rest_of_provider() {
        // m1 返回 401（不可重试）→ 跳过 primary 的 m2，直接进入 fallback
        let client = ScriptedChatClient::new(vec![
            Err(LlmError::Unauthorized { status: 401 }),
            Ok("from fallback".to_string()),
        ]);
        let mut cfg = AppConfig::default();
        cfg.providers.primary.models = vec!["m1".to_string(), "m2".to_string()];
        cfg.providers.primary.api_key_env = String::new();
        let registry = Arc::new(ProviderRegistry::from_config(&cfg, reqwest::Client::new()));
        let dir = tempfile::tempdir().unwrap();
        let summarizer = Arc::new(tokio::sync::Mutex::new(ContextSummarizer::new(
            45000,
            0.3,
            dir.path().join("ctx.json"),
            Arc::new(CharsPerToken),
        )));
        let client = Arc::new(client);
        let layer = CallLayer::new(
            registry,
            client.clone(),
            summarizer,
            Arc::new(CharsPerToken),
            cfg.limits.clone(),
            cfg.backoff.clone(),
        );

        let text = layer
            .cascade("planner", "s", "u", 0.0, None, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(text, "from fallback");
        let calls = client.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].contains("3010"), "second call should hit fallback: {:?}", *calls);
    }

    #[tokio::test]
    async fn test_text_call_returns_raw_output() {
        let (layer, _dir) = layer_with(vec![Ok("free text reply".to_string())]);
        let out = layer
            .call_text("planner", "sys", "user", &opts(2))
            .await
            .unwrap();
        assert_eq!(out.text, "free text reply");
        assert_eq!(out.attempts_used, 1);
    }
}
