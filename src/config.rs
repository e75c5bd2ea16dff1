//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `QUEEN__*` 覆盖（双下划线表示嵌套，
//! 如 `QUEEN__PIPELINE__FORCE_VERIFICATION=true`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub roles: RolesSection,
    pub backoff: BackoffSection,
    pub limits: LimitsSection,
    pub pipeline: PipelineSection,
    pub context: ContextSection,
    pub session: SessionSection,
    pub executor: ExecutorSection,
    pub providers: ProvidersSection,
    /// 执行端可见的资源服务器清单（相当于可发现的工具端点）
    pub resources: Vec<ResourceServer>,
}

/// [server] 段：监听端口
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    5101
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

/// [roles] 段：各角色的尝试上限、超时与可选模型覆盖
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RolesSection {
    pub planner: RoleSection,
    pub auditor: RoleSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoleSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_role_timeout_secs")]
    pub timeout_secs: u64,
    /// 主 provider 上本角色的候选模型；为空时用 provider 默认列表
    #[serde(default)]
    pub models: Vec<String>,
}

fn default_max_attempts() -> u32 {
    6
}

fn default_role_timeout_secs() -> u64 {
    45
}

impl Default for RoleSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            timeout_secs: default_role_timeout_secs(),
            models: Vec::new(),
        }
    }
}

/// [backoff] 段：指数退避参数
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffSection {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_backoff_base_ms() -> u64 {
    400
}

fn default_backoff_max_ms() -> u64 {
    8000
}

fn default_backoff_jitter_ms() -> u64 {
    400
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
            jitter_ms: default_backoff_jitter_ms(),
        }
    }
}

/// [limits] 段：提示词尺寸上限（字符）
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_system_chars")]
    pub max_system_chars: usize,
    #[serde(default = "default_max_user_chars")]
    pub max_user_chars: usize,
    #[serde(default = "default_max_taskspec_chars")]
    pub max_taskspec_chars: usize,
    #[serde(default = "default_max_exec_report_chars")]
    pub max_exec_report_chars: usize,
    #[serde(default = "default_max_verify_evidence_chars")]
    pub max_verify_evidence_chars: usize,
    #[serde(default = "default_max_resource_ctx_chars")]
    pub max_resource_ctx_chars: usize,
    /// call_json_only 进入尝试循环前的整体 token 预检上限
    #[serde(default = "default_precheck_tokens")]
    pub precheck_tokens: usize,
}

fn default_max_system_chars() -> usize {
    4000
}

fn default_max_user_chars() -> usize {
    28000
}

fn default_max_taskspec_chars() -> usize {
    12000
}

fn default_max_exec_report_chars() -> usize {
    12000
}

fn default_max_verify_evidence_chars() -> usize {
    10000
}

fn default_max_resource_ctx_chars() -> usize {
    4000
}

fn default_precheck_tokens() -> usize {
    14000
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_system_chars: default_max_system_chars(),
            max_user_chars: default_max_user_chars(),
            max_taskspec_chars: default_max_taskspec_chars(),
            max_exec_report_chars: default_max_exec_report_chars(),
            max_verify_evidence_chars: default_max_verify_evidence_chars(),
            max_resource_ctx_chars: default_max_resource_ctx_chars(),
            precheck_tokens: default_precheck_tokens(),
        }
    }
}

/// [pipeline] 段：精化循环上限与策略开关
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_max_refinement_cycles")]
    pub max_refinement_cycles: u32,
    /// 即使执行端自报完成也强制独立验证
    #[serde(default)]
    pub force_verification: bool,
    /// 宽容模式：审计不安全时仍继续执行（仅用于测试环境）
    #[serde(default)]
    pub permissive_audit: bool,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// 每个验证循环最多生成的定向验证任务数
    #[serde(default = "default_max_verification_tasks")]
    pub max_verification_tasks: usize,
}

fn default_max_refinement_cycles() -> u32 {
    20
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_max_verification_tasks() -> usize {
    5
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_refinement_cycles: default_max_refinement_cycles(),
            force_verification: false,
            permissive_audit: false,
            heartbeat_secs: default_heartbeat_secs(),
            max_verification_tasks: default_max_verification_tasks(),
        }
    }
}

/// [context] 段：上下文摘要器预算与快照文件
#[derive(Debug, Clone, Deserialize)]
pub struct ContextSection {
    #[serde(default = "default_context_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_summary_ratio")]
    pub summary_ratio: f64,
    #[serde(default = "default_context_state_file")]
    pub state_file: PathBuf,
}

fn default_context_max_tokens() -> usize {
    45000
}

fn default_summary_ratio() -> f64 {
    0.3
}

fn default_context_state_file() -> PathBuf {
    PathBuf::from("state/context_state.json")
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_tokens: default_context_max_tokens(),
            summary_ratio: default_summary_ratio(),
            state_file: default_context_state_file(),
        }
    }
}

/// [session] 段：会话状态 TTL
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_session_ttl_secs() -> u64 {
    3600
}

impl Default for SessionSection {
    fn default() -> Self {
        Self { ttl_secs: default_session_ttl_secs() }
    }
}

/// [executor] 段：外部执行端（工具代理）的地址与传输策略
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_executor_base_url")]
    pub base_url: String,
    /// 鉴权密钥所在环境变量名；空表示无鉴权
    #[serde(default)]
    pub secret_key_env: String,
    /// 强制 SSE，不再探测 WebSocket
    #[serde(default)]
    pub force_sse: bool,
    /// 已知 WS 工具调用时序有问题的上游 provider：命中则强制 SSE
    #[serde(default = "default_sse_only_providers")]
    pub sse_only_providers: Vec<String>,
    /// 手工指定执行端上游 provider（跳过探测）
    #[serde(default)]
    pub provider_override: String,
    #[serde(default = "default_executor_working_dir")]
    pub working_dir: String,
}

fn default_executor_base_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_sse_only_providers() -> Vec<String> {
    vec!["github_copilot".to_string()]
}

fn default_executor_working_dir() -> String {
    ".".to_string()
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            base_url: default_executor_base_url(),
            secret_key_env: String::new(),
            force_sse: false,
            sse_only_providers: default_sse_only_providers(),
            provider_override: String::new(),
            working_dir: default_executor_working_dir(),
        }
    }
}

/// [providers] 段：补全端点注册表（健康检查参数 + 三级级联端点）
#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersSection {
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,
    /// 连续失败多少次后进入冷却
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
    #[serde(default)]
    pub primary: ProviderEndpoint,
    #[serde(default = "default_fallback_endpoint")]
    pub fallback: ProviderEndpoint,
    #[serde(default)]
    pub gateway: GatewayEndpoint,
    /// 按角色/意图优先的模型列表：role -> intent -> models
    #[serde(default)]
    pub intent_prefs: HashMap<String, HashMap<String, Vec<String>>>,
}

fn default_health_timeout_ms() -> u64 {
    1500
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    30_000
}

fn default_health_interval_ms() -> u64 {
    20_000
}

impl Default for ProvidersSection {
    fn default() -> Self {
        Self {
            health_timeout_ms: default_health_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            health_interval_ms: default_health_interval_ms(),
            primary: ProviderEndpoint::default(),
            fallback: default_fallback_endpoint(),
            gateway: GatewayEndpoint::default(),
            intent_prefs: HashMap::new(),
        }
    }
}

/// 单个 OpenAI 兼容补全端点
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEndpoint {
    #[serde(default = "default_primary_base_url")]
    pub base_url: String,
    /// API Key 所在环境变量名；空表示匿名端点
    #[serde(default)]
    pub api_key_env: String,
    #[serde(default = "default_primary_models")]
    pub models: Vec<String>,
}

fn default_primary_base_url() -> String {
    "https://api.mistral.ai/v1".to_string()
}

fn default_primary_models() -> Vec<String> {
    vec![
        "mistral-small-latest".to_string(),
        "mistral-large-latest".to_string(),
    ]
}

impl Default for ProviderEndpoint {
    fn default() -> Self {
        Self {
            base_url: default_primary_base_url(),
            api_key_env: "PRIMARY_API_KEY".to_string(),
            models: default_primary_models(),
        }
    }
}

fn default_fallback_endpoint() -> ProviderEndpoint {
    ProviderEndpoint {
        base_url: "http://127.0.0.1:3010/v1".to_string(),
        api_key_env: String::new(),
        models: vec![
            "openai/gpt-4o-mini".to_string(),
            "microsoft/phi-3.5-mini-instruct".to_string(),
        ],
    }
}

/// 可选的第三方多模型网关（最后一级兜底）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GatewayEndpoint {
    pub enabled: bool,
    pub base_url: String,
    pub api_key_env: String,
    pub models: Vec<String>,
}

/// 一条资源服务器记录（对外通过 /api/resources/list 暴露）
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ResourceServer {
    pub name: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub description: String,
}

/// 从 config 目录加载配置，环境变量 QUEEN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 QUEEN__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("QUEEN")
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
    fn test_default_config_is_complete() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 5101);
        assert_eq!(cfg.pipeline.max_refinement_cycles, 20);
        assert!(!cfg.pipeline.force_verification);
        assert_eq!(cfg.backoff.base_ms, 400);
        assert_eq!(cfg.context.max_tokens, 45000);
        assert!((cfg.context.summary_ratio - 0.3).abs() < f64::EPSILON);
        assert_eq!(cfg.providers.failure_threshold, 3);
        assert!(cfg.executor.sse_only_providers.contains(&"github_copilot".to_string()));
    }

    #[test]
    fn test_fallback_endpoint_defaults() {
        let cfg = AppConfig::default();
        assert!(cfg.providers.fallback.base_url.ends_with("/v1"));
        assert!(cfg.providers.fallback.api_key_env.is_empty());
        assert!(!cfg.providers.fallback.models.is_empty());
    }
}
