//! Provider/模型注册表
//!
//! 为每个补全端点维护一条健康记录：连续失败达到阈值进入冷却窗口，期间
//! 被路由排除；下一次成功即清零并解除冷却。后台定时器周期性探活（启动时
//! 先急查一次）。`get_routes` 按角色静态计划产出有序 {provider, model}
//! 候选，多模型步骤支持意图优先列表与 round-robin 游标分摊负载。
//! 注册表自身从不重试，调用方通过 report_success / report_failure 回报。
//!
//! 记录的读-改-写全部在一把 std Mutex 内完成，锁内不 await，保证失败
//! 计数与冷却迁移不被并发回报交错。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::AppConfig;
use crate::llm::client::CallTarget;

/// 端点类别，决定探活方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI 兼容补全端点：GET /models，失败则试最小补全
    Chat,
    /// 执行端（工具代理）：GET /health
    Executor,
}

/// 单个 provider 的健康记录
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub healthy: Option<bool>,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub failures_total: u64,
    pub cooldown_until: Option<Instant>,
}

impl ProviderRecord {
    fn new(name: &str, kind: ProviderKind, base_url: &str, api_key: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            healthy: None,
            last_latency_ms: None,
            consecutive_failures: 0,
            failures_total: 0,
            cooldown_until: None,
        }
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.map(|t| now < t).unwrap_or(false)
    }
}

/// 健康快照（/health/llm 输出，不含密钥）
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    pub configured: bool,
    pub healthy: Option<bool>,
    pub last_latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub failures_total: u64,
    pub cooling_down: bool,
}

/// 一个路由候选：provider 名 + 调用目的地
#[derive(Debug, Clone)]
pub struct Route {
    pub provider: String,
    pub target: CallTarget,
}

/// 角色计划里的一步：provider + 候选模型列表
#[derive(Debug, Clone)]
struct PlanStep {
    provider: String,
    models: Vec<String>,
}

struct Inner {
    records: HashMap<String, ProviderRecord>,
    /// (role, provider) -> round-robin 起始游标
    rr: HashMap<(String, String), usize>,
}

pub struct ProviderRegistry {
    inner: Mutex<Inner>,
    http: reqwest::Client,
    health_timeout: Duration,
    failure_threshold: u32,
    cooldown: Duration,
    health_interval: Duration,
    plans: HashMap<String, Vec<PlanStep>>,
    intent_prefs: HashMap<String, HashMap<String, Vec<String>>>,
}

fn api_key_from_env(env_name: &str) -> Option<String> {
    if env_name.is_empty() {
        return None;
    }
    std::env::var(env_name).ok().filter(|v| !v.is_empty())
}

impl ProviderRegistry {
    pub fn from_config(cfg: &AppConfig, http: reqwest::Client) -> Self {
        let p = &cfg.providers;
        let mut records = HashMap::new();
        records.insert(
            "primary".to_string(),
            ProviderRecord::new(
                "primary",
                ProviderKind::Chat,
                &p.primary.base_url,
                api_key_from_env(&p.primary.api_key_env),
            ),
        );
        records.insert(
            "fallback".to_string(),
            ProviderRecord::new(
                "fallback",
                ProviderKind::Chat,
                &p.fallback.base_url,
                api_key_from_env(&p.fallback.api_key_env),
            ),
        );
        if p.gateway.enabled {
            records.insert(
                "gateway".to_string(),
                ProviderRecord::new(
                    "gateway",
                    ProviderKind::Chat,
                    &p.gateway.base_url,
                    api_key_from_env(&p.gateway.api_key_env),
                ),
            );
        }
        records.insert(
            "executor".to_string(),
            ProviderRecord::new(
                "executor",
                ProviderKind::Executor,
                &cfg.executor.base_url,
                None,
            ),
        );

        // 角色计划：primary -> fallback -> gateway（各自带模型列表）
        let mut plans = HashMap::new();
        for (role, role_cfg) in [("planner", &cfg.roles.planner), ("auditor", &cfg.roles.auditor)] {
            let primary_models = if role_cfg.models.is_empty() {
                p.primary.models.clone()
            } else {
                role_cfg.models.clone()
            };
            let mut steps = vec![
                PlanStep {
                    provider: "primary".to_string(),
                    models: primary_models,
                },
                PlanStep {
                    provider: "fallback".to_string(),
                    models: p.fallback.models.clone(),
                },
            ];
            if p.gateway.enabled && !p.gateway.models.is_empty() {
                steps.push(PlanStep {
                    provider: "gateway".to_string(),
                    models: p.gateway.models.clone(),
                });
            }
            plans.insert(role.to_string(), steps);
        }

        Self {
            inner: Mutex::new(Inner {
                records,
                rr: HashMap::new(),
            }),
            http,
            health_timeout: Duration::from_millis(p.health_timeout_ms),
            failure_threshold: p.failure_threshold,
            cooldown: Duration::from_millis(p.cooldown_ms),
            health_interval: Duration::from_millis(p.health_interval_ms),
            plans,
            intent_prefs: p.intent_prefs.clone(),
        }
    }

    /// 产出角色的有序路由候选；冷却中的 provider 被整体跳过。
    ///
    /// 多模型步骤：若该 (role, intent) 配置了优先模型列表，则优先列表在前、
    /// 其余模型保持配置顺序；否则从 round-robin 游标起点轮转并将游标 +1。
    pub fn get_routes(&self, role: &str, intent_hint: Option<&str>) -> Vec<Route> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let plan = match self.plans.get(role) {
            Some(p) => p.clone(),
            None => return Vec::new(),
        };

        let mut routes = Vec::new();
        for step in &plan {
            let record = match inner.records.get(&step.provider) {
                Some(r) => r.clone(),
                None => continue,
            };
            if record.in_cooldown(now) {
                continue;
            }
            if step.models.is_empty() {
                continue;
            }

            let prefs = match intent_hint {
                Some(hint) => self
                    .intent_prefs
                    .get(role)
                    .and_then(|by_intent| by_intent.get(hint))
                    .filter(|list| !list.is_empty()),
                None => None,
            };

            let ordered: Vec<String> = if let Some(prefs) = prefs {
                let mut out: Vec<String> = prefs
                    .iter()
                    .filter(|m| step.models.contains(m))
                    .cloned()
                    .collect();
                for m in &step.models {
                    if !prefs.contains(m) {
                        out.push(m.clone());
                    }
                }
                out
            } else {
                let key = (role.to_string(), step.provider.clone());
                let rr = *inner.rr.get(&key).unwrap_or(&0) % step.models.len();
                let mut out = Vec::with_capacity(step.models.len());
                for i in 0..step.models.len() {
                    out.push(step.models[(rr + i) % step.models.len()].clone());
                }
                inner.rr.insert(key, (rr + 1) % step.models.len());
                out
            };

            for model in ordered {
                routes.push(Route {
                    provider: step.provider.clone(),
                    target: CallTarget {
                        base_url: record.base_url.clone(),
                        model,
                        api_key: record.api_key.clone(),
                    },
                });
            }
        }
        routes
    }

    /// 调用成功回报：清零失败计数、解除冷却
    pub fn report_success(&self, provider: &str, latency_ms: Option<u64>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(r) = inner.records.get_mut(provider) {
            mark_healthy(r, latency_ms);
        }
    }

    /// 调用失败回报：累加计数，达到阈值进入冷却
    pub fn report_failure(&self, provider: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(r) = inner.records.get_mut(provider) {
            mark_failure(r, self.failure_threshold, self.cooldown);
        }
    }

    /// 对单个 provider 执行轻量探活
    pub async fn check_provider(&self, name: &str) -> bool {
        let (kind, base, api_key) = {
            let inner = self.inner.lock().unwrap();
            match inner.records.get(name) {
                Some(r) => (r.kind, r.base_url.clone(), r.api_key.clone()),
                None => return false,
            }
        };

        let start = Instant::now();
        let ok = match kind {
            ProviderKind::Executor => self.probe_executor(&base).await,
            ProviderKind::Chat => self.probe_chat(&base, api_key.as_deref()).await,
        };
        let latency = start.elapsed().as_millis() as u64;

        let mut inner = self.inner.lock().unwrap();
        if let Some(r) = inner.records.get_mut(name) {
            if ok {
                mark_healthy(r, Some(latency));
            } else {
                mark_failure(r, self.failure_threshold, self.cooldown);
            }
        }
        ok
    }

    pub async fn check_all(&self) {
        let names: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner.records.keys().cloned().collect()
        };
        for name in names {
            self.check_provider(&name).await;
        }
    }

    async fn probe_executor(&self, base: &str) -> bool {
        let url = format!("{}/health", base);
        match self.http.get(&url).timeout(self.health_timeout).send().await {
            Ok(resp) => resp.status().as_u16() < 500,
            Err(_) => false,
        }
    }

    async fn probe_chat(&self, base: &str, api_key: Option<&str>) -> bool {
        let url = format!("{}/models", base);
        let mut req = self.http.get(&url).timeout(self.health_timeout);
        if let Some(key) = api_key {
            req = req.bearer_auth(key);
        }
        if let Ok(resp) = req.send().await {
            if resp.status().as_u16() < 500 {
                return true;
            }
        }
        // /models 不可用时退回最小补全探针
        let cc_url = format!("{}/chat/completions", base);
        let payload = serde_json::json!({
            "model": "health-probe",
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1
        });
        let mut req = self
            .http
            .post(&cc_url)
            .json(&payload)
            .timeout(self.health_timeout);
        if let Some(key) = api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(resp) => resp.status().as_u16() < 500,
            Err(_) => false,
        }
    }

    /// 后台健康巡检：启动时急查一次，然后按配置间隔循环；与请求路径互不阻塞
    pub fn spawn_health_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.check_all().await;
            let mut ticker = tokio::time::interval(registry.health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                registry.check_all().await;
            }
        })
    }

    /// 对外健康快照（无密钥）
    pub fn snapshot(&self) -> Vec<ProviderHealth> {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<ProviderHealth> = inner
            .records
            .values()
            .map(|r| ProviderHealth {
                name: r.name.clone(),
                kind: r.kind,
                endpoint: r.base_url.clone(),
                configured: r.kind == ProviderKind::Executor || r.api_key.is_some(),
                healthy: r.healthy,
                last_latency_ms: r.last_latency_ms,
                consecutive_failures: r.consecutive_failures,
                failures_total: r.failures_total,
                cooling_down: r.in_cooldown(now),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    #[cfg(test)]
    pub(crate) fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

fn mark_healthy(r: &mut ProviderRecord, latency_ms: Option<u64>) {
    r.healthy = Some(true);
    if latency_ms.is_some() {
        r.last_latency_ms = latency_ms;
    }
    r.consecutive_failures = 0;
    r.cooldown_until = None;
}

fn mark_failure(r: &mut ProviderRecord, threshold: u32, cooldown: Duration) {
    r.healthy = Some(false);
    r.consecutive_failures += 1;
    r.failures_total += 1;
    if r.consecutive_failures >= threshold {
        r.cooldown_until = Some(Instant::now() + cooldown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn test_registry() -> ProviderRegistry {
        let mut cfg = AppConfig::default();
        cfg.providers.primary.models =
            vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
        cfg.providers.primary.api_key_env = String::new();
        ProviderRegistry::from_config(&cfg, reqwest::Client::new())
    }

    #[test]
    fn test_routes_walk_plan_in_order() {
        let reg = test_registry();
        let routes = reg.get_routes("planner", None);
        // primary 的 3 个模型 + fallback 的 2 个
        assert_eq!(routes.len(), 5);
        assert_eq!(routes[0].provider, "primary");
        assert_eq!(routes[3].provider, "fallback");
    }

    #[test]
    fn test_round_robin_cursor_advances() {
        let reg = test_registry();
        let first = reg.get_routes("planner", None);
        let second = reg.get_routes("planner", None);
        assert_eq!(first[0].target.model, "m1");
        assert_eq!(second[0].target.model, "m2");
        // 游标按 (role, provider) 独立，auditor 不受影响
        let auditor = reg.get_routes("auditor", None);
        assert_eq!(auditor[0].target.model, "m1");
    }

    #[test]
    fn test_intent_prefs_take_priority_without_rotation() {
        let mut cfg = AppConfig::default();
        cfg.providers.primary.models =
            vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
        cfg.providers.primary.api_key_env = String::new();
        cfg.providers
            .intent_prefs
            .entry("planner".to_string())
            .or_default()
            .insert("chat".to_string(), vec!["m3".to_string()]);
        let reg = ProviderRegistry::from_config(&cfg, reqwest::Client::new());

        let routes = reg.get_routes("planner", Some("chat"));
        assert_eq!(routes[0].target.model, "m3");
        assert_eq!(routes[1].target.model, "m1");
        // 有意图优先时不推进游标
        let routes2 = reg.get_routes("planner", Some("chat"));
        assert_eq!(routes2[0].target.model, "m3");
    }

    #[test]
    fn test_cooldown_excludes_provider_until_expiry() {
        let reg = test_registry().with_cooldown(Duration::from_millis(30));
        for _ in 0..3 {
            reg.report_failure("primary");
        }
        let routes = reg.get_routes("planner", None);
        assert!(routes.iter().all(|r| r.provider != "primary"));

        std::thread::sleep(Duration::from_millis(40));
        let routes = reg.get_routes("planner", None);
        assert!(routes.iter().any(|r| r.provider == "primary"));
    }

    #[test]
    fn test_success_resets_counter_and_clears_cooldown() {
        let reg = test_registry();
        for _ in 0..3 {
            reg.report_failure("primary");
        }
        reg.report_success("primary", Some(12));
        let snap = reg.snapshot();
        let primary = snap.iter().find(|p| p.name == "primary").unwrap();
        assert_eq!(primary.consecutive_failures, 0);
        assert!(!primary.cooling_down);
        assert_eq!(primary.failures_total, 3);
        assert_eq!(primary.last_latency_ms, Some(12));
    }

    #[test]
    fn test_below_threshold_no_cooldown() {
        let reg = test_registry();
        reg.report_failure("primary");
        reg.report_failure("primary");
        let routes = reg.get_routes("planner", None);
        assert!(routes.iter().any(|r| r.provider == "primary"));
    }

    #[test]
    fn test_snapshot_has_no_secrets() {
        let reg = test_registry();
        let json = serde_json::to_string(&reg.snapshot()).unwrap();
        assert!(!json.contains("api_key"));
    }
}
