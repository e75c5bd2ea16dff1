//! 会话资源追踪
//!
//! 每个会话记录：循环计数、已用工具集合、已用资源集合、最近活动时间与
//! 当前流水线阶段。`analyze` 用一组固定的大小写不敏感正则规则从执行端
//! 自由文本里抽取工具/资源信号——规则显式排序并带权重，逐条可单测。
//! 这是尽力而为的启发式：不符合已知模式的工具不会被记录。
//!
//! 状态由流水线运行独占写入（单写者），放在一把 std Mutex 内更新，
//! 锁内没有挂起点。过期会话在每次写入时顺带按 TTL 清扫。

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

/// 规则类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageCategory {
    Tool,
    Resource,
}

/// 一条抽取规则：模式 + 权重 + 类别
struct UsageRule {
    pattern: Regex,
    weight: u32,
    category: UsageCategory,
}

/// 一次抽取的结果
#[derive(Debug, Clone, Default)]
pub struct ExtractedUsage {
    pub tools: Vec<String>,
    pub resources: Vec<String>,
    /// 命中规则权重占总权重的比例，仅作相对信号
    pub score: f32,
}

/// 会话状态记录
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub cycle: u32,
    pub used_tools: Vec<String>,
    pub used_resources: Vec<String>,
    pub last_activity: DateTime<Utc>,
    pub stage: Option<String>,
}

impl SessionRecord {
    fn new() -> Self {
        Self {
            cycle: 0,
            used_tools: Vec::new(),
            used_resources: Vec::new(),
            last_activity: Utc::now(),
            stage: None,
        }
    }
}

/// 文本信号分析器：固定规则组
pub struct UsageAnalyzer {
    rules: Vec<UsageRule>,
}

impl UsageAnalyzer {
    pub fn new() -> Self {
        let mut rules = Vec::new();
        let mut add = |pattern: &str, weight: u32, category: UsageCategory| {
            rules.push(UsageRule {
                pattern: Regex::new(pattern).expect("invalid usage rule pattern"),
                weight,
                category,
            });
        };

        // 工具调用标记（权重高的是显式标记，低的是措辞启发式）
        add(r"(?i)use_tool:\s*(\w+)", 3, UsageCategory::Tool);
        add(r"(?i)tool_call:\s*(\w+)", 3, UsageCategory::Tool);
        add(r"`(\w{3,})`\s+tool", 2, UsageCategory::Tool);
        add(r"(?i)executing\s+(\w+)\s+tool", 2, UsageCategory::Tool);
        add(r"(?i)running\s+(\w+)\s+command", 1, UsageCategory::Tool);
        add(
            r"(?i)\b((?:browser|file|terminal|shell)_\w+)",
            2,
            UsageCategory::Tool,
        );

        // 资源/provider/模型/端点标记
        add(r"(?i)using\s+resource:\s*([\w.-]+)", 3, UsageCategory::Resource);
        add(r"(?i)connected\s+to\s+([\w.-]+)", 2, UsageCategory::Resource);
        add(r"(?i)provider:\s*([\w.-]+)", 2, UsageCategory::Resource);
        add(r"(?i)\bmodel:\s*([\w./-]+)", 1, UsageCategory::Resource);
        add(r"(?i)endpoint:\s*([\w.:/-]+)", 1, UsageCategory::Resource);
        add(r"(?i)\bserver:\s*([\w.-]+)", 1, UsageCategory::Resource);

        Self { rules }
    }

    /// 扫描文本，返回去重后的工具/资源名与相对得分
    pub fn extract(&self, text: &str) -> ExtractedUsage {
        let mut out = ExtractedUsage::default();
        if text.trim().is_empty() {
            return out;
        }

        let total_weight: u32 = self.rules.iter().map(|r| r.weight).sum();
        let mut matched_weight = 0u32;

        for rule in &self.rules {
            let mut hit = false;
            for caps in rule.pattern.captures_iter(text) {
                let name = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
                if name.len() <= 2 {
                    continue;
                }
                hit = true;
                let bucket = match rule.category {
                    UsageCategory::Tool => &mut out.tools,
                    UsageCategory::Resource => &mut out.resources,
                };
                if !bucket.contains(&name) {
                    bucket.push(name);
                }
            }
            if hit {
                matched_weight += rule.weight;
            }
        }

        if total_weight > 0 {
            out.score = matched_weight as f32 / total_weight as f32;
        }
        out
    }
}

impl Default for UsageAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// 会话存储：显式注入，不做全局单例
pub struct SessionStore {
    inner: Mutex<HashMap<String, SessionRecord>>,
    analyzer: UsageAnalyzer,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            analyzer: UsageAnalyzer::new(),
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    /// 设置会话当前循环数（不存在则创建），顺带清扫过期会话
    pub fn update_cycle(&self, session_id: &str, cycle: u32) {
        let mut map = self.inner.lock().unwrap();
        let now = Utc::now();
        map.retain(|_, rec| now - rec.last_activity < self.ttl);
        let rec = map.entry(session_id.to_string()).or_insert_with(SessionRecord::new);
        rec.cycle = cycle;
        rec.last_activity = now;
    }

    pub fn set_stage(&self, session_id: &str, stage: &str) {
        let mut map = self.inner.lock().unwrap();
        let rec = map.entry(session_id.to_string()).or_insert_with(SessionRecord::new);
        rec.stage = Some(stage.to_string());
        rec.last_activity = Utc::now();
    }

    /// 扫描执行端输出并把发现的信号并入会话记录
    pub fn analyze(&self, output: &str, session_id: &str) -> ExtractedUsage {
        let extracted = self.analyzer.extract(output);
        if !extracted.tools.is_empty() || !extracted.resources.is_empty() {
            let mut map = self.inner.lock().unwrap();
            let rec = map.entry(session_id.to_string()).or_insert_with(SessionRecord::new);
            for t in &extracted.tools {
                if !rec.used_tools.contains(t) {
                    rec.used_tools.push(t.clone());
                }
            }
            for r in &extracted.resources {
                if !rec.used_resources.contains(r) {
                    rec.used_resources.push(r.clone());
                }
            }
            rec.last_activity = Utc::now();
        }
        extracted
    }

    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.inner.lock().unwrap().get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
