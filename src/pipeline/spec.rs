//! 流水线数据契约
//!
//! LLM 输出一律在解码边界验证一次，下游拿到的是带显式可选字段的结构体，
//! 不再到处检查 duck-typed JSON。TaskSpec 每循环不可变：精化产生新的
//! 链式版本，绝不原地修改。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::cap_head;

/// 结构化任务描述（规划角色产出）
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TaskSpec {
    pub title: Option<String>,
    pub summary: Option<String>,
    pub inputs: Vec<String>,
    pub steps: Vec<String>,
    pub constraints: Vec<String>,
    pub success_criteria: Vec<String>,
    pub tool_hints: Option<Value>,
    /// 规划角色标注的意图：chat / task
    pub intent: Option<String>,
    pub do_not_execute: Option<bool>,
}

impl TaskSpec {
    /// 解码边界：尽力从 LLM 输出恢复出一个可用的 TaskSpec
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    /// 兜底 spec：没有任何可解析的 JSON 时用原始消息当 summary
    pub fn minimal(message: &str) -> Self {
        Self {
            title: Some("Task".to_string()),
            summary: Some(message.to_string()),
            inputs: vec![message.to_string()],
            ..Default::default()
        }
    }
}

/// 规划角色一次完整输出：给用户的回复 + 任务规格
#[derive(Debug, Clone)]
pub struct PlannerOutput {
    pub user_reply: String,
    pub task_spec: TaskSpec,
    pub attempts_used: u32,
}

/// 审计报告（执行前安全检查）
#[derive(Debug, Clone)]
pub struct AuditReport {
    pub is_safe: bool,
    pub rationale: String,
    pub flagged: Vec<String>,
    pub note: Option<String>,
    pub attempts_used: u32,
    /// 审计链路整体不可用时的降级标记
    pub degraded: bool,
}

impl AuditReport {
    pub fn from_value(value: &Value, attempts_used: u32) -> Self {
        Self {
            is_safe: value["isSafe"].as_bool().unwrap_or(true),
            rationale: value["rationale"].as_str().unwrap_or_default().to_string(),
            flagged: string_array(&value["flagged"]),
            note: value["inter_agent_note"].as_str().map(String::from),
            attempts_used,
            degraded: false,
        }
    }

    /// 审计 provider 全体不可用时的安全默认（带警示），仅用于继续会话级流程
    pub fn degraded_default() -> Self {
        Self {
            is_safe: true,
            rationale: "Safety systems temporarily unavailable; request processed with baseline rules only.".to_string(),
            flagged: vec!["system_unavailable".to_string()],
            note: Some("Warning: audit providers unreachable, baseline check applied.".to_string()),
            attempts_used: 0,
            degraded: true,
        }
    }
}

/// 执行端自报的完成状态
#[derive(Debug, Clone)]
pub struct CompletionStatus {
    pub is_complete: bool,
    pub can_continue: bool,
    pub reason: String,
}

impl CompletionStatus {
    pub fn from_value(value: &Value) -> Self {
        Self {
            is_complete: value["isComplete"].as_bool().unwrap_or(false),
            // 显式 false 才算不能继续
            can_continue: value["canContinue"].as_bool().unwrap_or(true),
            reason: value["reason"]
                .as_str()
                .unwrap_or("assessment finished")
                .to_string(),
        }
    }

    pub fn unknown(reason: &str) -> Self {
        Self {
            is_complete: false,
            can_continue: true,
            reason: reason.to_string(),
        }
    }
}

/// 一条定向验证任务（审计角色产出，用后即弃）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationTask {
    pub description: String,
    pub prompt: String,
}

/// 一条验证任务的执行结果
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub task: String,
    pub result: String,
    pub session: String,
}

/// 审计角色的循环终判
#[derive(Debug, Clone)]
pub struct Verdict {
    pub is_complete: bool,
    pub issues: Vec<String>,
    pub reasoning: String,
    pub detailed_feedback: String,
    pub refinement_hint: String,
}

impl Verdict {
    pub fn from_value(value: &Value) -> Self {
        Self {
            is_complete: value["isComplete"].as_bool().unwrap_or(false),
            issues: string_array(&value["issues"]),
            reasoning: value["reasoning"]
                .as_str()
                .unwrap_or("analysis finished")
                .to_string(),
            detailed_feedback: value["detailed_feedback"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            refinement_hint: value["refinement_hint"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
        }
    }

    pub fn failed(reason: String) -> Self {
        Self {
            is_complete: false,
            issues: vec![reason],
            reasoning: "technical failure during verdict analysis".to_string(),
            detailed_feedback: String::new(),
            refinement_hint: String::new(),
        }
    }
}

fn string_array(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        // 有些模型把 issues 写成一个分号串
        Value::String(s) if !s.is_empty() => {
            s.split(';').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect()
        }
        _ => Vec::new(),
    }
}

const SUMMARIZE_MAX_ARRAY: usize = 10;
const SUMMARIZE_MAX_STR: usize = 500;

/// 压缩 TaskSpec 以便嵌入提示词：数组截前 10 项、字符串截 500 字符；
/// 整体仍超 max_chars 时退到只保留要点。对已在界内的 spec 是幂等的。
pub fn summarize_task_spec(spec: &TaskSpec, max_chars: usize) -> TaskSpec {
    let cap_vec = |v: &[String]| -> Vec<String> {
        v.iter()
            .take(SUMMARIZE_MAX_ARRAY)
            .map(|s| cap_head(s, SUMMARIZE_MAX_STR))
            .collect()
    };

    let mut out = TaskSpec {
        title: spec.title.as_deref().map(|s| cap_head(s, SUMMARIZE_MAX_STR)),
        summary: spec.summary.as_deref().map(|s| cap_head(s, SUMMARIZE_MAX_STR)),
        inputs: cap_vec(&spec.inputs),
        steps: cap_vec(&spec.steps),
        constraints: cap_vec(&spec.constraints),
        success_criteria: cap_vec(&spec.success_criteria),
        tool_hints: spec
            .tool_hints
            .as_ref()
            .map(|v| Value::String(cap_head(&v.to_string(), SUMMARIZE_MAX_STR))),
        intent: spec.intent.clone(),
        do_not_execute: spec.do_not_execute,
    };

    let serialized = serde_json::to_string(&out).unwrap_or_default();
    if serialized.chars().count() > max_chars {
        // 只留要点
        out = TaskSpec {
            title: Some(cap_head(out.title.as_deref().unwrap_or("Task"), 200)),
            summary: Some(cap_head(out.summary.as_deref().unwrap_or(""), 2000)),
            steps: out.steps.into_iter().take(5).collect(),
            success_criteria: out.success_criteria.into_iter().take(5).collect(),
            ..Default::default()
        };
    }
    out
}

/// 清理规划角色给用户的回复：去代码围栏、去 user_reply: 前缀、去包裹引号
pub fn clean_user_reply(text: &str) -> String {
    let mut out = text.to_string();
    // 去掉所有围栏块
    while let Some(start) = out.find("```") {
        match out[start + 3..].find("```") {
            Some(end) => out.replace_range(start..start + 3 + end + 3, ""),
            None => {
                out.truncate(start);
                break;
            }
        }
    }
    let mut out = out.trim().to_string();
    for prefix in ["user_reply:", "user reply:", "user-reply:"] {
        if let Some(head) = out.get(..prefix.len()) {
            if head.eq_ignore_ascii_case(prefix) {
                out = out[prefix.len()..].trim().to_string();
                break;
            }
        }
    }
    if out.len() >= 2 && out.starts_with('"') && out.ends_with('"') {
        out = out[1..out.len() - 1].to_string();
    }
    out.trim().to_string()
}

/// 规划角色完全失联时的礼貌兜底回复
pub fn polite_fallback_reply(message: &str) -> String {
    let msg = message.trim();
    if msg.is_empty() {
        return "Request received; preparing a response.".to_string();
    }
    let echo: String = msg.chars().take(320).collect();
    if echo.len() < msg.len() {
        format!("In short: {}…", echo)
    } else {
        format!("In short: {}", echo)
    }
}

/// 从规划角色混合输出里切出（用户回复, 末尾 JSON 块）
pub fn split_reply_and_spec(text: &str) -> (String, Option<TaskSpec>) {
    let start = text.find('{');
    let end = text.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                // 有些模型包一层 {"task_spec": {...}}
                let spec_value = if value.get("task_spec").map(|v| v.is_object()).unwrap_or(false) {
                    value["task_spec"].clone()
                } else {
                    value
                };
                let reply = clean_user_reply(&format!("{}{}", &text[..start], &text[end + 1..]));
                return (reply, Some(TaskSpec::from_value(spec_value)));
            }
        }
    }
    (clean_user_reply(text), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taskspec_decode_tolerates_missing_fields() {
        let spec = TaskSpec::from_value(serde_json::json!({
            "title": "t",
            "steps": ["a", "b"]
        }));
        assert_eq!(spec.title.as_deref(), Some("t"));
        assert_eq!(spec.steps.len(), 2);
        assert!(spec.success_criteria.is_empty());
    }

    #[test]
    fn test_summarize_caps_arrays_and_strings() {
        let spec = TaskSpec {
            title: Some("x".repeat(1000)),
            steps: (0..30).map(|i| format!("step {}", i)).collect(),
            ..Default::default()
        };
        let out = summarize_task_spec(&spec, 12000);
        assert_eq!(out.title.as_ref().unwrap().chars().count(), 500);
        assert_eq!(out.steps.len(), 10);
    }

    #[test]
    fn test_summarize_is_idempotent_on_size() {
        let spec = TaskSpec {
            title: Some("x".repeat(1000)),
            summary: Some("y".repeat(3000)),
            steps: (0..30).map(|i| format!("step {} {}", i, "z".repeat(100))).collect(),
            success_criteria: (0..20).map(|i| format!("crit {}", i)).collect(),
            ..Default::default()
        };
        let once = summarize_task_spec(&spec, 12000);
        let twice = summarize_task_spec(&once, 12000);
        let a = serde_json::to_string(&once).unwrap();
        let b = serde_json::to_string(&twice).unwrap();
        assert_eq!(a.len(), b.len(), "second application must not shrink further");
    }

    #[test]
    fn test_summarize_essentials_fallback_under_cap() {
        let spec = TaskSpec {
            title: Some("t".to_string()),
            summary: Some("s".repeat(400)),
            steps: (0..10).map(|_| "q".repeat(500)).collect(),
            constraints: (0..10).map(|_| "c".repeat(500)).collect(),
            inputs: (0..10).map(|_| "i".repeat(500)).collect(),
            ..Default::default()
        };
        let out = summarize_task_spec(&spec, 3000);
        let json = serde_json::to_string(&out).unwrap();
        assert!(json.len() < 13000);
        assert!(out.constraints.is_empty(), "essentials drop constraints");
        assert!(out.steps.len() <= 5);
    }

    #[test]
    fn test_clean_user_reply() {
        assert_eq!(clean_user_reply("user_reply: hi there"), "hi there");
        assert_eq!(clean_user_reply("\"quoted\""), "quoted");
        assert_eq!(clean_user_reply("keep\n```json\n{\"a\":1}\n```\nthis"), "keep\n\nthis");
    }

    #[test]
    fn test_split_reply_and_spec() {
        let text = "Sure, I'll handle it.\n{\"title\":\"Deploy\",\"steps\":[\"build\"],\"intent\":\"task\"}";
        let (reply, spec) = split_reply_and_spec(text);
        assert_eq!(reply, "Sure, I'll handle it.");
        let spec = spec.unwrap();
        assert_eq!(spec.title.as_deref(), Some("Deploy"));
        assert_eq!(spec.intent.as_deref(), Some("task"));
    }

    #[test]
    fn test_split_handles_wrapped_task_spec() {
        let text = "ok {\"task_spec\":{\"title\":\"T\"}}";
        let (_, spec) = split_reply_and_spec(text);
        assert_eq!(spec.unwrap().title.as_deref(), Some("T"));
    }

    #[test]
    fn test_split_without_json_returns_reply_only() {
        let (reply, spec) = split_reply_and_spec("just a chat answer");
        assert_eq!(reply, "just a chat answer");
        assert!(spec.is_none());
    }

    #[test]
    fn test_verdict_tolerates_issue_string() {
        let v = Verdict::from_value(&serde_json::json!({
            "isComplete": false,
            "issues": "missing file; wrong port"
        }));
        assert_eq!(v.issues, vec!["missing file", "wrong port"]);
    }

    #[test]
    fn test_polite_fallback_reply_truncates() {
        let long = "a".repeat(500);
        let reply = polite_fallback_reply(&long);
        assert!(reply.chars().count() < 340);
        assert!(reply.ends_with('…'));
    }
}
