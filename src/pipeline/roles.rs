//! 角色调用：规划 / 审计
//!
//! 具体的提示词内容库在系统边界之外，这里只带最小可用的默认指令。
//! 规划角色输出「给用户的回复 + 末尾一个 TaskSpec JSON」；审计角色
//! 全部走 JSON-only 通道。每个方法在解码边界做一次验证，失败走各自
//! 的降级路径（礼貌兜底回复 / 带警示的安全默认 / 空任务列表）。

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AppConfig, ResourceServer};
use crate::executor::QuestionAnswerer;
use crate::llm::{cap_head, cap_tail, CallLayer, CallOptions, LlmError};
use crate::memory::SummaryClient;
use crate::pipeline::spec::{
    polite_fallback_reply, split_reply_and_spec, summarize_task_spec, AuditReport,
    CompletionStatus, PlannerOutput, TaskSpec, Verdict, VerificationResult, VerificationTask,
};
use crate::session::ModeAdvice;

/// 用户消息意图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Chat,
    Task,
}

const PLANNER_SYSTEM: &str = "You are the planner of a three-role pipeline. Restate and enrich \
the user's request into an actionable task specification, and answer the user concisely.";

const PLANNER_FORMAT: &str = r#"{"title": string, "summary": string, "inputs": string[], "steps": string[], "constraints": string[], "success_criteria": string[], "tool_hints": object, "intent": "chat"|"task", "do_not_execute": boolean}"#;

const INTENT_SYSTEM: &str = "You are an intent classifier. Decide whether the user message is \
conversational chat or a task to execute. Answer with exactly one word: task or chat.";

const AUDITOR_POLICY_SYSTEM: &str = r#"You are the auditor, a strict pre-execution safety checker. Review the task specification for policy violations (destructive actions, credential exfiltration, harm). Return JSON: {"isSafe": boolean, "rationale": string, "flagged": string[], "inter_agent_note": string}."#;

const COMPLETION_SYSTEM: &str = r#"You are a task-completion analyst. Analyze the executor's output and decide: 1) isComplete: did the executor explicitly state the task is DONE; 2) canContinue: can the executor keep working, or did it say it CANNOT; 3) reason: a short explanation. Answer only as JSON: {"isComplete": boolean, "canContinue": boolean, "reason": string}"#;

const VERIFY_TASKS_SYSTEM: &str = r#"You are the auditor, an expert in verification. Create a list of targeted tasks to check the execution through separate executor sessions. Each task must be concrete and aimed at obtaining specific, independently checkable information (e.g. "run this command and report the output", "confirm this file exists with this content", "check the state of this service"). Return JSON: {"tasks": [{"description": string, "prompt": string}]}"#;

const VERDICT_SYSTEM: &str = r#"You are the auditor, the completion judge. Analyze the results of all verification tasks together and render a final verdict. Return JSON: {"isComplete": boolean, "issues": string[], "reasoning": string, "detailed_feedback": string, "refinement_hint": string}"#;

const CLASSIFIER_SYSTEM: &str = "You are a concise classifier. Answer strictly yes or no.";

pub struct Roles {
    call: Arc<CallLayer>,
    cfg: Arc<AppConfig>,
}

impl Roles {
    pub fn new(call: Arc<CallLayer>, cfg: Arc<AppConfig>) -> Self {
        Self { call, cfg }
    }

    pub fn call_layer(&self) -> &Arc<CallLayer> {
        &self.call
    }

    fn planner_opts(&self, session_id: &str) -> CallOptions {
        CallOptions::new(
            self.cfg.roles.planner.max_attempts,
            0.3,
            self.cfg.roles.planner.timeout_secs,
        )
        .with_session(session_id)
    }

    fn auditor_opts(&self, session_id: &str, temperature: f32) -> CallOptions {
        CallOptions::new(
            self.cfg.roles.auditor.max_attempts,
            temperature,
            self.cfg.roles.auditor.timeout_secs,
        )
        .with_session(session_id)
    }

    fn resources_context(&self, resources: &[ResourceServer]) -> String {
        if resources.is_empty() {
            return String::new();
        }
        let json = serde_json::to_string(resources).unwrap_or_default();
        format!(
            "\n\nAvailable resource servers (name/endpoint/description): {}",
            cap_head(&json, self.cfg.limits.max_resource_ctx_chars)
        )
    }

    /// 规划：收到用户消息，产出回复 + TaskSpec
    pub async fn plan(
        &self,
        message: &str,
        resources: &[ResourceServer],
        session_id: &str,
    ) -> Result<PlannerOutput, LlmError> {
        let instruction = format!(
            "Reply to the user first in plain text. Then output exactly one JSON object \
             matching this schema: {}. Do not use code fences. Do not prefix the reply \
             with \"user_reply:\".",
            PLANNER_FORMAT
        );
        let user = format!(
            "{}{}\n\nUser: {}",
            instruction,
            self.resources_context(resources),
            message
        );
        let out = self
            .call
            .call_text("planner", PLANNER_SYSTEM, &user, &self.planner_opts(session_id))
            .await?;

        let (reply, spec) = split_reply_and_spec(&out.text);
        let user_reply = if reply.is_empty() {
            polite_fallback_reply(message)
        } else {
            reply
        };
        Ok(PlannerOutput {
            user_reply,
            task_spec: spec.unwrap_or_else(|| TaskSpec::minimal(message)),
            attempts_used: out.attempts_used,
        })
    }

    /// 意图分类：LLM 一词作答，失败时退关键词启发式
    pub async fn classify_intent(&self, message: &str, session_id: &str) -> Intent {
        let opts = CallOptions::new(2, 0.0, self.cfg.roles.planner.timeout_secs)
            .with_session(session_id)
            .with_intent("chat");
        match self
            .call
            .call_text("planner", INTENT_SYSTEM, &format!("Message: {}", message), &opts)
            .await
        {
            Ok(out) => {
                let lower = out.text.to_lowercase();
                if lower.contains("task") {
                    Intent::Task
                } else if lower.contains("chat") {
                    Intent::Chat
                } else {
                    keyword_intent(message)
                }
            }
            Err(_) => keyword_intent(message),
        }
    }

    /// 审计：执行前安全检查；provider 全体不可用时降级为带警示的安全默认
    pub async fn audit(
        &self,
        spec: &TaskSpec,
        resources: &[ResourceServer],
        session_id: &str,
    ) -> AuditReport {
        let summary = summarize_task_spec(spec, self.cfg.limits.max_taskspec_chars);
        let user = format!(
            "TaskSpecSummary JSON:\n{}{}",
            serde_json::to_string(&summary).unwrap_or_default(),
            self.resources_context(resources)
        );
        match self
            .call
            .call_json_only("auditor", AUDITOR_POLICY_SYSTEM, &user, &self.auditor_opts(session_id, 0.0))
            .await
        {
            Ok(out) => AuditReport::from_value(&out.value, out.attempts_used),
            Err(e) => {
                tracing::warn!("audit providers unavailable ({}), using degraded safe default", e);
                AuditReport::degraded_default()
            }
        }
    }

    /// 执行后自检：执行端是否自报完成 / 阻塞 / 可继续
    pub async fn completion_check(&self, exec_text: &str, session_id: &str) -> CompletionStatus {
        if exec_text.trim().is_empty() {
            return CompletionStatus::unknown(
                "Executor output was not captured, assuming continuation is possible",
            );
        }
        let user = format!(
            "Analyze the executor output for completion:\n\n{}",
            cap_tail(exec_text, 2000)
        );
        let mut opts = self.auditor_opts(session_id, 0.1);
        opts.max_attempts = opts.max_attempts.min(3);
        match self
            .call
            .call_json_only("auditor", COMPLETION_SYSTEM, &user, &opts)
            .await
        {
            Ok(out) => CompletionStatus::from_value(&out.value),
            Err(e) => {
                tracing::warn!("completion check failed: {}", e);
                CompletionStatus::unknown("No AI available to assess completion")
            }
        }
    }

    /// 审计：为本循环生成定向验证任务；provider 链路不可用时返回 Err，
    /// 由控制器以 error 事件收尾（与「确实没有要验证的点」区分开）
    pub async fn verification_tasks(
        &self,
        spec: &TaskSpec,
        exec_text: &str,
        advice: &ModeAdvice,
        cycle: u32,
        session_id: &str,
    ) -> Result<Vec<VerificationTask>, LlmError> {
        let summary = summarize_task_spec(spec, self.cfg.limits.max_taskspec_chars);
        let user = format!(
            "TaskSpec: {}\n\nExecutor output (tail):\n{}\n\nCycle: {}, mode: {:?}\n{}",
            serde_json::to_string(&summary).unwrap_or_default(),
            cap_tail(exec_text, self.cfg.limits.max_exec_report_chars),
            cycle,
            advice.mode,
            advice.render(),
        );
        match self
            .call
            .call_json_only("auditor", VERIFY_TASKS_SYSTEM, &user, &self.auditor_opts(session_id, 0.2))
            .await
        {
            Ok(out) => {
                let tasks: Vec<VerificationTask> = out.value["tasks"]
                    .as_array()
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|v| serde_json::from_value(v.clone()).ok())
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(tasks
                    .into_iter()
                    .filter(|t: &VerificationTask| !t.prompt.trim().is_empty())
                    .take(self.cfg.pipeline.max_verification_tasks)
                    .collect())
            }
            Err(e) => {
                tracing::warn!("failed to create verification tasks: {}", e);
                Err(e)
            }
        }
    }

    /// 审计：汇总所有验证结果给出终判
    pub async fn verdict(
        &self,
        spec: &TaskSpec,
        exec_text: &str,
        results: &[VerificationResult],
        cycle: u32,
        session_id: &str,
    ) -> Verdict {
        let summary = summarize_task_spec(spec, self.cfg.limits.max_taskspec_chars);
        let mut verification_summary = String::new();
        for (i, r) in results.iter().enumerate() {
            verification_summary.push_str(&format!(
                "Task {}: {}\nResult: {}\n\n",
                i + 1,
                r.task,
                cap_tail(&r.result, 500)
            ));
        }
        let user = format!(
            "TaskSpec: {}\n\nOriginal executor output (tail):\n{}\n\nVerification results:\n{}\nContext: cycle {}",
            serde_json::to_string(&summary).unwrap_or_default(),
            cap_tail(exec_text, self.cfg.limits.max_exec_report_chars),
            cap_tail(&verification_summary, self.cfg.limits.max_verify_evidence_chars),
            cycle,
        );
        match self
            .call
            .call_json_only("auditor", VERDICT_SYSTEM, &user, &self.auditor_opts(session_id, 0.1))
            .await
        {
            Ok(out) => Verdict::from_value(&out.value),
            Err(e) => Verdict::failed(format!("verdict analysis failed: {}", e)),
        }
    }

    /// 规划：根据问题清单产出紧凑的精化 TaskSpec（只覆盖未达标项）
    pub async fn refine(
        &self,
        issues: &[String],
        cycle: u32,
        max_cycles: u32,
        advice: &ModeAdvice,
        hint: &str,
        session_id: &str,
    ) -> Result<PlannerOutput, LlmError> {
        let mut prompt = format!(
            "The task is incomplete. Issues: {}.\nCycle: {}/{}. Mode: {}.\n\
             Produce a compact *fix plan* covering ONLY the unmet criteria:",
            issues.join("; "),
            cycle,
            max_cycles,
            advice.mode.describe(),
        );
        if advice.enforced {
            prompt.push_str(&format!("\n\n{}", advice.render()));
        }
        if !hint.trim().is_empty() {
            prompt.push_str(&format!("\n\nHint from the auditor: {}", hint));
        }
        self.plan(&prompt, &[], session_id).await
    }
}

/// 意图关键词兜底：命中任务动词算 task，否则 chat
fn keyword_intent(message: &str) -> Intent {
    let t = message.to_lowercase();
    const TASK_HINTS: [&str; 12] = [
        "create", "build", "deploy", "run ", "configure", "install", "check ", "generate",
        "set up", "fix ", "write ", "execute",
    ];
    if TASK_HINTS.iter().any(|h| t.contains(h)) {
        Intent::Task
    } else {
        Intent::Chat
    }
}

#[async_trait]
impl QuestionAnswerer for Roles {
    async fn is_clarifying_question(&self, text: &str) -> bool {
        let user = format!(
            "Is this text a clarifying question that needs an answer (yes/no): \"{}\". \
             Output only yes or no.",
            cap_head(text, 400)
        );
        let opts = CallOptions::new(1, 0.0, self.cfg.roles.planner.timeout_secs);
        match self.call.call_text("planner", CLASSIFIER_SYSTEM, &user, &opts).await {
            Ok(out) => out.text.trim().to_lowercase().starts_with("yes"),
            Err(_) => false,
        }
    }

    async fn short_answer(&self, question: &str) -> Option<String> {
        let user = format!(
            "Answer briefly and to the point this clarifying question from the executor: {}",
            cap_head(question, 800)
        );
        let opts = CallOptions::new(2, 0.2, self.cfg.roles.planner.timeout_secs);
        match self.call.call_text("planner", PLANNER_SYSTEM, &user, &opts).await {
            Ok(out) => {
                let (reply, _) = split_reply_and_spec(&out.text);
                if reply.is_empty() {
                    None
                } else {
                    Some(reply)
                }
            }
            Err(_) => None,
        }
    }
}

#[async_trait]
impl SummaryClient for Roles {
    async fn summarize(&self, system: &str, user: &str) -> Result<String, String> {
        let opts = CallOptions::new(3, 0.3, self.cfg.roles.auditor.timeout_secs);
        self.call
            .call_text("auditor", system, user, &opts)
            .await
            .map(|out| out.text)
            .map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_intent() {
        assert_eq!(keyword_intent("please deploy the app to staging"), Intent::Task);
        assert_eq!(keyword_intent("how are you today"), Intent::Chat);
        assert_eq!(keyword_intent("check the server status"), Intent::Task);
    }
}
