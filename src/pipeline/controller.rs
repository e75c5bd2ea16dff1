//! 流水线控制器：一次流式任务运行的状态机
//!
//! START → PLAN → INTENT_CHECK →（chat 直接收尾）→ AUDIT →（不安全且非
//! 宽容模式则 BLOCKED）→ EXECUTE → COMPLETION_CHECK →（自报完成且未强制
//! 验证则提前收尾）→ {VERIFY → JUDGE → complete | REFINE → EXECUTE →
//! COMPLETION_CHECK}* → COMPLETE | BLOCKED | EXHAUSTED | ERROR。
//!
//! 每次阶段迁移都发角色标记事件；独立心跳任务每 15 秒保活。验证任务
//! 逐个串行执行，各自使用隔离的传输会话 id（{sid}-verify-{cycle}-task-{i}），
//! 避免通过会话连续性骗过取证。规划/审计级联耗尽降级为最小聊天回复；
//! 传输故障以 blocked 收尾（执行端状态在服务侧，无法跨厂商转移）。
//! 客户端断开后事件通道关闭，下一次发送即中止整个运行。

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::executor::{ExecutionOptions, Executor};
use crate::memory::ContextSummarizer;
use crate::pipeline::event::StreamEvent;
use crate::pipeline::roles::{Intent, Roles};
use crate::pipeline::spec::{summarize_task_spec, TaskSpec, VerificationResult};
use crate::session::{mode, recommend, ModeAdvice, SessionStore};

/// 客户端已断开：事件通道关闭，运行中止
pub struct ClientGone;

struct Emitter {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl Emitter {
    fn send(&self, ev: StreamEvent) -> Result<(), ClientGone> {
        self.tx.send(ev).map_err(|_| ClientGone)
    }
}

/// 心跳任务随运行结束一起撤销
struct HeartbeatGuard(tokio::task::JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

const EXECUTOR_PREAMBLE: &str = "You are the executor: a hands-on specialist who completes \
tasks and collects proof.\nYour method:\n\
- step-by-step execution with a short success check after EVERY step\n\
- collect concrete evidence of completion\n\
- clear reports with results\n\
- solve practical problems as they arise";

pub struct Pipeline {
    cfg: Arc<AppConfig>,
    roles: Arc<Roles>,
    executor: Arc<dyn Executor>,
    sessions: Arc<SessionStore>,
    summarizer: Arc<tokio::sync::Mutex<ContextSummarizer>>,
}

impl Pipeline {
    pub fn new(
        cfg: Arc<AppConfig>,
        roles: Arc<Roles>,
        executor: Arc<dyn Executor>,
        sessions: Arc<SessionStore>,
        summarizer: Arc<tokio::sync::Mutex<ContextSummarizer>>,
    ) -> Self {
        Self {
            cfg,
            roles,
            executor,
            sessions,
            summarizer,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// 入口：驱动一次完整运行，事件写入 tx；tx 关闭即中止
    pub async fn run(&self, message: &str, session_id: Option<String>, tx: mpsc::UnboundedSender<StreamEvent>) {
        let session_id = session_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("sess-{}", uuid::Uuid::new_v4()));

        let hb_tx = tx.clone();
        let hb_interval = std::time::Duration::from_secs(self.cfg.pipeline.heartbeat_secs.max(1));
        let _hb = HeartbeatGuard(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hb_interval);
            ticker.tick().await; // 跳过立即触发的第一跳
            loop {
                ticker.tick().await;
                if hb_tx.send(StreamEvent::heartbeat()).is_err() {
                    break;
                }
            }
        }));

        let emitter = Emitter { tx };
        if let Err(ClientGone) = self.run_inner(message, &session_id, &emitter).await {
            tracing::info!("client disconnected, pipeline run for {} aborted", session_id);
        }
    }

    async fn run_inner(
        &self,
        message: &str,
        session_id: &str,
        out: &Emitter,
    ) -> Result<(), ClientGone> {
        out.send(StreamEvent::start())?;

        // 1) PLAN：规划角色收敛请求
        self.sessions.set_stage(session_id, "plan");
        out.send(StreamEvent::info("planner", "Analyzing and enriching the request…"))?;
        let resources = self.cfg.resources.clone();

        let plan = match self.roles.plan(message, &resources, session_id).await {
            Ok(p) => p,
            Err(e) => {
                // 级联全灭：降级为明确标注的最小聊天回复，而不是崩掉请求
                tracing::error!("planner cascade exhausted: {}", e);
                out.send(StreamEvent::info(
                    "planner",
                    format!("Primary planning services failed: {}. No fallback succeeded.", e),
                ))?;
                out.send(StreamEvent::message(
                    "planner",
                    "All planning services are unavailable right now. Please try again later or check provider configuration.",
                ))?;
                out.send(StreamEvent::complete())?;
                return Ok(());
            }
        };
        out.send(StreamEvent::info(
            "planner",
            format!(
                "attempts used: {}/{}",
                plan.attempts_used, self.cfg.roles.planner.max_attempts
            ),
        ))?;

        // 2) INTENT_CHECK：会话类消息不进入审计/执行
        let spec_intent = plan.task_spec.intent.as_deref().map(str::to_lowercase);
        let do_not_execute = plan.task_spec.do_not_execute.unwrap_or(false);
        let intent = match spec_intent.as_deref() {
            Some("chat") => Intent::Chat,
            Some("task") => Intent::Task,
            _ => self.roles.classify_intent(message, session_id).await,
        };

        if do_not_execute || intent == Intent::Chat {
            out.send(StreamEvent::message("planner", plan.user_reply.clone()))?;
            out.send(StreamEvent::info(
                "system",
                "Conversation mode: execution will not start.",
            ))?;
            out.send(StreamEvent::complete())?;
            return Ok(());
        }
        out.send(StreamEvent::message("planner", plan.user_reply.clone()))?;

        // 3) AUDIT：执行前安全检查
        self.sessions.set_stage(session_id, "audit");
        out.send(StreamEvent::info("auditor", "Checking policies…"))?;
        let audit = self.roles.audit(&plan.task_spec, &resources, session_id).await;
        if let Some(note) = &audit.note {
            out.send(StreamEvent::message("auditor", note.clone()))?;
        }
        out.send(StreamEvent::message(
            "auditor",
            format!("isSafe={}. {}", audit.is_safe, audit.rationale),
        ))?;
        if !audit.degraded {
            out.send(StreamEvent::info(
                "auditor",
                format!(
                    "attempts used (policy): {}/{}",
                    audit.attempts_used, self.cfg.roles.auditor.max_attempts
                ),
            ))?;
        }

        if !audit.is_safe {
            if self.cfg.pipeline.permissive_audit {
                out.send(StreamEvent::info(
                    "system",
                    "PERMISSIVE MODE: safety block disabled; continuing execution.",
                ))?;
            } else {
                out.send(StreamEvent::complete_with("Request blocked by policy"))?;
                return Ok(());
            }
        }

        // 4) EXECUTE：首轮执行
        self.sessions.set_stage(session_id, "execute");
        out.send(StreamEvent::info("executor", "Executing the task…"))?;
        self.sessions.update_cycle(session_id, 1);
        let advice = recommend(&self.sessions, session_id, 1);

        let mut cumulative = match self
            .execute_spec(&plan.task_spec, session_id, &advice, &resources, out)
            .await?
        {
            Some(text) => text,
            None => {
                // 传输不可用：执行端状态在服务侧，不做 provider 故障转移
                out.send(StreamEvent::info(
                    "system",
                    "Pipeline blocked: execution agent unreachable.",
                ))?;
                out.send(StreamEvent::complete_with("blocked: execution transport unavailable"))?;
                return Ok(());
            }
        };

        // 5) COMPLETION_CHECK：执行端自报状态
        let status = self.roles.completion_check(&cumulative, session_id).await;
        if status.is_complete && !self.cfg.pipeline.force_verification {
            out.send(StreamEvent::message("executor", "Task completed successfully!"))?;
            out.send(StreamEvent::complete())?;
            return Ok(());
        }
        if status.is_complete {
            out.send(StreamEvent::info(
                "auditor",
                "Forced verification: running independent verification despite reported completion.",
            ))?;
        }
        if !status.can_continue {
            out.send(StreamEvent::message("executor", "Cannot continue with the task."))?;
            out.send(StreamEvent::info(
                "auditor",
                "Executor is blocked; proceeding to issue analysis.",
            ))?;
        }

        // 6) VERIFY/JUDGE/REFINE 循环
        self.sessions.set_stage(session_id, "verify");
        let max_cycles = self.cfg.pipeline.max_refinement_cycles;
        let mut cycle = 1u32;
        let mut accumulated_issues: Vec<String> = Vec::new();

        while cycle <= max_cycles {
            let cycle_mode = mode(cycle);
            let advice = recommend(&self.sessions, session_id, cycle);
            out.send(StreamEvent::info(
                "auditor",
                format!(
                    "Creating independent verification session (cycle {}/{}) - {}",
                    cycle,
                    max_cycles,
                    cycle_mode.describe()
                ),
            ))?;

            let tasks = match self
                .roles
                .verification_tasks(&plan.task_spec, &cumulative, &advice, cycle, session_id)
                .await
            {
                Ok(tasks) => tasks,
                Err(e) => {
                    // 审计链路不可用：按顶层错误收尾，不能把「无法验证」当成通过
                    out.send(StreamEvent::error(format!(
                        "auditor providers unavailable, verification cannot run: {}",
                        e
                    )))?;
                    return Ok(());
                }
            };
            if tasks.is_empty() {
                out.send(StreamEvent::message(
                    "auditor",
                    "No specific verification tasks required; accepting completion.",
                ))?;
                out.send(StreamEvent::complete())?;
                return Ok(());
            }

            // 每个验证任务跑在自己的隔离传输会话里，串行以保证副作用归属
            let mut results: Vec<VerificationResult> = Vec::new();
            for (i, task) in tasks.iter().enumerate() {
                let verify_session = format!("{}-verify-{}-task-{}", session_id, cycle, i);
                out.send(StreamEvent::info(
                    "auditor",
                    format!("Verification task {}/{}: {}", i + 1, tasks.len(), task.description),
                ))?;
                out.send(StreamEvent::info(
                    "executor",
                    "Running targeted verification task…",
                ))?;
                let result = self
                    .run_raw_execution(&task.prompt, &verify_session, out)
                    .await?
                    .unwrap_or_default();
                results.push(VerificationResult {
                    task: task.description.clone(),
                    result,
                    session: verify_session,
                });
            }

            let verdict = self
                .roles
                .verdict(&plan.task_spec, &cumulative, &results, cycle, session_id)
                .await;

            if verdict.is_complete {
                out.send(StreamEvent::message(
                    "auditor",
                    format!("Verdict: task fully completed. {}", verdict.reasoning),
                ))?;

                // 完成的交互进入上下文摘要器（含验证证据），供后续请求引用
                let verification_digest: Vec<String> =
                    results.iter().map(|r| r.result.clone()).collect();
                let combined = format!(
                    "{}\n{}\n[VERIFICATION]\n{}",
                    plan.user_reply,
                    cumulative,
                    verification_digest.join("\n")
                );
                self.summarizer
                    .lock()
                    .await
                    .process_new_interaction(message, &combined, self.roles.as_ref())
                    .await;

                out.send(StreamEvent::complete())?;
                return Ok(());
            }

            // 未完成：问题清单交回规划角色做精化
            let issues = verdict.issues.clone();
            accumulated_issues.extend(issues.iter().cloned());
            out.send(StreamEvent::message(
                "auditor",
                format!("Issues found: {}", issues.join("; ")),
            ))?;
            if !verdict.detailed_feedback.is_empty() {
                out.send(StreamEvent::message(
                    "auditor",
                    format!("Detailed analysis: {}", verdict.detailed_feedback),
                ))?;
            }

            let refined = match self
                .roles
                .refine(&issues, cycle, max_cycles, &advice, &verdict.refinement_hint, session_id)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!("planner cascade exhausted during refinement: {}", e);
                    out.send(StreamEvent::message(
                        "planner",
                        format!("Planning services unavailable during refinement: {}. Stopping here.", e),
                    ))?;
                    out.send(StreamEvent::complete())?;
                    return Ok(());
                }
            };
            let reply = if refined.user_reply.is_empty() {
                "Refining the plan.".to_string()
            } else {
                refined.user_reply.clone()
            };
            out.send(StreamEvent::message("planner", reply))?;
            out.send(StreamEvent::info("executor", "Continuing with the refinement…"))?;

            match self
                .execute_spec(&refined.task_spec, session_id, &advice, &resources, out)
                .await?
            {
                Some(extra) => {
                    cumulative = format!("{}\n\n[REFINEMENT {}]\n{}", cumulative, cycle, extra);
                }
                None => {
                    out.send(StreamEvent::info(
                        "system",
                        "Pipeline blocked: execution agent unreachable during refinement.",
                    ))?;
                    out.send(StreamEvent::complete_with("blocked: execution transport unavailable"))?;
                    return Ok(());
                }
            }

            self.sessions.update_cycle(session_id, cycle + 1);
            cycle += 1;
        }

        // EXHAUSTED：循环预算用尽
        out.send(StreamEvent::message(
            "auditor",
            format!(
                "After all attempts the task could not be completed. Manual intervention or additional resources required. Accumulated issues: {}",
                if accumulated_issues.is_empty() {
                    "none recorded".to_string()
                } else {
                    accumulated_issues.join("; ")
                }
            ),
        ))?;
        out.send(StreamEvent::complete())?;
        Ok(())
    }

    /// 按 TaskSpec 组装执行消息并下发执行端；Ok(None) 表示传输不可用（已发诊断）
    async fn execute_spec(
        &self,
        spec: &TaskSpec,
        session_id: &str,
        advice: &ModeAdvice,
        resources: &[crate::config::ResourceServer],
        out: &Emitter,
    ) -> Result<Option<String>, ClientGone> {
        let summarized = summarize_task_spec(spec, self.cfg.limits.max_taskspec_chars);
        let ts_json = serde_json::to_string(&summarized).unwrap_or_default();

        let mut message = format!(
            "{}\n\nExecute the following task (TaskSpec JSON below) as reliably as possible. \
             After EVERY step run a short success check and, if something failed, dynamically \
             rephrase the next actions within the task spec until you obtain proof of completion \
             or exhaust the options.\n\nAlways end with a criterion->evidence map.\n\nTaskSpec: {}",
            EXECUTOR_PREAMBLE, ts_json
        );
        if !resources.is_empty() {
            let json = serde_json::to_string(resources).unwrap_or_default();
            message.push_str(&format!(
                "\n\nActive resource servers (verified by the auditor): {}",
                crate::llm::cap_head(&json, self.cfg.limits.max_resource_ctx_chars)
            ));
        }
        message.push_str(&format!("\n\n{}", advice.render()));

        self.run_raw_execution(&message, session_id, out).await
    }

    /// 下发一条执行消息，流式文本转发为 executor 事件；输出并入使用追踪
    async fn run_raw_execution(
        &self,
        message: &str,
        session_id: &str,
        out: &Emitter,
    ) -> Result<Option<String>, ClientGone> {
        let (text_tx, mut text_rx) = mpsc::unbounded_channel::<String>();
        let forward_tx = out.tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(chunk) = text_rx.recv().await {
                if forward_tx.send(StreamEvent::message("executor", chunk)).is_err() {
                    break;
                }
            }
        });

        let opts = ExecutionOptions {
            enable_tools: true,
            system_instruction: None,
            working_dir_hint: None,
        };
        let outcome = self
            .executor
            .run_execution(message, session_id, &opts, &text_tx)
            .await;
        drop(text_tx);
        let _ = forwarder.await;

        match outcome {
            Ok(text) => {
                self.sessions.analyze(&text, session_id);
                Ok(Some(text))
            }
            Err(e) => {
                tracing::warn!("execution transport failed for {}: {}", session_id, e);
                out.send(StreamEvent::message(
                    "executor",
                    format!("Unable to reach the execution agent: {}", e),
                ))?;
                Ok(None)
            }
        }
    }
}
