//! 上下文摘要器：把对话规模压在 token 预算之内
//!
//! 每次交互后追加 user/agent 轮次；估算超预算且留存消息多于 4 条时，
//! 把最近 4 条以外的全部轮次交给 AI 压缩（AI 失败则本地降级摘要），
//! 摘要带时间戳头*追加*到 summarized_history，留存窗口裁剪。
//! 状态在每次更新后落盘，进程启动时回载。
//!
//! 不变式：任何触发了摘要的更新完成后，estimate(摘要) + estimate(当前
//! 会话) 必须回到预算之下——AI 摘要本身仍超长时对历史做尾部截断兜底。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::memory::TokenEstimator;

/// 一条对话轮次（role 为 user / assistant）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

/// 摘要器持久化状态（快照文件的全部内容）
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ConversationState {
    pub current_session: Vec<Turn>,
    pub summarized_history: String,
    pub last_summary_at: Option<String>,
    pub token_estimate: usize,
}

/// 摘要 AI 客户端：摘要器唯一的外部依赖，便于降级与测试
#[async_trait::async_trait]
pub trait SummaryClient: Send + Sync {
    async fn summarize(&self, system: &str, user: &str) -> Result<String, String>;
}

/// 对外统计（/context/stats）
#[derive(Debug, Clone, Serialize)]
pub struct ContextStats {
    pub current_session_len: usize,
    pub summarized_history_chars: usize,
    pub estimated_tokens: usize,
    pub last_summary: Option<String>,
}

pub struct ContextSummarizer {
    max_tokens: usize,
    summary_ratio: f64,
    state: ConversationState,
    state_file: PathBuf,
    estimator: Arc<dyn TokenEstimator>,
}

const SUMMARY_SYSTEM: &str =
    "You are an expert at summarizing technical conversations. Produce a precise, compact summary.";

/// 留存窗口：最近 2 轮（user+assistant 各一条，共 4 条消息）
const KEEP_RECENT: usize = 4;

impl ContextSummarizer {
    pub fn new(
        max_tokens: usize,
        summary_ratio: f64,
        state_file: impl AsRef<Path>,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Self {
        let mut s = Self {
            max_tokens,
            summary_ratio,
            state: ConversationState::default(),
            state_file: state_file.as_ref().to_path_buf(),
            estimator,
        };
        if s.load_state() {
            tracing::info!("context state loaded from {}", s.state_file.display());
        }
        s
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn summary_ratio(&self) -> f64 {
        self.summary_ratio
    }

    /// 新内容加入后是否会超出预算
    pub fn should_summarize(&self, candidate: &str) -> bool {
        self.state.token_estimate + self.estimator.estimate(candidate) > self.max_tokens
    }

    /// 记录一次完整交互；必要时摘要并裁剪留存窗口
    pub async fn process_new_interaction(
        &mut self,
        user_input: &str,
        agent_output: &str,
        ai: &dyn SummaryClient,
    ) {
        let triggered = self.should_summarize(&format!("{}{}", user_input, agent_output));

        self.state.current_session.push(Turn {
            role: "user".to_string(),
            content: user_input.to_string(),
        });
        self.state.current_session.push(Turn {
            role: "assistant".to_string(),
            content: agent_output.to_string(),
        });

        if triggered && self.state.current_session.len() > KEEP_RECENT {
            let split = self.state.current_session.len() - KEEP_RECENT;
            let to_summarize: Vec<Turn> = self.state.current_session[..split].to_vec();

            let summary = match self.ai_summary(&to_summarize, ai).await {
                Ok(s) if !s.trim().is_empty() => s,
                _ => fallback_summary(&to_summarize),
            };

            let now = chrono::Utc::now();
            self.state.summarized_history.push_str(&format!(
                "\n\n[SUMMARY {}]\n{}",
                now.format("%H:%M"),
                summary.trim()
            ));
            self.state.current_session.drain(..split);
            self.state.last_summary_at = Some(now.to_rfc3339());

            self.update_estimate();
            self.enforce_budget();
        } else {
            self.update_estimate();
        }

        self.save_state();
    }

    async fn ai_summary(&self, turns: &[Turn], ai: &dyn SummaryClient) -> Result<String, String> {
        let mut context_text = String::new();
        for t in turns {
            context_text.push_str(&format!("\n{}: {}\n", t.role.to_uppercase(), t.content));
        }
        let target_chars = (context_text.chars().count() as f64 * self.summary_ratio) as usize;
        let prompt = format!(
            "Create a compact but informative summary of the conversation below, preserving:\n\
             1. Key technical details and decisions\n\
             2. Important errors and their fixes\n\
             3. System state and configuration\n\
             4. Main achievements and results\n\n\
             Conversation to summarize:\n{}\n\n\
             The summary must be structured and take no more than {} characters.",
            context_text, target_chars
        );
        ai.summarize(SUMMARY_SYSTEM, &prompt).await
    }

    fn update_estimate(&mut self) {
        let session_json =
            serde_json::to_string(&self.state.current_session).unwrap_or_default();
        self.state.token_estimate = self.estimator.estimate(&self.state.summarized_history)
            + self.estimator.estimate(&session_json);
    }

    /// 摘要后仍超预算时，对 summarized_history 做尾部截断（丢最旧的部分）；
    /// 截断头也计入预算，实在放不下就整段丢弃历史。
    fn enforce_budget(&mut self) {
        if self.state.token_estimate <= self.max_tokens {
            return;
        }
        const TRUNCATION_HEADER: &str = "[EARLIER HISTORY TRUNCATED]\n";
        let session_json =
            serde_json::to_string(&self.state.current_session).unwrap_or_default();
        let session_tokens = self.estimator.estimate(&session_json);
        let history_budget_tokens = self.max_tokens.saturating_sub(session_tokens + 1);
        let allowance_chars = (history_budget_tokens * 4)
            .saturating_sub(TRUNCATION_HEADER.chars().count() + 4);

        if allowance_chars < 16 {
            self.state.summarized_history.clear();
            tracing::warn!("summarized history dropped entirely to honor token budget");
        } else {
            let total: Vec<char> = self.state.summarized_history.chars().collect();
            if total.len() > allowance_chars {
                let tail: String = total[total.len() - allowance_chars..].iter().collect();
                self.state.summarized_history = format!("{}{}", TRUNCATION_HEADER, tail);
                tracing::warn!(
                    "summarized history truncated to {} chars to honor token budget",
                    allowance_chars
                );
            }
        }
        self.update_estimate();
        if self.state.token_estimate > self.max_tokens
            && !self.state.summarized_history.is_empty()
        {
            // 留存窗口本身逼近预算的极端情况：历史让路
            self.state.summarized_history.clear();
            self.update_estimate();
        }
    }

    /// 渲染为一段可直接拼入 system prompt 的文本
    pub fn format_for_prompt(&self) -> String {
        let mut out = String::new();
        if !self.state.summarized_history.is_empty() {
            out.push_str(&format!(
                "[PRIOR CONTEXT]\n{}\n\n",
                self.state.summarized_history.trim()
            ));
        }
        if !self.state.current_session.is_empty() {
            out.push_str("[CURRENT SESSION]\n");
            for t in &self.state.current_session {
                out.push_str(&format!("{}: {}\n\n", t.role.to_uppercase(), t.content));
            }
        }
        out
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            current_session_len: self.state.current_session.len(),
            summarized_history_chars: self.state.summarized_history.chars().count(),
            estimated_tokens: self.state.token_estimate,
            last_summary: self.state.last_summary_at.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.state = ConversationState::default();
        self.save_state();
        tracing::info!("context state cleared");
    }

    /// 快照落盘；父目录不存在时自动创建
    fn save_state(&self) {
        if let Some(parent) = self.state_file.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&self.state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.state_file, json) {
                    tracing::error!("failed to save context state: {}", e);
                }
            }
            Err(e) => tracing::error!("failed to serialize context state: {}", e),
        }
    }

    fn load_state(&mut self) -> bool {
        if !self.state_file.exists() {
            return false;
        }
        match std::fs::read_to_string(&self.state_file)
            .map_err(|e| e.to_string())
            .and_then(|data| serde_json::from_str(&data).map_err(|e| e.to_string()))
        {
            Ok(state) => {
                self.state = state;
                true
            }
            Err(e) => {
                tracing::warn!("failed to load context state: {}", e);
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &ConversationState {
        &self.state
    }
}

/// AI 不可用时的本地降级摘要：最近 5 条，各截 200 字符
fn fallback_summary(turns: &[Turn]) -> String {
    let recent = &turns[turns.len().saturating_sub(5)..];
    let parts: Vec<String> = recent
        .iter()
        .map(|t| {
            let content: String = t.content.chars().take(200).collect();
            format!("{}: {}...", t.role, content)
        })
        .collect();
    format!("[AUTO-SUMMARY] Recent interactions:\n{}", parts.join("\n"))
}
