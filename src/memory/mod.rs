//! 记忆层：token 估算策略与上下文摘要器

pub mod estimator;
pub mod summarizer;

pub use estimator::{CharsPerToken, TokenEstimator};
pub use summarizer::{ContextStats, ContextSummarizer, ConversationState, SummaryClient, Turn};
