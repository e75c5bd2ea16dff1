//! 会话层：资源追踪与自适应执行模式

pub mod mode;
pub mod tracker;

pub use mode::{mode, recommend, ExecutionMode, ModeAdvice};
pub use tracker::{ExtractedUsage, SessionRecord, SessionStore, UsageAnalyzer, UsageCategory};
