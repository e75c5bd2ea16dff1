//! 流水线层：事件、数据契约、角色调用与顶层控制器

pub mod controller;
pub mod event;
pub mod roles;
pub mod spec;

pub use controller::Pipeline;
pub use event::{EventKind, StreamEvent};
pub use roles::{Intent, Roles};
pub use spec::{
    clean_user_reply, polite_fallback_reply, split_reply_and_spec, summarize_task_spec,
    AuditReport, CompletionStatus, PlannerOutput, TaskSpec, Verdict, VerificationResult,
    VerificationTask,
};
