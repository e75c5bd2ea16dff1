//! LLM 层：补全客户端、provider 注册表与弹性调用层

pub mod client;
pub mod error;
pub mod json_call;
pub mod registry;

pub use client::{CallTarget, ChatClient, ChatMessage, ChatRole, HttpChatClient};
pub use error::LlmError;
pub use json_call::{
    backoff_delay, cap_head, cap_tail, parse_json_lenient, smart_truncate, CallLayer,
    CallOptions, JsonOutcome, TextOutcome,
};
pub use registry::{ProviderHealth, ProviderKind, ProviderRegistry, Route};
