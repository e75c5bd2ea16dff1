//! Queen - Rust 三角色智能体流水线控制面
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **executor**: 执行端适配器（WS/SSE 双传输、证据抽取、问题自动应答）
//! - **llm**: 补全客户端、provider 注册表与弹性调用层
//! - **memory**: token 估算与上下文摘要器（快照持久化）
//! - **observability**: tracing 初始化
//! - **pipeline**: 规划→审计→执行→验证→精化 状态机与流事件
//! - **server**: HTTP/SSE 服务层
//! - **session**: 会话资源追踪与自适应执行模式

pub mod config;
pub mod executor;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod pipeline;
pub mod server;
pub mod session;

pub use config::{load_config, AppConfig};
pub use pipeline::{Pipeline, Roles, StreamEvent};
