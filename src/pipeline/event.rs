//! 出站流事件
//!
//! /chat/stream 的 SSE 负载：`data: {type, agent, content|error}`。
//! 每个阶段迁移都会发一条角色标记事件；heartbeat 维持长操作下的连接。

use serde::Serialize;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Info,
    AgentMessage,
    Error,
    Complete,
    Heartbeat,
}

/// 一条流事件
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

impl StreamEvent {
    fn base(kind: EventKind) -> Self {
        Self {
            kind,
            agent: None,
            content: None,
            error: None,
            ts: None,
        }
    }

    pub fn start() -> Self {
        let mut ev = Self::base(EventKind::Start);
        ev.agent = Some("system".to_string());
        ev.ts = Some(chrono::Utc::now().timestamp_millis());
        ev
    }

    pub fn info(agent: &str, content: impl Into<String>) -> Self {
        let mut ev = Self::base(EventKind::Info);
        ev.agent = Some(agent.to_string());
        ev.content = Some(content.into());
        ev
    }

    pub fn message(agent: &str, content: impl Into<String>) -> Self {
        let mut ev = Self::base(EventKind::AgentMessage);
        ev.agent = Some(agent.to_string());
        ev.content = Some(content.into());
        ev
    }

    pub fn complete() -> Self {
        let mut ev = Self::base(EventKind::Complete);
        ev.agent = Some("system".to_string());
        ev
    }

    pub fn complete_with(content: impl Into<String>) -> Self {
        let mut ev = Self::complete();
        ev.content = Some(content.into());
        ev
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut ev = Self::base(EventKind::Error);
        ev.error = Some(message.into());
        ev
    }

    pub fn heartbeat() -> Self {
        let mut ev = Self::base(EventKind::Heartbeat);
        ev.ts = Some(chrono::Utc::now().timestamp_millis());
        ev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_shape() {
        let ev = StreamEvent::message("planner", "hello");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "agent_message");
        assert_eq!(json["agent"], "planner");
        assert_eq!(json["content"], "hello");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_error_event_carries_error_field() {
        let ev = StreamEvent::error("boom");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"], "boom");
    }

    #[test]
    fn test_heartbeat_has_timestamp() {
        let ev = StreamEvent::heartbeat();
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert!(json["ts"].as_i64().is_some());
    }
}
