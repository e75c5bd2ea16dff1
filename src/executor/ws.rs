//! WebSocket 传输：连接执行端 Web UI 的 /ws
//!
//! 出站一帧 {type:'message', content, session_id, timestamp}；入站
//! {type:'response'|'question'|'complete'|'cancelled'|'error', content}。
//! error 帧按报文内容分类（上下文溢出 / 工具时序）后上抛，由适配器
//! 决定是否换传输重发。

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::executor::{ExecutionRequest, ExecutionTransport, FrameSink, TransportError};

pub struct WsTransport {
    base_url: String,
}

impl WsTransport {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn ws_url(&self) -> String {
        let mut url = self.base_url.clone();
        if let Some(rest) = url.strip_prefix("http://") {
            url = format!("ws://{}", rest);
        } else if let Some(rest) = url.strip_prefix("https://") {
            url = format!("wss://{}", rest);
        }
        format!("{}/ws", url)
    }
}

#[async_trait]
impl ExecutionTransport for WsTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn execute(
        &self,
        req: &ExecutionRequest,
        sink: &dyn FrameSink,
    ) -> Result<String, TransportError> {
        let url = self.ws_url();
        let (mut ws, _) = connect_async(url.as_str()).await.map_err(|e| {
            let msg = e.to_string();
            if msg.contains("404") {
                TransportError::EndpointNotFound
            } else {
                TransportError::Connect(msg)
            }
        })?;

        let outbound = json!({
            "type": "message",
            "content": req.message,
            "session_id": req.session_id,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        ws.send(Message::Text(outbound.to_string()))
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let mut collected = String::new();

        while let Some(frame) = ws.next().await {
            let frame = frame.map_err(|e| TransportError::Protocol(e.to_string()))?;
            let text = match frame {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            let obj: Value = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(_) => continue, // 忽略非 JSON 帧
            };

            match obj["type"].as_str() {
                Some("response") => {
                    if let Some(content) = obj["content"].as_str() {
                        sink.on_text(content);
                        collected.push_str(content);
                        collected.push('\n');
                    }
                }
                Some("question") | Some("frontendToolRequest") => {
                    if let Some(q) = obj["content"].as_str() {
                        sink.on_question(q);
                    }
                }
                Some("complete") | Some("cancelled") => break,
                Some("error") => {
                    let msg = obj["message"]
                        .as_str()
                        .or(obj["content"].as_str())
                        .unwrap_or("websocket error");
                    let _ = ws.close(None).await;
                    return Err(super::classify_remote_error(0, msg));
                }
                _ => {}
            }
        }

        let _ = ws.close(None).await;
        Ok(collected.trim().to_string())
    }
}
