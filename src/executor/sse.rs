//! SSE 传输：POST /reply，逐行解析 text/event-stream
//!
//! 出站报文是 OpenAI 消息形状：messages[{role, created, content:[{type:
//! 'text', text}]}] + session_id + 工作目录提示。入站帧为
//! `data: {type, message:{content:[...]}}`，`Finish` 帧表示结束。

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::executor::{ExecutionRequest, ExecutionTransport, FrameSink, TransportError};

pub struct SseTransport {
    client: reqwest::Client,
    base_url: String,
    secret: Option<String>,
}

impl SseTransport {
    pub fn new(client: reqwest::Client, base_url: &str, secret: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            secret,
        }
    }

    fn payload(&self, req: &ExecutionRequest) -> Value {
        let created = chrono::Utc::now().timestamp();
        let mut messages = Vec::new();
        if let Some(system) = &req.system_instruction {
            messages.push(json!({
                "role": "system",
                "created": created,
                "content": [{"type": "text", "text": system}]
            }));
        }
        messages.push(json!({
            "role": "user",
            "created": created,
            "content": [{"type": "text", "text": req.message}]
        }));

        let mut payload = json!({
            "messages": messages,
            "session_id": req.session_id,
            "session_working_dir": req.working_dir,
        });
        if req.enable_tools {
            payload["tool_choice"] = json!("auto");
        }
        payload
    }
}

#[async_trait]
impl ExecutionTransport for SseTransport {
    fn name(&self) -> &'static str {
        "sse"
    }

    async fn execute(
        &self,
        req: &ExecutionRequest,
        sink: &dyn FrameSink,
    ) -> Result<String, TransportError> {
        let url = format!("{}/reply", self.base_url);
        let mut http = self
            .client
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(&self.payload(req));
        if let Some(secret) = &self.secret {
            http = http.header("X-Secret-Key", secret);
        }

        let response = http
            .send()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let status = response.status().as_u16();
        if status == 404 {
            return Err(TransportError::EndpointNotFound);
        }
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(super::classify_remote_error(status, &body));
        }

        let mut collected = String::new();
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransportError::Protocol(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // 按行切分，末尾的半行留在 buffer 里
            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let line = line.trim_end_matches(['\r', '\n']);
                let data = match line.strip_prefix("data:") {
                    Some(rest) => rest.trim(),
                    None => line,
                };
                if data.is_empty() {
                    continue;
                }
                let obj: Value = match serde_json::from_str(data) {
                    Ok(v) => v,
                    Err(_) => continue,
                };

                if obj["type"] == "Finish" {
                    return Ok(collected.trim().to_string());
                }
                if let Some(content) = obj["message"]["content"].as_array() {
                    for c in content {
                        match c["type"].as_str() {
                            Some("text") => {
                                if let Some(text) = c["text"].as_str() {
                                    sink.on_text(text);
                                    collected.push_str(text);
                                    collected.push('\n');
                                }
                            }
                            Some("question") | Some("frontendToolRequest") => {
                                let q = c["text"]
                                    .as_str()
                                    .or(c["content"].as_str())
                                    .unwrap_or_default();
                                if !q.is_empty() {
                                    sink.on_question(q);
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        }

        Ok(collected.trim().to_string())
    }
}

/// 自动应答回注：把规划角色生成的回答作为新消息发回同一会话。
/// 响应流不在这里消费（会汇入主执行流），失败静默忽略。
pub async fn post_answer_back(
    client: &reqwest::Client,
    base_url: &str,
    secret: Option<&str>,
    session_id: &str,
    answer: &str,
    working_dir: &str,
) {
    let url = format!("{}/reply", base_url.trim_end_matches('/'));
    let payload = json!({
        "messages": [{
            "role": "user",
            "created": chrono::Utc::now().timestamp(),
            "content": [{"type": "text", "text": answer}]
        }],
        "session_id": session_id,
        "session_working_dir": working_dir,
    });
    let mut req = client
        .post(&url)
        .header("Accept", "text/event-stream")
        .json(&payload);
    if let Some(secret) = secret {
        req = req.header("X-Secret-Key", secret);
    }
    if let Err(e) = req.send().await {
        tracing::debug!("auto-answer post failed (ignored): {}", e);
    }
}
