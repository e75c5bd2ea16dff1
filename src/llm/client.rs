//! OpenAI 兼容补全客户端
//!
//! 直接用 reqwest 访问任意 OpenAI 兼容端点（base_url 每次调用传入），
//! 弹性调用层据此在多级端点间级联。不依赖厂商 SDK。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::llm::LlmError;

/// 消息角色（与 Chat Completions API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// 一次补全调用的目的地：端点 + 模型 + 可选密钥
#[derive(Clone, Debug)]
pub struct CallTarget {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

/// 补全客户端 trait：单次非流式调用；级联与重试在上层
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(
        &self,
        target: &CallTarget,
        messages: &[ChatMessage],
        temperature: f32,
        timeout: Duration,
    ) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// reqwest 实现：POST {base}/chat/completions，取首个 choice 的 content
pub struct HttpChatClient {
    client: reqwest::Client,
}

impl HttpChatClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn complete(
        &self,
        target: &CallTarget,
        messages: &[ChatMessage],
        temperature: f32,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", target.base_url.trim_end_matches('/'));
        let request = CompletionRequest {
            model: &target.model,
            messages,
            temperature,
        };

        let mut req = self.client.post(&url).json(&request).timeout(timeout);
        if let Some(key) = &target.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Network(format!("timeout after {:?}", timeout))
            } else {
                LlmError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, &body));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Network(format!("decode failed: {}", e)))?;

        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(content)
    }
}

#[cfg(test)]
pub mod mock {
    //! Mock 补全客户端（用于测试，无需 API）

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{CallTarget, ChatClient, ChatMessage};
    use crate::llm::LlmError;

    /// 按脚本依次返回预置结果；脚本耗尽后重复最后一条
    pub struct ScriptedChatClient {
        script: Mutex<VecDeque<Result<String, LlmError>>>,
        last: Mutex<Option<Result<String, LlmError>>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedChatClient {
        pub fn new(script: Vec<Result<String, LlmError>>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                last: Mutex::new(None),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn always(reply: impl Into<String>) -> Self {
            Self::new(vec![Ok(reply.into())])
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedChatClient {
        async fn complete(
            &self,
            target: &CallTarget,
            messages: &[ChatMessage],
            _temperature: f32,
            _timeout: Duration,
        ) -> Result<String, LlmError> {
            self.calls.lock().unwrap().push(format!(
                "{}@{} ({} msgs)",
                target.model,
                target.base_url,
                messages.len()
            ));
            let mut script = self.script.lock().unwrap();
            match script.pop_front() {
                Some(item) => {
                    *self.last.lock().unwrap() = Some(item.clone());
                    item
                }
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or(Err(LlmError::EmptyResponse)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let sys = ChatMessage::system("a");
        assert_eq!(sys.role, ChatRole::System);
        let user = ChatMessage::user("b");
        assert_eq!(user.role, ChatRole::User);
        let asst = ChatMessage::assistant("c");
        assert_eq!(asst.role, ChatRole::Assistant);
    }

    #[test]
    fn test_role_serialization_is_lowercase() {
        let msg = ChatMessage::user("hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""role":"user""#));
    }
}
