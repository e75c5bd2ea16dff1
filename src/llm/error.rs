//! LLM 调用错误类型
//!
//! 与弹性调用层配合：按错误类别决定退避重试 / 收缩提示词 / 切换候选 / 放弃。

use thiserror::Error;

/// 补全端点调用错误（按 HTTP 状态与报文分类）
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("server error (HTTP {status})")]
    Server { status: u16 },

    /// 上游报告提示词超过 token 上限，可收缩后重试
    #[error("prompt too large: {0}")]
    PromptTooLarge(String),

    #[error("unauthorized (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("endpoint not found (HTTP 404)")]
    EndpointNotFound,

    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("empty response")]
    EmptyResponse,

    /// 要求 JSON 的调用拿到了无法解析的输出
    #[error("malformed output: {0}")]
    MalformedOutput(String),

    #[error("all candidates exhausted: {last}")]
    Exhausted { last: String },
}

impl LlmError {
    /// 是否值得在同一级联内尝试下一个候选模型
    ///
    /// 注意 PromptTooLarge 视为可重试：下一个候选可能有更大的上下文窗口；
    /// 全部候选耗尽后由上层决定是否收缩提示词再来一轮。
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited
                | LlmError::Server { .. }
                | LlmError::PromptTooLarge(_)
                | LlmError::Network(_)
                | LlmError::EmptyResponse
        )
    }

    /// 从 HTTP 状态码与响应体分类错误
    pub fn from_status(status: u16, body: &str) -> Self {
        if status == 429 {
            return LlmError::RateLimited;
        }
        if status == 404 {
            return LlmError::EndpointNotFound;
        }
        if status == 401 || status == 403 {
            return LlmError::Unauthorized { status };
        }
        if (500..600).contains(&status) {
            return LlmError::Server { status };
        }
        if status == 400 && is_token_limit_message(body) {
            return LlmError::PromptTooLarge(truncate_message(body));
        }
        LlmError::Api {
            status,
            message: truncate_message(body),
        }
    }
}

/// 上游「提示词过长」报文的识别（各家措辞不同，按子串匹配）
pub fn is_token_limit_message(msg: &str) -> bool {
    let m = msg.to_lowercase();
    m.contains("model_max_prompt_tokens_exceeded")
        || m.contains("prompt token count")
        || m.contains("context length")
        || m.contains("maximum context")
        || m.contains("token limit")
}

fn truncate_message(msg: &str) -> String {
    msg.chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(LlmError::from_status(429, ""), LlmError::RateLimited));
        assert!(matches!(LlmError::from_status(404, ""), LlmError::EndpointNotFound));
        assert!(matches!(
            LlmError::from_status(503, ""),
            LlmError::Server { status: 503 }
        ));
        assert!(matches!(
            LlmError::from_status(401, ""),
            LlmError::Unauthorized { status: 401 }
        ));
    }

    #[test]
    fn test_token_limit_detection() {
        let err = LlmError::from_status(400, "model_max_prompt_tokens_exceeded: 40000 > 32768");
        assert!(matches!(err, LlmError::PromptTooLarge(_)));

        let err = LlmError::from_status(400, "invalid request: missing field");
        assert!(matches!(err, LlmError::Api { status: 400, .. }));
    }

    #[test]
    fn test_retriable_classes() {
        assert!(LlmError::RateLimited.is_retriable());
        assert!(LlmError::Server { status: 500 }.is_retriable());
        assert!(LlmError::PromptTooLarge("x".into()).is_retriable());
        assert!(!LlmError::Unauthorized { status: 401 }.is_retriable());
        assert!(!LlmError::MalformedOutput("x".into()).is_retriable());
    }
}
