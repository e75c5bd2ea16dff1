//! 执行端传输方式探测
//!
//! 执行端可能是带 WebSocket 的 Web UI，也可能是只有 SSE /reply 的无头
//! 代理。先试 /api/health（Web UI 专属），再看根路径是否返回 HTML；
//! 两者都不像就按无头 SSE 代理处理。配置可跳过探测强制 SSE。

use std::time::Duration;

/// 探测结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedTransport {
    /// Web UI：走 WebSocket /ws
    WebSocketUi,
    /// 无头代理：走 SSE /reply
    SseAgent,
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn detect_transport(client: &reqwest::Client, base_url: &str) -> DetectedTransport {
    let base = base_url.trim_end_matches('/');

    // 1) Web UI 的健康端点
    if let Ok(resp) = client
        .get(format!("{}/api/health", base))
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
    {
        if resp.status().is_success() {
            return DetectedTransport::WebSocketUi;
        }
    }

    // 2) 根路径返回 HTML 页面也说明是 Web UI
    if let Ok(resp) = client
        .get(format!("{}/", base))
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
    {
        if resp.status().as_u16() == 200 {
            let html_ct = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.contains("text/html") || ct.contains("text/plain"))
                .unwrap_or(false);
            if html_ct {
                if let Ok(body) = resp.text().await {
                    if body.contains("<html") || body.to_lowercase().contains("agent") {
                        return DetectedTransport::WebSocketUi;
                    }
                }
            }
        }
    }

    // 3) 否则按无头代理处理
    DetectedTransport::SseAgent
}
