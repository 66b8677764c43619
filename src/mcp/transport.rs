use super::jsonrpc::{
    build_mcp_headers, is_event_stream, JsonRpcRequest, RequestId, ACCEPT_JSON_OR_STREAM,
    EVENT_STREAM,
};
use super::Transport;
use anyhow::{bail, Result};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use std::time::Duration;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const LEGACY_SUFFIX: &str = "/sse";
const MODERN_SUFFIX: &str = "/mcp";

/// How strongly a probe supports its chosen transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    /// Chosen from the URL alone; no request was made.
    Assumed,
    /// The server answered in the transport's own format.
    Confirmed,
    /// Deduced from a rejection that only that transport produces.
    Inferred,
}

/// Outcome of transport negotiation. `url` may differ from the configured
/// URL when a derived legacy candidate answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportProbe {
    pub transport: Transport,
    pub confidence: Confidence,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModernEvidence {
    Accepted,
    SessionRequired,
    None,
}

/// Decide which transport `server_url` speaks.
pub async fn detect_transport(http: &reqwest::Client, server_url: &str) -> Result<TransportProbe> {
    if server_url.ends_with(LEGACY_SUFFIX) {
        tracing::info!(url = %server_url, "URL names the event-stream endpoint, using legacy transport");
        return Ok(TransportProbe {
            transport: Transport::SseLegacy,
            confidence: Confidence::Assumed,
            url: server_url.to_string(),
        });
    }

    let evidence = probe_streamable_http(http, server_url).await;
    if evidence == ModernEvidence::Accepted {
        tracing::info!(url = %server_url, "streamable HTTP transport detected");
        return Ok(TransportProbe {
            transport: Transport::StreamableHttp,
            confidence: Confidence::Confirmed,
            url: server_url.to_string(),
        });
    }

    for candidate in legacy_candidates(server_url) {
        if probe_event_stream(http, &candidate).await {
            tracing::info!(url = %candidate, "legacy event-stream transport detected");
            return Ok(TransportProbe {
                transport: Transport::SseLegacy,
                confidence: Confidence::Confirmed,
                url: candidate,
            });
        }
    }

    if evidence == ModernEvidence::SessionRequired {
        tracing::info!(url = %server_url, "falling back to streamable HTTP inferred from session error");
        return Ok(TransportProbe {
            transport: Transport::StreamableHttp,
            confidence: Confidence::Inferred,
            url: server_url.to_string(),
        });
    }

    bail!(
        "No supported MCP transport detected at {server_url}. If using SSE, ensure the URL points to the /sse endpoint."
    )
}

/// Legacy endpoints worth probing: the URL itself, then a `/sse` sibling.
pub fn legacy_candidates(server_url: &str) -> Vec<String> {
    let mut candidates = vec![server_url.to_string()];
    if let Some(base) = server_url.strip_suffix(MODERN_SUFFIX) {
        candidates.push(format!("{base}{LEGACY_SUFFIX}"));
    } else if !server_url.ends_with(LEGACY_SUFFIX) {
        let base = server_url.strip_suffix('/').unwrap_or(server_url);
        candidates.push(format!("{base}{LEGACY_SUFFIX}"));
    }
    candidates
}

pub fn is_missing_session_error(text: &str) -> bool {
    text.to_ascii_lowercase().contains("missing session id")
}

async fn probe_streamable_http(http: &reqwest::Client, server_url: &str) -> ModernEvidence {
    let ping = JsonRpcRequest::request(
        RequestId::Text("transport-test".to_string()),
        "ping",
        None,
    );
    let request = http
        .post(server_url)
        .headers(build_mcp_headers(None, "ping", ACCEPT_JSON_OR_STREAM))
        .json(&ping)
        .send();

    let response = match tokio::time::timeout(PROBE_TIMEOUT, request).await {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => {
            tracing::debug!(url = %server_url, error = %error, "streamable HTTP probe failed");
            return ModernEvidence::None;
        }
        Err(_) => {
            tracing::debug!(url = %server_url, "streamable HTTP probe timed out");
            return ModernEvidence::None;
        }
    };

    let status = response.status();
    if status.is_success() {
        return ModernEvidence::Accepted;
    }
    let body = tokio::time::timeout(PROBE_TIMEOUT, response.text())
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or_default();
    if is_missing_session_error(&body) {
        tracing::debug!(url = %server_url, %status, "server demands a session id");
        ModernEvidence::SessionRequired
    } else {
        tracing::debug!(url = %server_url, %status, "streamable HTTP probe rejected");
        ModernEvidence::None
    }
}

async fn probe_event_stream(http: &reqwest::Client, url: &str) -> bool {
    let request = http
        .get(url)
        .header(ACCEPT, EVENT_STREAM)
        .header(CACHE_CONTROL, "no-cache")
        .send();
    match tokio::time::timeout(PROBE_TIMEOUT, request).await {
        Ok(Ok(response)) => response.status().is_success() && is_event_stream(response.headers()),
        Ok(Err(error)) => {
            tracing::debug!(url = %url, error = %error, "event-stream probe failed");
            false
        }
        Err(_) => {
            tracing::debug!(url = %url, "event-stream probe timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_candidates_substitute_suffix() {
        assert_eq!(
            legacy_candidates("http://h:8000/mcp"),
            vec!["http://h:8000/mcp", "http://h:8000/sse"]
        );
        assert_eq!(
            legacy_candidates("http://h:8000/"),
            vec!["http://h:8000/", "http://h:8000/sse"]
        );
        assert_eq!(legacy_candidates("http://h/sse"), vec!["http://h/sse"]);
    }

    #[test]
    fn test_missing_session_error_matches_both_spellings() {
        assert!(is_missing_session_error("Bad Request: Missing session ID"));
        assert!(is_missing_session_error("{\"error\":\"missing session id\"}"));
        assert!(!is_missing_session_error("Not Found"));
    }
}
