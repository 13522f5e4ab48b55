use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};

use crate::engine::Engine;
use crate::error::KeytideError;

const UPSTREAM_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const MAX_RETRIES: u32 = 5;
const RETRY_BACKOFF_SECS: u64 = 1;

/// A forwarded response ready to hand back to the client: status, the
/// headers worth preserving, and the body already fully read (the upstream
/// body must be buffered anyway to scan it for token usage).
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Forwards one client request to the upstream Gemini API, retrying on 429
/// by re-selecting a `(model, key)` pair up to `MAX_RETRIES` times. A 403 is
/// reported to the engine and surfaced as `KeytideError::InvalidKey` rather
/// than passed through — it is never retried, since the key itself is the
/// problem, and the original service's own forbidden response is a
/// synthesized JSON error rather than upstream's body. Any other status is
/// passed through untouched.
pub async fn forward(
    client: &reqwest::Client,
    engine: &Engine,
    method: Method,
    path: &str,
    query: &[(String, String)],
    mut headers: HeaderMap,
    body: Bytes,
    requested_model: Option<&str>,
) -> Result<ForwardedResponse, KeytideError> {
    headers.remove(axum::http::header::HOST);

    for attempt in 0..MAX_RETRIES {
        let selection = engine.pick(requested_model)?;
        let target_path = substitute_model(path, &selection.model);
        let url = format!("{UPSTREAM_BASE_URL}/{target_path}");

        tracing::debug!(
            attempt = attempt + 1,
            model = %selection.model,
            key = %selection.key,
            "forwarding request upstream"
        );

        let mut request = client.request(method.clone(), &url).headers(headers.clone());
        request = request.query(query).query(&[("key", selection.key.as_str())]);
        if !body.is_empty() {
            request = request.body(body.clone());
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            if let Err(e) = engine.on_429(&selection.key, &selection.model) {
                tracing::error!(error = %e, "failed to persist 429 outcome");
            }
            tokio::time::sleep(std::time::Duration::from_secs(RETRY_BACKOFF_SECS)).await;
            continue;
        }

        if status == StatusCode::FORBIDDEN {
            if let Err(e) = engine.on_403(&selection.key) {
                tracing::error!(error = %e, "failed to persist 403 outcome");
            }
            return Err(KeytideError::InvalidKey);
        }

        let headers_out = strip_hop_by_hop(response.headers().clone());
        let body_out = response.bytes().await?;

        if status.is_success() {
            if let Some(tokens) = extract_token_usage(&body_out) {
                if let Err(e) = engine.on_success(&selection.key, &selection.model, tokens) {
                    tracing::warn!(error = %e, "failed to persist token usage after success");
                }
            } else {
                tracing::debug!(model = %selection.model, "no token usage metadata in response");
            }
        }

        return Ok(ForwardedResponse { status, headers: headers_out, body: body_out });
    }

    Err(KeytideError::NoCapacity)
}

/// `v1beta/models/gemini-pro:generateContent` -> same path with the
/// second-to-last segment replaced by `models/<model>`. Paths that don't
/// target `generateContent` are passed through unchanged.
fn substitute_model(path: &str, model: &str) -> String {
    if !path.contains("generateContent") {
        return path.to_string();
    }
    let mut parts: Vec<String> = path.split('/').map(|s| s.to_string()).collect();
    if parts.len() >= 2 {
        let idx = parts.len() - 2;
        parts[idx] = format!("models/{model}");
    }
    parts.join("/")
}

/// Scans a (possibly newline-delimited, possibly SSE `data:`-prefixed)
/// response body for token usage, exactly as the upstream service's own
/// streamed Gemini responses encode it: prefer `usageMetadata.totalTokenCount`
/// the moment it appears; otherwise fall back to the last
/// `candidates[0].tokenCount` seen, without stopping the scan early for it.
fn extract_token_usage(body: &[u8]) -> Option<u64> {
    let text = String::from_utf8_lossy(body);
    let mut fallback = None;

    for raw_line in text.split('\n') {
        let mut line = raw_line.trim();
        if let Some(rest) = line.strip_prefix("data:") {
            line = rest.trim();
        }
        if !line.starts_with('{') {
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<serde_json::Value>(line) else { continue };

        if let Some(total) = chunk.get("usageMetadata").and_then(|m| m.get("totalTokenCount")).and_then(|v| v.as_u64()) {
            return Some(total);
        }
        if let Some(count) = chunk
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("tokenCount"))
            .and_then(|v| v.as_u64())
        {
            fallback = Some(count);
        }
    }

    fallback.filter(|t| *t > 0)
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in ["content-encoding", "transfer-encoding", "connection"] {
        if let Ok(name) = HeaderName::try_from(name) {
            headers.remove(name);
        }
    }
    headers
}
