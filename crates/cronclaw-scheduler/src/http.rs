//! Outbound request building and failure classification for dispatched runs.

use std::collections::BTreeMap;
use std::error::Error as _;

use cronclaw_core::error::{CronClawError, Result};
use cronclaw_core::types::Run;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use serde::Serialize;

/// Headers never written to the request snapshot in clear text.
const SENSITIVE_HEADERS: [&str; 3] = ["authorization", "cookie", "set-cookie"];

/// Stored response bodies are cut at this many bytes.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// The resolved request for one run.
#[derive(Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: String,
}

impl OutboundRequest {
    /// Build from the run snapshot: `{base_url}{target_path}?run_id={id}`.
    pub fn build(run: &Run, base_url: &str) -> Result<Self> {
        let snap = &run.snapshot;
        let mut url = Url::parse(&format!("{}{}", base_url, snap.target_path))
            .map_err(|e| CronClawError::Http(format!("invalid target url: {e}")))?;
        url.query_pairs_mut().append_pair("run_id", &run.id.to_string());

        let method = Method::from_bytes(snap.http_method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| CronClawError::Http(format!("invalid http method '{}'", snap.http_method)))?;

        let mut headers = HeaderMap::new();
        for (key, val) in &snap.headers {
            if let Ok(name) = HeaderName::from_bytes(key.as_bytes())
                && let Ok(value) = HeaderValue::from_str(val)
            {
                headers.insert(name, value);
            } else {
                tracing::warn!(run_id = run.id, "Dropping invalid header '{key}'");
            }
        }
        if !snap.body.is_empty() && !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        if let Ok(trace) = HeaderValue::from_str(&run.trace_id) {
            headers.insert(HeaderName::from_static("x-trace-id"), trace);
        }

        Ok(Self {
            method,
            url,
            headers,
            body: snap.body.clone(),
        })
    }

    /// JSON record of what is sent, with sensitive header values masked.
    pub fn snapshot(&self) -> String {
        #[derive(Serialize)]
        struct Snapshot<'a> {
            method: &'a str,
            url: &'a str,
            headers: BTreeMap<String, String>,
            body: &'a str,
        }
        let headers = self
            .headers
            .iter()
            .map(|(k, v)| {
                let name = k.as_str().to_string();
                let value = if SENSITIVE_HEADERS.contains(&name.as_str()) {
                    "***".to_string()
                } else {
                    v.to_str().unwrap_or("<binary>").to_string()
                };
                (name, value)
            })
            .collect();
        let snap = Snapshot {
            method: self.method.as_str(),
            url: self.url.as_str(),
            headers,
            body: &self.body,
        };
        serde_json::to_string(&snap).unwrap_or_default()
    }

    pub fn into_request(self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let mut req = client.request(self.method, self.url).headers(self.headers);
        if !self.body.is_empty() {
            req = req.body(self.body);
        }
        req
    }
}

/// How a failed call without an HTTP response is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    /// The request deadline passed → TIMEOUT.
    Timeout,
    /// Anything else → FAILED with this message.
    Failed(String),
}

/// Classify a transport error: deadline, network-level causes, or the raw message.
pub fn classify_error(err: &reqwest::Error) -> CallFailure {
    if err.is_timeout() && !err.is_connect() {
        return CallFailure::Timeout;
    }
    if let Some(kind) = io_error_kind(err) {
        use std::io::ErrorKind;
        let class = match kind {
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::TimedOut => "connect_timeout",
            ErrorKind::NetworkUnreachable => "network_unreachable",
            ErrorKind::HostUnreachable => "host_unreachable",
            _ => "network_error",
        };
        return CallFailure::Failed(class.into());
    }
    if err.is_connect() {
        if err.is_timeout() {
            return CallFailure::Failed("connect_timeout".into());
        }
        return CallFailure::Failed("network_error".into());
    }
    CallFailure::Failed(err.to_string())
}

/// Walk the source chain for the first I/O error.
fn io_error_kind(err: &reqwest::Error) -> Option<std::io::ErrorKind> {
    let mut source = err.source();
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = e.source();
    }
    None
}

/// `"500 Internal Server Error; body=..."` for non-2xx responses.
pub fn status_message(status: reqwest::StatusCode, body: &str) -> String {
    let mut msg = status.to_string();
    if !body.is_empty() {
        msg = format!("{msg}; body={body}");
    }
    msg
}

/// Cut at a char boundary no later than `MAX_BODY_BYTES`.
pub fn truncate_body(mut body: String) -> String {
    if body.len() > MAX_BODY_BYTES {
        let mut cut = MAX_BODY_BYTES;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
