//! Blocking HTTP client for an OpenAI-compatible chat-completions endpoint.
//!
//! The orchestrator only depends on the [`LlmClient`] trait; this crate
//! provides the production implementation with SSE streaming, retry with
//! exponential backoff (honoring `Retry-After`), and merging of streamed
//! tool-call fragments into complete calls.

use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use patchpilot_core::{
    ChatMessage, ChatRequest, LlmConfig, LlmResponse, LlmToolCall, StreamCallback, StreamChunk,
};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::io::BufRead;
use std::thread;
use std::time::Duration;

/// Base delay for network/transport error retries.
const NETWORK_RETRY_BASE_MS: u64 = 1000;

pub trait LlmClient {
    /// Chat completion with tool definitions (function calling).
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse>;

    /// Streaming variant that invokes `cb` for each chunk as it arrives.
    /// Returns the fully assembled response once the stream ends.
    fn complete_chat_streaming(&self, req: &ChatRequest, cb: StreamCallback)
    -> Result<LlmResponse>;
}

#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    cfg: LlmConfig,
    client: Client,
}

impl HttpLlmClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
    }

    fn resolve_api_key(&self) -> Option<String> {
        std::env::var(&self.cfg.api_key_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                self.cfg
                    .api_key
                    .as_ref()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
    }

    fn build_chat_payload(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req
            .messages
            .iter()
            .map(|m| match m {
                ChatMessage::System { content } => json!({"role": "system", "content": content}),
                ChatMessage::User { content } => json!({"role": "user", "content": content}),
                ChatMessage::Assistant {
                    content,
                    tool_calls,
                } => {
                    let mut msg = json!({"role": "assistant"});
                    if let Some(c) = content {
                        msg["content"] = json!(c);
                    }
                    if !tool_calls.is_empty() {
                        let tc: Vec<Value> = tool_calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.arguments
                                    }
                                })
                            })
                            .collect();
                        msg["tool_calls"] = json!(tc);
                    }
                    msg
                }
                ChatMessage::Tool {
                    tool_call_id,
                    content,
                } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
            })
            .collect();

        let mut payload = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": req.max_tokens,
            "stream": stream
        });
        if let Some(temp) = req.temperature {
            payload["temperature"] = json!(temp);
        }
        if !req.tools.is_empty() {
            payload["tools"] = serde_json::to_value(&req.tools).unwrap_or(json!([]));
            payload["tool_choice"] =
                serde_json::to_value(&req.tool_choice).unwrap_or(json!("auto"));
        }
        payload
    }

    fn complete_chat_inner(&self, req: &ChatRequest, api_key: &str) -> Result<LlmResponse> {
        let payload = self.build_chat_payload(req, false);

        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(api_key)
                .json(&payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                    let body = resp.text()?;
                    if status.is_success() {
                        return parse_non_streaming_payload(&body);
                    }
                    last_err = Some(format_api_error(status, &body, attempt, self.cfg.max_retries));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay(self.cfg.retry_base_ms, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(format_transport_error(&e));
                    if should_retry_transport_error(&e) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("chat request failed")))
    }

    fn complete_chat_streaming_inner(
        &self,
        req: &ChatRequest,
        api_key: &str,
        cb: StreamCallback,
    ) -> Result<LlmResponse> {
        let payload = self.build_chat_payload(req, true);

        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let response = self
                .client
                .post(&self.cfg.endpoint)
                .bearer_auth(api_key)
                .json(&payload)
                .send();

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));

                    if status.is_success() {
                        let mut assembly = StreamAssembly::default();
                        let reader = std::io::BufReader::new(resp);
                        for line_result in reader.lines() {
                            let line = match line_result {
                                Ok(l) => l,
                                Err(e) => {
                                    last_err = Some(anyhow!("stream read error: {e}"));
                                    break;
                                }
                            };
                            if assembly.consume_sse_line(&line, Some(&cb)) {
                                break;
                            }
                        }
                        if let Some(err) = last_err.take() {
                            return Err(err);
                        }
                        return Ok(assembly.finish());
                    }

                    let body = resp.text().unwrap_or_default();
                    last_err = Some(format_api_error(status, &body, attempt, self.cfg.max_retries));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay(self.cfg.retry_base_ms, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(format_transport_error(&e));
                    if should_retry_transport_error(&e) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("chat streaming request failed")))
    }
}

impl LlmClient for HttpLlmClient {
    fn complete_chat(&self, req: &ChatRequest) -> Result<LlmResponse> {
        let key = self
            .resolve_api_key()
            .ok_or_else(|| anyhow!("{} not set and llm.api_key is empty", self.cfg.api_key_env))?;
        self.complete_chat_inner(req, &key)
    }

    fn complete_chat_streaming(
        &self,
        req: &ChatRequest,
        cb: StreamCallback,
    ) -> Result<LlmResponse> {
        let key = self
            .resolve_api_key()
            .ok_or_else(|| anyhow!("{} not set and llm.api_key is empty", self.cfg.api_key_env))?;
        self.complete_chat_streaming_inner(req, &key, cb)
    }
}

/// Accumulates SSE deltas into a complete response.
#[derive(Default)]
struct StreamAssembly {
    content: String,
    finish_reason: Option<String>,
    tool_call_parts: BTreeMap<u64, StreamToolCall>,
    completed_tool_calls: Vec<LlmToolCall>,
    announced_tools: Vec<u64>,
}

impl StreamAssembly {
    /// Consume one SSE line; returns `true` on `[DONE]`.
    fn consume_sse_line(&mut self, line: &str, cb: Option<&StreamCallback>) -> bool {
        let trimmed = line.trim();
        let Some(chunk) = trimmed.strip_prefix("data:") else {
            return false;
        };
        let chunk = chunk.trim();
        if chunk == "[DONE]" {
            if let Some(cb) = cb {
                cb(StreamChunk::Done);
            }
            return true;
        }
        let Ok(value) = serde_json::from_str::<Value>(chunk) else {
            return false;
        };
        let choice = value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first());
        let Some(choice) = choice else {
            return false;
        };
        if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
            self.finish_reason = Some(reason.to_string());
        }
        if let Some(delta) = choice.get("delta") {
            if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                self.content.push_str(content);
                if let Some(cb) = cb {
                    cb(StreamChunk::ContentDelta(content.to_string()));
                }
            }
            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                merge_stream_tool_calls(tool_calls, &mut self.tool_call_parts);
                for (index, part) in &self.tool_call_parts {
                    if !part.name.is_empty() && !self.announced_tools.contains(index) {
                        self.announced_tools.push(*index);
                        if let Some(cb) = cb {
                            cb(StreamChunk::ToolCallStart {
                                name: part.name.clone(),
                            });
                        }
                    }
                }
            }
        }
        // Some providers send a complete message object instead of deltas.
        if let Some(message) = choice.get("message") {
            if let Some(content) = message.get("content").and_then(|v| v.as_str()) {
                self.content.push_str(content);
                if let Some(cb) = cb {
                    cb(StreamChunk::ContentDelta(content.to_string()));
                }
            }
            if let Some(tool_calls) = message.get("tool_calls") {
                self.completed_tool_calls
                    .extend(parse_tool_calls_array(tool_calls));
            }
        }
        false
    }

    fn finish(self) -> LlmResponse {
        let mut tool_calls: Vec<LlmToolCall> = self
            .tool_call_parts
            .into_iter()
            .filter_map(|(index, value)| {
                if value.name.trim().is_empty() {
                    return None;
                }
                Some(LlmToolCall {
                    id: value
                        .id
                        .unwrap_or_else(|| format!("tool_call_{}", index + 1)),
                    name: value.name,
                    arguments: value.arguments,
                })
            })
            .collect();
        tool_calls.extend(self.completed_tool_calls);

        LlmResponse {
            text: self.content,
            finish_reason: self.finish_reason.unwrap_or_else(|| "stop".to_string()),
            tool_calls,
        }
    }
}

#[derive(Default)]
struct StreamToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

fn merge_stream_tool_calls(chunks: &[Value], out: &mut BTreeMap<u64, StreamToolCall>) {
    for (idx, item) in chunks.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .unwrap_or(idx as u64);
        let entry = out.entry(index).or_default();
        if let Some(id) = item.get("id").and_then(|v| v.as_str())
            && !id.trim().is_empty()
        {
            entry.id = Some(id.to_string());
        }
        if let Some(function) = item.get("function") {
            if let Some(name) = function.get("name").and_then(|v| v.as_str())
                && !name.trim().is_empty()
            {
                entry.name = name.to_string();
            }
            if let Some(arguments) = function.get("arguments").and_then(|v| v.as_str()) {
                entry.arguments.push_str(arguments);
            }
        }
    }
}

fn parse_tool_calls_array(value: &Value) -> Vec<LlmToolCall> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            let name = item
                .get("function")
                .and_then(|v| v.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if name.trim().is_empty() {
                return None;
            }
            let arguments = item
                .get("function")
                .and_then(|v| v.get("arguments"))
                .and_then(|v| v.as_str())
                .map(ToString::to_string)
                .unwrap_or_else(|| {
                    item.get("function")
                        .and_then(|v| v.get("arguments"))
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "{}".to_string())
                });
            let id = item
                .get("id")
                .and_then(|v| v.as_str())
                .filter(|id| !id.trim().is_empty())
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("tool_call_{}", idx + 1));
            Some(LlmToolCall {
                id,
                name,
                arguments,
            })
        })
        .collect()
}

fn parse_non_streaming_payload(body: &str) -> Result<LlmResponse> {
    let value: Value = serde_json::from_str(body)?;
    let choice = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first());
    let Some(choice) = choice else {
        return Err(anyhow!(
            "unexpected non-streaming payload: missing choices[0]"
        ));
    };
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();
    let message = choice.get("message").cloned().unwrap_or_else(|| json!({}));
    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let tool_calls = message
        .get("tool_calls")
        .map(parse_tool_calls_array)
        .unwrap_or_default();
    if content.is_empty() && tool_calls.is_empty() {
        return Err(anyhow!(
            "unexpected non-streaming payload: missing message.content/tool_calls"
        ));
    }
    Ok(LlmResponse {
        text: content,
        finish_reason,
        tool_calls,
    })
}

/// Produce a user-facing error from an API HTTP response.
fn format_api_error(status: StatusCode, body: &str, attempt: u8, max_retries: u8) -> anyhow::Error {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        StatusCode::UNAUTHORIZED => anyhow!(
            "Invalid or missing API key (HTTP 401). Set the configured api_key_env \
             variable or llm.api_key in settings."
        ),
        StatusCode::TOO_MANY_REQUESTS => anyhow!(
            "Rate limited (HTTP 429). Exhausted {}/{} retries. Detail: {}",
            attempt + 1,
            max_retries + 1,
            detail
        ),
        StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => anyhow!(
            "Model server error (HTTP {}). Exhausted {}/{} retries. Detail: {}",
            status.as_u16(),
            attempt + 1,
            max_retries + 1,
            detail
        ),
        _ => anyhow!("Model API error (HTTP {}): {}", status.as_u16(), detail),
    }
}

/// Produce a user-facing error from a transport/network failure.
fn format_transport_error(err: &reqwest::Error) -> anyhow::Error {
    let inner_msg = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_dns = inner_msg.contains("dns")
        || inner_msg.contains("resolve")
        || inner_msg.contains("no such host")
        || inner_msg.contains("getaddrinfo");

    if err.is_timeout() {
        anyhow!("Request timed out: the model API did not respond in time.")
    } else if is_dns {
        anyhow!("DNS resolution failed: could not resolve the model API hostname.")
    } else if err.is_connect() {
        anyhow!("Connection refused: could not reach the model API endpoint.")
    } else {
        anyhow!("Network error: {err}")
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE
    )
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}

fn retry_delay(base_ms: u64, attempt: u8, retry_after_seconds: Option<u64>) -> Duration {
    if let Some(seconds) = retry_after_seconds {
        return Duration::from_millis(seconds.saturating_mul(1000));
    }
    let exponent = u32::from(attempt);
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
    Duration::from_millis(exponential.max(base_ms.max(100)))
}
