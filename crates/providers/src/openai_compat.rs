//! Adapter for OpenAI-compatible chat completion endpoints (OpenAI,
//! OpenRouter, Ollama, vLLM, and anything else speaking the same contract).
//!
//! Tool-call argument fragments are assembled inside the adapter so the
//! stream surfaces only whole [`ToolCall`]s.

use std::collections::BTreeMap;

use serde_json::Value;

use ps_domain::config::ProviderConfig;
use ps_domain::error::{Error, Result};
use ps_domain::stream::{BoxStream, ChatChunk, Usage};
use ps_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};

use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Build a provider from config. The API key is resolved from the inline
    /// value or the named environment variable.
    pub fn from_config(cfg: &ProviderConfig, request_timeout_secs: u64) -> Result<Self> {
        let api_key = match (&cfg.api_key, &cfg.api_key_env) {
            (Some(key), _) if !key.is_empty() => key.clone(),
            (_, Some(var)) => std::env::var(var).map_err(|_| {
                Error::Config(format!(
                    "provider {}: environment variable {var} is not set",
                    cfg.id
                ))
            })?,
            _ => {
                return Err(Error::Config(format!(
                    "provider {}: neither api_key nor api_key_env configured",
                    cfg.id
                )))
            }
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(request_timeout_secs))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg.default_model.clone(),
            client,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(message_to_wire).collect();
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "stream": stream,
        });
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.iter().map(tool_to_wire).collect());
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        if stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }

    async fn post_json(&self, body: &Value) -> Result<reqwest::Response> {
        let resp = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("provider {}: {e}", self.id))
                } else {
                    Error::Http(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {text}", status.as_u16()),
            });
        }
        Ok(resp)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire serialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn message_to_wire(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => tool_result_to_wire(msg),
        Role::Assistant => assistant_to_wire(msg),
        Role::System => serde_json::json!({
            "role": "system",
            "content": msg.content.joined_text(),
        }),
        Role::User => serde_json::json!({
            "role": "user",
            "content": msg.content.joined_text(),
        }),
    }
}

fn assistant_to_wire(msg: &Message) -> Value {
    let mut tool_calls = Vec::new();
    if let MessageContent::Parts(parts) = &msg.content {
        for part in parts {
            if let ContentPart::ToolUse { id, name, input } = part {
                tool_calls.push(serde_json::json!({
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": input.to_string() },
                }));
            }
        }
    }

    let text = msg.content.joined_text();
    let mut obj = serde_json::json!({ "role": "assistant" });
    obj["content"] = if text.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    };
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_result_to_wire(msg: &Message) -> Value {
    if let MessageContent::Parts(parts) = &msg.content {
        for part in parts {
            if let ContentPart::ToolResult {
                tool_use_id,
                content,
                ..
            } = part
            {
                return serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content,
                });
            }
        }
    }
    serde_json::json!({
        "role": "tool",
        "tool_call_id": "",
        "content": msg.content.joined_text(),
    })
}

fn tool_to_wire(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "tool call arguments are not valid JSON; using empty object");
        Value::Object(Default::default())
    })
}

fn parse_chat_response(provider: &str, body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: provider.into(),
            message: "no choices in response".into(),
        })?;

    let message = choice.get("message").ok_or_else(|| Error::Provider {
        provider: provider.into(),
        message: "no message in choice".into(),
    })?;

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let call_id = tc.get("id")?.as_str()?.to_string();
                    let func = tc.get("function")?;
                    Some(ToolCall {
                        call_id,
                        tool_name: func.get("name")?.as_str()?.to_string(),
                        arguments: parse_arguments(
                            func.get("arguments").and_then(|v| v.as_str()).unwrap_or(""),
                        ),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        content,
        tool_calls,
        usage: body.get("usage").and_then(parse_usage),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(String::from),
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct PartialCall {
    call_id: String,
    tool_name: String,
    arguments: String,
}

/// Assembles streamed tool-call fragments keyed by choice index.
#[derive(Default)]
struct StreamState {
    partials: BTreeMap<u64, PartialCall>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

impl StreamState {
    /// Digest one SSE payload, returning zero or more chunks to surface.
    fn digest(&mut self, data: &str) -> Vec<ChatChunk> {
        if data.trim() == "[DONE]" {
            return self.flush(true);
        }
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                return vec![ChatChunk::Error {
                    message: format!("malformed stream payload: {e}"),
                }]
            }
        };

        // Usage-only chunk (stream_options.include_usage).
        let choice = v
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first());
        let choice = match choice {
            Some(c) => c,
            None => {
                if let Some(usage) = v.get("usage").and_then(parse_usage) {
                    self.usage = Some(usage);
                }
                return Vec::new();
            }
        };

        if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
            self.finish_reason = Some(fr.to_string());
            if let Some(usage) = v.get("usage").and_then(parse_usage) {
                self.usage = Some(usage);
            }
        }

        let delta = match choice.get("delta") {
            Some(d) => d,
            None => return Vec::new(),
        };
        let mut out = Vec::new();

        if let Some(fragments) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for frag in fragments {
                let index = frag.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let slot = self.partials.entry(index).or_default();
                if let Some(id) = frag.get("id").and_then(|v| v.as_str()) {
                    slot.call_id = id.to_string();
                }
                if let Some(func) = frag.get("function") {
                    if let Some(name) = func.get("name").and_then(|v| v.as_str()) {
                        slot.tool_name.push_str(name);
                    }
                    if let Some(args) = func.get("arguments").and_then(|v| v.as_str()) {
                        slot.arguments.push_str(args);
                    }
                }
            }
        }

        if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                out.push(ChatChunk::Reasoning { text: text.into() });
            }
        }
        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            if !text.is_empty() {
                out.push(ChatChunk::TextDelta { text: text.into() });
            }
        }

        out
    }

    /// Emit assembled tool calls followed by the completion marker.
    fn flush(&mut self, completed: bool) -> Vec<ChatChunk> {
        let mut out = Vec::new();
        for (_, partial) in std::mem::take(&mut self.partials) {
            if partial.tool_name.is_empty() {
                continue;
            }
            out.push(ChatChunk::ToolCall(ToolCall {
                call_id: partial.call_id,
                tool_name: partial.tool_name,
                arguments: parse_arguments(&partial.arguments),
            }));
        }
        if completed {
            out.push(ChatChunk::Completed {
                usage: self.usage.take(),
                finish_reason: self.finish_reason.take(),
            });
        }
        out
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(req, false);
        tracing::debug!(provider = %self.id, "chat request");
        let resp = self.post_json(&body).await?;
        let json: Value = resp
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        parse_chat_response(&self.id, &json)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<ChatChunk>>> {
        let body = self.build_body(req, true);
        tracing::debug!(provider = %self.id, "chat stream request");
        let resp = self.post_json(&body).await?;

        let stream = async_stream::stream! {
            let mut resp = resp;
            let mut decoder = crate::sse::SseDecoder::new();
            let mut state = StreamState::default();
            let mut completed = false;

            loop {
                match resp.chunk().await {
                    Ok(Some(bytes)) => {
                        for payload in decoder.feed(&bytes) {
                            for chunk in state.digest(&payload) {
                                if matches!(chunk, ChatChunk::Completed { .. }) {
                                    completed = true;
                                }
                                yield Ok(chunk);
                            }
                        }
                    }
                    Ok(None) => {
                        if let Some(payload) = decoder.finish() {
                            for chunk in state.digest(&payload) {
                                if matches!(chunk, ChatChunk::Completed { .. }) {
                                    completed = true;
                                }
                                yield Ok(chunk);
                            }
                        }
                        break;
                    }
                    Err(e) => {
                        yield Err(Error::Http(e.to_string()));
                        break;
                    }
                }
            }

            if !completed {
                for chunk in state.flush(true) {
                    yield Ok(chunk);
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}
