//! Streaming chat-completions adapter.
//!
//! Implements the core [`LanguageModel`] capability against an
//! OpenAI-compatible `/chat/completions` endpoint: the conversation history
//! becomes the request body (cached frames ride along as base64 data URLs),
//! the registered function specs become the `tools` array, and the SSE
//! response is turned into a stream of [`ReplyFragment`]s. Tool-call
//! argument deltas are accumulated until the model closes the turn with
//! `finish_reason: "tool_calls"`.

use crate::config::Config;
use crate::sse::SseParser;
use argus_core::conversation::{ChatMessage, ContentPart};
use argus_core::functions::FunctionCallSpec;
use argus_core::model::{LanguageModel, ModelError, ReplyFragment, ReplyStream};
use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const FRAGMENT_CHANNEL_CAPACITY: usize = 32;

pub struct ChatCompletionsModel {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl ChatCompletionsModel {
    pub fn new(client: reqwest::Client, config: &Config) -> Self {
        Self {
            client,
            api_key: config.openai_api_key.clone(),
            model: config.chat_model.clone(),
            api_base: config.api_base.clone(),
        }
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsModel {
    async fn stream_reply(
        &self,
        history: Vec<ChatMessage>,
        tools: Vec<FunctionCallSpec>,
    ) -> Result<ReplyStream, ModelError> {
        let body = request_body(&self.model, &history, &tools);
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::RequestFailed(e.to_string()))?
            .error_for_status()
            .map_err(|e| ModelError::RequestFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        tokio::spawn(pump_response(response, tx));
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Reads the SSE body and forwards fragments until the `[DONE]` sentinel,
/// the connection drops, or the receiver goes away (an interrupted
/// response stops pulling, which closes the connection).
async fn pump_response(
    response: reqwest::Response,
    tx: mpsc::Sender<Result<ReplyFragment, ModelError>>,
) {
    let mut body = response.bytes_stream();
    let mut parser = SseParser::new();
    let mut assembler = StreamAssembler::default();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx
                    .send(Err(ModelError::StreamInterrupted(e.to_string())))
                    .await;
                return;
            }
        };
        for payload in parser.push(&chunk) {
            if payload.trim() == "[DONE]" {
                send_all(&tx, assembler.finish()).await;
                return;
            }
            if !send_all(&tx, assembler.push_chunk(&payload)).await {
                return;
            }
        }
    }
    if let Some(payload) = parser.finish() {
        if payload.trim() != "[DONE]" && !send_all(&tx, assembler.push_chunk(&payload)).await {
            return;
        }
    }
    send_all(&tx, assembler.finish()).await;
}

async fn send_all(
    tx: &mpsc::Sender<Result<ReplyFragment, ModelError>>,
    fragments: Vec<ReplyFragment>,
) -> bool {
    for fragment in fragments {
        if tx.send(Ok(fragment)).await.is_err() {
            return false;
        }
    }
    true
}

fn request_body(
    model: &str,
    history: &[ChatMessage],
    tools: &[FunctionCallSpec],
) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = history.iter().map(message_json).collect();
    let mut body = serde_json::json!({
        "model": model,
        "messages": messages,
        "stream": true,
    });
    if !tools.is_empty() {
        let tools: Vec<serde_json::Value> = tools.iter().map(tool_json).collect();
        body["tools"] = tools.into();
    }
    body
}

fn message_json(message: &ChatMessage) -> serde_json::Value {
    // Text-only turns use the compact string form; turns carrying a frame
    // use the multi-part form with an inline data URL.
    let content = if message.has_image() {
        let parts: Vec<serde_json::Value> = message
            .content()
            .iter()
            .map(|part| match part {
                ContentPart::Text(text) => serde_json::json!({"type": "text", "text": text}),
                ContentPart::Image(frame) => {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(frame.data());
                    serde_json::json!({
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{};base64,{encoded}", frame.mime()),
                        },
                    })
                }
            })
            .collect();
        serde_json::Value::from(parts)
    } else {
        serde_json::Value::from(message.text())
    };
    serde_json::json!({
        "role": message.role().as_str(),
        "content": content,
    })
}

fn tool_json(spec: &FunctionCallSpec) -> serde_json::Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": spec.name(),
            "description": spec.description(),
            "parameters": spec.parameters_schema(),
        },
    })
}

// Wire shapes for one streamed chat-completions chunk.

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Default)]
struct ToolCallDraft {
    name: String,
    arguments: String,
}

/// Accumulates streamed deltas into reply fragments. Text deltas pass
/// straight through; tool-call deltas build up per-index drafts that are
/// flushed as [`ReplyFragment::FunctionCall`]s when the model finishes the
/// turn.
#[derive(Debug, Default)]
struct StreamAssembler {
    tool_calls: Vec<ToolCallDraft>,
}

impl StreamAssembler {
    fn push_chunk(&mut self, payload: &str) -> Vec<ReplyFragment> {
        let chunk: StreamChunk = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable stream chunk");
                return Vec::new();
            }
        };

        let mut fragments = Vec::new();
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    fragments.push(ReplyFragment::Text(text));
                }
            }
            for call in choice.delta.tool_calls.unwrap_or_default() {
                if self.tool_calls.len() <= call.index {
                    self.tool_calls
                        .resize_with(call.index + 1, ToolCallDraft::default);
                }
                let draft = &mut self.tool_calls[call.index];
                if let Some(function) = call.function {
                    if let Some(name) = function.name {
                        draft.name = name;
                    }
                    if let Some(arguments) = function.arguments {
                        draft.arguments.push_str(&arguments);
                    }
                }
            }
            if choice.finish_reason.as_deref() == Some("tool_calls") {
                fragments.append(&mut self.flush_tool_calls());
            }
        }
        fragments
    }

    /// Flushes anything pending at end of stream, for backends that close
    /// the connection without a `finish_reason`.
    fn finish(&mut self) -> Vec<ReplyFragment> {
        self.flush_tool_calls()
    }

    fn flush_tool_calls(&mut self) -> Vec<ReplyFragment> {
        std::mem::take(&mut self.tool_calls)
            .into_iter()
            .filter_map(|draft| {
                if draft.name.is_empty() {
                    return None;
                }
                let arguments = if draft.arguments.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    match serde_json::from_str(&draft.arguments) {
                        Ok(value) => value,
                        Err(e) => {
                            tracing::warn!(
                                function = %draft.name,
                                error = %e,
                                "dropping tool call with unparseable arguments"
                            );
                            return None;
                        }
                    }
                };
                Some(ReplyFragment::FunctionCall {
                    name: draft.name,
                    arguments,
                })
            })
            .collect()
    }
}
