use async_trait::async_trait;
use futures::stream::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::chat_client::{ChatClient, ChatRequest, Message, ModelEvent, ModelStream, Role};
use crate::error::{ChatError, Result};
use crate::function_calling::FunctionCall;

#[derive(Clone)]
pub struct OpenAIClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: Option<f32>,
    max_tokens: Option<i32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireMessage {
    role: Role,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: WireFunction,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel_tool_calls: Option<bool>,
}

#[derive(Debug, Serialize)]
struct Tool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ToolFunction,
}

#[derive(Debug, Serialize)]
struct ToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Streaming response structures
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<DeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct DeltaToolCall {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<DeltaFunction>,
}

#[derive(Debug, Deserialize)]
struct DeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        let tool_calls = if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                message
                    .tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        call_type: "function".to_string(),
                        function: WireFunction {
                            name: call.name.clone(),
                            arguments: call.args.to_string(),
                        },
                    })
                    .collect(),
            )
        };

        // An assistant message that only carries tool calls has no content.
        let content = if tool_calls.is_some() && message.content.is_empty() {
            None
        } else {
            Some(message.content.clone())
        };

        WireMessage {
            role: message.role,
            content,
            tool_calls,
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

impl OpenAIClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
            temperature: Some(0.7),
            max_tokens: Some(2048),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn build_request(&self, request: &ChatRequest) -> ChatCompletionRequest {
        let tools: Option<Vec<Tool>> = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|tool| Tool {
                        tool_type: "function".to_string(),
                        function: ToolFunction {
                            name: tool.name.clone(),
                            description: tool.description.clone(),
                            parameters: tool.parameters.clone(),
                        },
                    })
                    .collect(),
            )
        };

        ChatCompletionRequest {
            model: self.model.clone(),
            messages: request.messages.iter().map(WireMessage::from).collect(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: true,
            // Tool calls are executed one at a time, so ask for them one at a time.
            parallel_tool_calls: tools.as_ref().map(|_| false),
            tools,
        }
    }
}

#[async_trait]
impl ChatClient for OpenAIClient {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ModelStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_request(&request);

        if let Ok(request_json) = serde_json::to_string(&body) {
            tracing::debug!(target: "openai", payload = %request_json, "streaming request");
        }

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::BackendResponse {
                status: status.as_u16(),
                body,
            });
        }

        let (tx, rx) = mpsc::channel::<Result<ModelEvent>>(1000);

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::default();

            while let Some(chunk_result) = stream.next().await {
                let events = match chunk_result {
                    Ok(chunk) => decoder.feed(&chunk),
                    Err(e) => vec![Err(ChatError::BackendUnreachable(format!("stream error: {}", e)))],
                };
                for event in events {
                    let failed = event.is_err();
                    if tx.send(event).await.is_err() {
                        tracing::debug!(target: "openai", "receiver dropped, stopping stream");
                        return;
                    }
                    if failed {
                        return;
                    }
                }
            }

            // Some servers close the stream without a finish_reason.
            for event in decoder.finish() {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            tracing::debug!(target: "openai", "stream processing completed");
        });

        Ok(rx)
    }

    fn client_name(&self) -> &str {
        "OpenAI"
    }
}

/// Incremental decoder for the server-sent events of a streaming chat
/// completion.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: String,
    pending: Vec<u8>,
    tool_calls: Vec<PartialToolCall>,
    done: bool,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl SseDecoder {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Result<ModelEvent>> {
        // A multi-byte character may be split across network chunks. Only
        // an incomplete trailing sequence is kept; invalid bytes are replaced.
        self.pending.extend_from_slice(bytes);
        let mut text = String::new();
        let mut rest: &[u8] = &self.pending;
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            tracing::warn!("invalid UTF-8 in model stream, replacing {} byte(s)", len);
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        self.buffer.push_str(&text.replace("\r\n", "\n"));

        let mut events = Vec::new();
        while let Some(event_end) = self.buffer.find("\n\n") {
            let event: String = self.buffer.drain(..event_end + 2).collect();
            for line in event.lines() {
                let Some(data) = line.trim().strip_prefix("data:") else {
                    continue;
                };
                let data = data.trim();
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    self.done = true;
                    continue;
                }
                match serde_json::from_str::<ChatCompletionChunk>(data) {
                    Ok(chunk) => self.handle_chunk(chunk, &mut events),
                    Err(e) => {
                        events.push(Err(ChatError::MalformedStream(format!("{} - data: {}", e, data))));
                        return events;
                    }
                }
            }
        }
        events
    }

    fn handle_chunk(&mut self, chunk: ChatCompletionChunk, events: &mut Vec<Result<ModelEvent>>) {
        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            events.push(Ok(ModelEvent::TextDelta(content)));
        }

        for delta in choice.delta.tool_calls.unwrap_or_default() {
            let index = delta.index.unwrap_or(0);
            while self.tool_calls.len() <= index {
                self.tool_calls.push(PartialToolCall::default());
            }
            let partial = &mut self.tool_calls[index];
            if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
                partial.id = id;
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name {
                    partial.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    partial.arguments.push_str(&arguments);
                }
            }
        }

        if choice.finish_reason.is_some() {
            events.extend(self.take_tool_calls().into_iter().map(Ok));
        }
    }

    fn take_tool_calls(&mut self) -> Vec<ModelEvent> {
        std::mem::take(&mut self.tool_calls)
            .into_iter()
            .enumerate()
            .filter(|(_, partial)| !partial.name.is_empty())
            .map(|(index, partial)| {
                let args = if partial.arguments.trim().is_empty() {
                    serde_json::json!({})
                } else {
                    // Unparseable arguments are passed through as a string so
                    // validation can report them back to the model.
                    serde_json::from_str(&partial.arguments)
                        .unwrap_or(serde_json::Value::String(partial.arguments.clone()))
                };
                let id = if partial.id.is_empty() {
                    format!("call_{}_{}", chrono::Utc::now().timestamp_millis(), index)
                } else {
                    partial.id
                };
                ModelEvent::ToolCallRequest(FunctionCall {
                    id,
                    name: partial.name,
                    args,
                })
            })
            .collect()
    }

    fn finish(&mut self) -> Vec<Result<ModelEvent>> {
        if !self.done {
            tracing::debug!(target: "openai", "stream ended without [DONE]");
        }
        self.take_tool_calls().into_iter().map(Ok).collect()
    }
}
