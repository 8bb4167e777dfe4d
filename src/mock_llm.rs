use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::chat_client::{ChatClient, ChatRequest, ModelEvent, ModelStream, Role};
use crate::error::{ChatError, Result};
use crate::function_calling::FunctionCall;

/// One scripted answer of the mock backend.
#[derive(Debug, Clone)]
pub enum MockReply {
    Events(Vec<ModelEvent>),
    Unreachable(String),
}

/// An offline backend that replays scripted replies, then falls back to
/// canned responses.
pub struct MockLLMClient {
    script: Mutex<VecDeque<MockReply>>,
    responses: Vec<String>,
    response_index: AtomicUsize,
    delay_ms: u64,
    function_calls: Vec<(String, String, serde_json::Value)>,
    requests: Mutex<Vec<ChatRequest>>,
    call_counter: AtomicUsize,
}

impl MockLLMClient {
    /// Create a new mock LLM client with default responses
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            responses: vec![
                "Hello! I'm a mock LLM for testing purposes.".to_string(),
                "This is a simulated response from the mock LLM.".to_string(),
                "I can help you test your application without making real API calls.".to_string(),
            ],
            response_index: AtomicUsize::new(0),
            delay_ms: 0,
            function_calls: Vec::new(),
            requests: Mutex::new(Vec::new()),
            call_counter: AtomicUsize::new(0),
        }
    }

    /// Create a mock client with custom responses
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses,
            ..Self::new()
        }
    }

    /// Set the delay between chunks in streaming mode
    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Request `tool` whenever the latest user message contains `trigger`.
    pub fn with_function_call_response(
        mut self,
        trigger: &str,
        tool: &str,
        args: serde_json::Value,
    ) -> Self {
        self.function_calls
            .push((trigger.to_lowercase(), tool.to_string(), args));
        self
    }

    /// Queue a reply streaming `chunks` as separate text deltas.
    pub fn push_text<I, S>(&self, chunks: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let events = chunks
            .into_iter()
            .map(|c| ModelEvent::TextDelta(c.into()))
            .collect();
        self.push_reply(MockReply::Events(events));
    }

    /// Queue a reply that streams `text` and then requests `tool`.
    pub fn push_tool_call(&self, text: &str, tool: &str, args: serde_json::Value) {
        let mut events = Vec::new();
        if !text.is_empty() {
            events.push(ModelEvent::TextDelta(text.to_string()));
        }
        events.push(ModelEvent::ToolCallRequest(self.next_call(tool, args)));
        self.push_reply(MockReply::Events(events));
    }

    pub fn push_unreachable(&self, reason: &str) {
        self.push_reply(MockReply::Unreachable(reason.to_string()));
    }

    pub fn push_reply(&self, reply: MockReply) {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(reply);
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn next_call(&self, tool: &str, args: serde_json::Value) -> FunctionCall {
        let n = self.call_counter.fetch_add(1, Ordering::Relaxed);
        FunctionCall {
            id: format!("call_mock_{}", n),
            name: tool.to_string(),
            args,
        }
    }

    fn next_reply(&self, request: &ChatRequest) -> MockReply {
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        if let Some(reply) = scripted {
            return reply;
        }

        let last = request.messages.last();
        if let Some(last) = last.filter(|m| m.role == Role::Tool) {
            let text = format!("Mock LLM: the tool returned: {}", last.content);
            return MockReply::Events(split_into_chunks(&text));
        }

        if let Some(last) = last.filter(|m| m.role == Role::User) {
            let lower = last.content.to_lowercase();
            let advertised = |name: &str| request.tools.iter().any(|t| t.name == name);
            for (trigger, tool, args) in &self.function_calls {
                if lower.contains(trigger.as_str()) && advertised(tool) {
                    let call = self.next_call(tool, args.clone());
                    return MockReply::Events(vec![ModelEvent::ToolCallRequest(call)]);
                }
            }
        }

        let text = if self.responses.is_empty() {
            "Mock LLM: No responses configured".to_string()
        } else {
            let index = self.response_index.fetch_add(1, Ordering::Relaxed);
            format!("Mock LLM: {}", self.responses[index % self.responses.len()])
        };
        MockReply::Events(split_into_chunks(&text))
    }
}

/// Split response into chunks for streaming, 3 words per chunk.
fn split_into_chunks(text: &str) -> Vec<ModelEvent> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut chunks = Vec::new();

    for chunk_words in words.chunks(3) {
        let chunk = chunk_words.join(" ");
        chunks.push(if chunks.is_empty() { chunk } else { format!(" {}", chunk) });
    }

    if chunks.is_empty() {
        chunks.push(text.to_string());
    }

    chunks.into_iter().map(ModelEvent::TextDelta).collect()
}

impl Default for MockLLMClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatClient for MockLLMClient {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ModelStream> {
        let reply = self.next_reply(&request);
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);

        let events = match reply {
            MockReply::Events(events) => events,
            MockReply::Unreachable(reason) => return Err(ChatError::BackendUnreachable(reason)),
        };

        let delay_ms = self.delay_ms;
        let (tx, rx) = mpsc::channel(100);

        tokio::spawn(async move {
            for (i, event) in events.into_iter().enumerate() {
                if i > 0 && delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                if tx.send(Ok(event)).await.is_err() {
                    break; // Receiver dropped
                }
            }
        });

        Ok(rx)
    }

    fn client_name(&self) -> &str {
        "MockLLM"
    }
}
