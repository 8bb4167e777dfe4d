use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;

use crate::chat_client::{ChatClient, ChatRequest, Message, ModelEvent, ModelStream};
use crate::error::Result;
use crate::function_calling::{validate_call, FunctionCall, FunctionResponse, ToolDefinition, ToolProvider};
use crate::stats::StatsTracker;

/// Answer used when the model produced no text before the tool-round cap.
pub const TRUNCATED_FALLBACK: &str = "I reached the tool call limit before finishing an answer.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionInvocationOptions {
    /// Tool rounds allowed per user request. Once reached, further tool
    /// requests end the turn with whatever text has been produced.
    pub max_iterations: usize,
    /// Run the tool calls of one round concurrently. Off by default so
    /// side effects happen in the order the model asked for them.
    pub allow_concurrent_invocation: bool,
}

impl Default for FunctionInvocationOptions {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            allow_concurrent_invocation: false,
        }
    }
}

/// What the conversation loop sees while a turn is streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseUpdate {
    TextDelta(String),
    ToolCallRequest(FunctionCall),
    ToolCallResult(FunctionResponse),
    /// The model kept requesting tools after `iterations` rounds.
    Truncated { iterations: usize },
}

pub type UpdateStream = mpsc::Receiver<Result<ResponseUpdate>>;

/// A chat client that executes the tool calls requested by the model and
/// feeds the results back until the model produces a final answer.
pub struct ToolCallingClient<C> {
    inner: Arc<C>,
    provider: Option<Arc<dyn ToolProvider>>,
    options: FunctionInvocationOptions,
    stats: Option<StatsTracker>,
}

impl<C: ChatClient + 'static> ToolCallingClient<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner: Arc::new(inner),
            provider: None,
            options: FunctionInvocationOptions::default(),
            stats: None,
        }
    }

    pub fn with_tool_provider(mut self, provider: Arc<dyn ToolProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_options(mut self, options: FunctionInvocationOptions) -> Self {
        self.options = options;
        self
    }

    /// Count tool invocations in `stats`.
    pub fn with_stats(mut self, stats: StatsTracker) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn options(&self) -> &FunctionInvocationOptions {
        &self.options
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Whether tools can currently be offered to the model.
    pub fn tools_available(&self) -> bool {
        self.provider.as_ref().map_or(false, |p| p.is_available())
    }

    /// Start one turn.
    ///
    /// The first model request is sent before this returns, so an
    /// unreachable backend is reported here. Errors after that arrive on the
    /// stream. The stream is finite and must not be reused for another turn.
    pub async fn get_streaming_response(
        &self,
        messages: Vec<Message>,
        tools: &[ToolDefinition],
    ) -> Result<UpdateStream> {
        let tools = if self.tools_available() { tools.to_vec() } else { Vec::new() };

        let first = self
            .inner
            .stream_chat(ChatRequest {
                messages: messages.clone(),
                tools: tools.clone(),
            })
            .await?;

        let (tx, rx) = mpsc::channel(256);
        let invocation = Invocation {
            inner: Arc::clone(&self.inner),
            provider: self.provider.clone(),
            options: self.options,
            stats: self.stats.clone(),
            messages,
            tools,
        };

        tokio::spawn(async move {
            if let Err(e) = invocation.run(first, &tx).await {
                tracing::warn!("turn failed: {}", e);
                let _ = tx.send(Err(e)).await;
            }
        });

        Ok(rx)
    }
}

/// State of one user request while it is being answered.
struct Invocation<C> {
    inner: Arc<C>,
    provider: Option<Arc<dyn ToolProvider>>,
    options: FunctionInvocationOptions,
    stats: Option<StatsTracker>,
    messages: Vec<Message>,
    tools: Vec<ToolDefinition>,
}

impl<C: ChatClient + 'static> Invocation<C> {
    async fn run(mut self, mut stream: ModelStream, tx: &mpsc::Sender<Result<ResponseUpdate>>) -> Result<()> {
        let mut iterations = 0;
        let mut answered = false;

        loop {
            let mut text = String::new();
            let mut calls = Vec::new();
            while let Some(event) = stream.recv().await {
                match event? {
                    ModelEvent::TextDelta(delta) => {
                        answered |= !delta.is_empty();
                        text.push_str(&delta);
                        if !emit(tx, ResponseUpdate::TextDelta(delta)).await {
                            return Ok(());
                        }
                    }
                    ModelEvent::ToolCallRequest(call) => calls.push(call),
                }
            }

            if calls.is_empty() {
                return Ok(());
            }

            if iterations >= self.options.max_iterations {
                tracing::warn!(
                    iterations,
                    pending = calls.len(),
                    "tool call limit reached, truncating response"
                );
                if !answered {
                    self.conclude(tx).await?;
                }
                emit(tx, ResponseUpdate::Truncated { iterations }).await;
                return Ok(());
            }
            iterations += 1;

            for call in &calls {
                if !emit(tx, ResponseUpdate::ToolCallRequest(call.clone())).await {
                    return Ok(());
                }
            }

            let responses = self.invoke_all(&calls).await;

            self.messages.push(Message::assistant_tool_calls(text, calls));
            for response in responses {
                self.messages.push(Message::tool_result(&response));
                if !emit(tx, ResponseUpdate::ToolCallResult(response)).await {
                    return Ok(());
                }
            }

            // A protocol failure during this round takes the tools away.
            let tools_available = self.provider.as_ref().map_or(false, |p| p.is_available());
            let tools = if tools_available { self.tools.clone() } else { Vec::new() };

            stream = self
                .inner
                .stream_chat(ChatRequest {
                    messages: self.messages.clone(),
                    tools,
                })
                .await?;
        }
    }

    /// Ask once more without tools so a capped turn still ends with text.
    /// Tool requests in that reply are ignored.
    async fn conclude(&self, tx: &mpsc::Sender<Result<ResponseUpdate>>) -> Result<()> {
        let mut stream = self
            .inner
            .stream_chat(ChatRequest {
                messages: self.messages.clone(),
                tools: Vec::new(),
            })
            .await?;

        let mut answered = false;
        while let Some(event) = stream.recv().await {
            if let ModelEvent::TextDelta(delta) = event? {
                answered |= !delta.is_empty();
                if !emit(tx, ResponseUpdate::TextDelta(delta)).await {
                    return Ok(());
                }
            }
        }

        if !answered {
            emit(tx, ResponseUpdate::TextDelta(TRUNCATED_FALLBACK.to_string())).await;
        }
        Ok(())
    }

    async fn invoke_all(&self, calls: &[FunctionCall]) -> Vec<FunctionResponse> {
        if self.options.allow_concurrent_invocation {
            return join_all(calls.iter().map(|call| self.invoke(call))).await;
        }

        let mut responses = Vec::with_capacity(calls.len());
        for call in calls {
            responses.push(self.invoke(call).await);
        }
        responses
    }

    async fn invoke(&self, call: &FunctionCall) -> FunctionResponse {
        let outcome = match (validate_call(&self.tools, call), &self.provider) {
            (Err(e), _) => Err(e),
            (Ok(()), None) => Err(crate::error::ChatError::ToolProtocolError(
                "no tool provider configured".to_string(),
            )),
            (Ok(()), Some(provider)) => provider.call_tool(call).await,
        };

        let response = match outcome {
            Ok(content) => {
                tracing::info!(tool = %call.name, "tool call succeeded");
                FunctionResponse::success(call, content)
            }
            Err(e) => {
                tracing::warn!(tool = %call.name, "tool call failed: {}", e);
                FunctionResponse::error(call, e)
            }
        };

        if let Some(stats) = &self.stats {
            stats.record_tool_call(&call.name, !response.is_error);
        }
        response
    }
}

/// Send an update; `false` once the consumer has gone away.
async fn emit(tx: &mpsc::Sender<Result<ResponseUpdate>>, update: ResponseUpdate) -> bool {
    tx.send(Ok(update)).await.is_ok()
}
