use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::function_calling::{FunctionCall, FunctionResponse, ToolDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// The assistant turn that requested `calls`.
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<FunctionCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn tool_result(response: &FunctionResponse) -> Self {
        Self {
            tool_call_id: Some(response.id.clone()),
            ..Self::new(Role::Tool, response.content.clone())
        }
    }
}

/// One streamed item produced by a model backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    ToolCallRequest(FunctionCall),
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

pub type ModelStream = mpsc::Receiver<Result<ModelEvent>>;

/// A streaming model backend.
///
/// Backends are stateless: the caller supplies the full message context on
/// every request. An `Err` from `stream_chat` means nothing was streamed.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ModelStream>;

    /// Get the name of the client (for display purposes)
    fn client_name(&self) -> &str;
}

const MOCK_CHUNK_DELAY_MS: u64 = 50;

/// Wrapper enum that implements ChatClient for different provider clients
pub enum AnyChatClient {
    OpenAI(crate::openai::OpenAIClient),
    Mock(crate::mock_llm::MockLLMClient),
}

#[async_trait]
impl ChatClient for AnyChatClient {
    async fn stream_chat(&self, request: ChatRequest) -> Result<ModelStream> {
        match self {
            AnyChatClient::OpenAI(client) => client.stream_chat(request).await,
            AnyChatClient::Mock(client) => client.stream_chat(request).await,
        }
    }

    fn client_name(&self) -> &str {
        match self {
            AnyChatClient::OpenAI(client) => client.client_name(),
            AnyChatClient::Mock(client) => client.client_name(),
        }
    }
}

impl AnyChatClient {
    /// Create a new OpenAI client
    pub fn new_openai(api_key: String, model: String) -> Self {
        AnyChatClient::OpenAI(crate::openai::OpenAIClient::new(api_key, model))
    }

    /// Create a new OpenAI client with custom base URL
    pub fn new_openai_with_base_url(api_key: String, model: String, base_url: String) -> Self {
        AnyChatClient::OpenAI(crate::openai::OpenAIClient::new(api_key, model).with_base_url(base_url))
    }

    /// Create a new Mock LLM client. Mentioning a tool by name in a prompt
    /// makes it request that tool.
    pub fn new_mock(tools: &[ToolDefinition]) -> Self {
        let client = tools.iter().fold(
            crate::mock_llm::MockLLMClient::new().with_delay(MOCK_CHUNK_DELAY_MS),
            |client, tool| client.with_function_call_response(&tool.name, &tool.name, serde_json::json!({})),
        );
        AnyChatClient::Mock(client)
    }
}
