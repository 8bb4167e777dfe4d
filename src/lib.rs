pub mod chat_client;
pub mod config;
pub mod console;
pub mod conversation;
pub mod error;
pub mod function_calling;
pub mod mcp_client;
pub mod mock_llm;
pub mod openai;
pub mod stats;
pub mod tool_calling_client;
pub mod tools;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use chat_client::{AnyChatClient, ChatClient, Message, Role};
pub use config::AppConfig;
pub use console::Console;
pub use conversation::{Command, ConversationLoop, LoopState};
pub use error::ChatError;
pub use function_calling::{FunctionCall, FunctionResponse, ToolDefinition, ToolProvider};
pub use mcp_client::{McpClientManager, McpConfig};
pub use mock_llm::MockLLMClient;
pub use stats::{StatsReport, StatsTracker};
pub use tool_calling_client::{FunctionInvocationOptions, ResponseUpdate, ToolCallingClient};
pub use tools::ToolRegistry;
