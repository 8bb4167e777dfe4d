use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};

use crate::chat_client::AnyChatClient;
use crate::function_calling::ToolDefinition;
use crate::mcp_client::McpConfig;

const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_MAX_TOOL_ITERATIONS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    OpenAI {
        api_key: String,
        model: String,
        base_url: Option<String>,
    },
    Mock,
}

impl BackendConfig {
    /// `tools` are the advertised tools; the mock backend uses them as
    /// call triggers.
    pub fn build(&self, tools: &[ToolDefinition]) -> AnyChatClient {
        match self {
            BackendConfig::OpenAI {
                api_key,
                model,
                base_url: Some(base_url),
            } => AnyChatClient::new_openai_with_base_url(api_key.clone(), model.clone(), base_url.clone()),
            BackendConfig::OpenAI { api_key, model, .. } => {
                AnyChatClient::new_openai(api_key.clone(), model.clone())
            }
            BackendConfig::Mock => AnyChatClient::new_mock(tools),
        }
    }
}

/// Settings read from the environment (and `.env`).
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub backend: BackendConfig,
    /// `None` runs without a tool provider.
    pub mcp: Option<McpConfig>,
    pub max_tool_iterations: usize,
    pub system_prompt_file: PathBuf,
    pub log_file: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match var("CHAT_BACKEND").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("openai") => BackendConfig::OpenAI {
                api_key: var("OPENAI_API_KEY").ok_or_else(|| {
                    anyhow!("OPENAI_API_KEY environment variable not set (or use CHAT_BACKEND=mock)")
                })?,
                model: var("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                base_url: var("OPENAI_BASE_URL"),
            },
            Some("mock") => BackendConfig::Mock,
            Some(other) => bail!("unknown CHAT_BACKEND '{}', expected 'openai' or 'mock'", other),
        };

        let mcp = match (var("MCP_CONFIG"), var("MCP_SERVER_COMMAND")) {
            (Some(path), _) => Some(McpConfig::from_file(Path::new(&path))?),
            (None, Some(command)) => {
                let args = var("MCP_SERVER_ARGS")
                    .map(|args| args.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default();
                Some(McpConfig::single(command, args))
            }
            (None, None) => None,
        };

        let max_tool_iterations = match var("MAX_TOOL_ITERATIONS") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("invalid MAX_TOOL_ITERATIONS '{}'", raw))?,
            None => DEFAULT_MAX_TOOL_ITERATIONS,
        };
        if max_tool_iterations == 0 {
            bail!("MAX_TOOL_ITERATIONS must be at least 1");
        }

        Ok(Self {
            backend,
            mcp,
            max_tool_iterations,
            system_prompt_file: var("SYSTEM_PROMPT_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("system_prompt.md")),
            log_file: var("CHAT_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("mcp-chat.log")),
        })
    }

    /// The system prompt, if the file exists.
    pub fn load_system_prompt(&self) -> Option<String> {
        match std::fs::read_to_string(&self.system_prompt_file) {
            Ok(prompt) if !prompt.trim().is_empty() => Some(prompt),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(
                    path = %self.system_prompt_file.display(),
                    "no system prompt loaded: {}",
                    e
                );
                None
            }
        }
    }
}
