use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, Tool as McpTool},
    service::{Peer, RunningService, ServiceError},
    transport::{ConfigureCommandExt, TokioChildProcess},
    RoleClient, ServiceExt,
};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::ChatError;
use crate::function_calling::{FunctionCall, ToolDefinition, ToolProvider};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
    pub inputs: Option<Vec<McpInput>>,
    pub servers: HashMap<String, McpServerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpInput {
    #[serde(rename = "type")]
    pub input_type: String,
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub password: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl McpConfig {
    /// A config with one server named `default`.
    pub fn single(command: impl Into<String>, args: Vec<String>) -> Self {
        let server = McpServerConfig {
            command: command.into(),
            args,
            env: HashMap::new(),
        };
        Self {
            inputs: None,
            servers: HashMap::from([("default".to_string(), server)]),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read MCP config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid MCP config {}", path.display()))
    }

    /// Resolve `${input:<id>}` placeholders in a server's environment.
    ///
    /// Input values come from the upper-cased input id looked up through
    /// `lookup`; unresolved placeholders are left untouched.
    pub fn resolve_env<F>(&self, server: &McpServerConfig, lookup: F) -> HashMap<String, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut resolved_inputs = HashMap::new();
        for input in self.inputs.iter().flatten() {
            match lookup(&input.id.to_uppercase()) {
                Some(value) => {
                    resolved_inputs.insert(input.id.as_str(), value);
                }
                None => tracing::warn!(
                    "environment variable {} not found for input {}",
                    input.id.to_uppercase(),
                    input.id
                ),
            }
        }

        let mut env_vars = server.env.clone();
        for value in env_vars.values_mut() {
            let input_id = value
                .strip_prefix("${input:")
                .and_then(|rest| rest.strip_suffix('}'));
            if let Some(resolved) = input_id.and_then(|id| resolved_inputs.get(id)) {
                *value = resolved.clone();
            }
        }
        env_vars
    }
}

/// Tool provider backed by one or more MCP servers running as child
/// processes.
pub struct McpClientManager {
    clients: Mutex<HashMap<String, RunningService<RoleClient, ()>>>,
    routes: Mutex<HashMap<String, String>>, // tool_name -> server_name
    available: AtomicBool,
}

impl McpClientManager {
    /// Spawn every configured server and complete the MCP handshake.
    pub async fn connect(config: McpConfig) -> Result<Self> {
        let mut clients = HashMap::new();

        for (server_name, server_config) in &config.servers {
            tracing::info!(server = %server_name, command = %server_config.command, "starting MCP server");

            let env_vars = config.resolve_env(server_config, |key| std::env::var(key).ok());
            let transport = TokioChildProcess::new(Command::new(&server_config.command).configure(|cmd| {
                cmd.args(&server_config.args)
                    .envs(&env_vars)
                    .stderr(Stdio::inherit());
            }))
            .with_context(|| format!("failed to spawn MCP server {}", server_name))?;

            let client = ()
                .serve(transport)
                .await
                .with_context(|| format!("MCP handshake with {} failed", server_name))?;
            clients.insert(server_name.clone(), client);
        }

        Ok(Self {
            clients: Mutex::new(clients),
            routes: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        })
    }

    pub fn server_count(&self) -> usize {
        lock(&self.clients).len()
    }

    /// Stop every server. The manager is unavailable afterwards.
    pub async fn shutdown(&self) {
        self.available.store(false, Ordering::SeqCst);
        let clients: Vec<_> = lock(&self.clients).drain().collect();
        for (server_name, client) in clients {
            if let Err(e) = client.cancel().await {
                tracing::warn!(server = %server_name, "failed to stop MCP server: {}", e);
            }
        }
    }

    fn peers(&self) -> Vec<(String, Peer<RoleClient>)> {
        lock(&self.clients)
            .iter()
            .map(|(name, client)| (name.clone(), client.peer().clone()))
            .collect()
    }

    fn protocol_error(&self, server_name: &str, err: impl std::fmt::Display) -> ChatError {
        tracing::error!(server = %server_name, "MCP protocol failure, disabling tools: {}", err);
        self.available.store(false, Ordering::SeqCst);
        ChatError::ToolProtocolError(format!("{}: {}", server_name, err))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn to_definition(tool: &McpTool) -> ToolDefinition {
    let tool_name = tool.name.to_string();
    ToolDefinition {
        description: tool
            .description
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| format!("MCP tool: {}", tool_name)),
        parameters: serde_json::to_value(&tool.input_schema)
            .unwrap_or_else(|_| serde_json::json!({"type": "object"})),
        name: tool_name,
    }
}

/// Flatten MCP content blocks into the text handed to the model.
fn content_to_text(content: &serde_json::Value) -> String {
    let blocks = match content {
        serde_json::Value::Array(blocks) => blocks.as_slice(),
        serde_json::Value::Null => &[],
        other => return other.to_string(),
    };
    blocks
        .iter()
        .map(|block| match block.get("text").and_then(|t| t.as_str()) {
            Some(text) => text.to_string(),
            None => block.to_string(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl ToolProvider for McpClientManager {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ChatError> {
        let mut definitions = Vec::new();
        let mut routes = HashMap::new();

        let mut peers = self.peers();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        for (server_name, peer) in peers {
            let tools = peer
                .list_all_tools()
                .await
                .map_err(|e| self.protocol_error(&server_name, e))?;
            tracing::info!(server = %server_name, "found {} tools", tools.len());
            for tool in &tools {
                let definition = to_definition(tool);
                if routes.insert(definition.name.clone(), server_name.clone()).is_some() {
                    tracing::warn!(tool = %definition.name, "duplicate tool name, keeping the last server");
                    definitions.retain(|d: &ToolDefinition| d.name != definition.name);
                }
                definitions.push(definition);
            }
        }

        *lock(&self.routes) = routes;
        Ok(definitions)
    }

    async fn call_tool(&self, call: &FunctionCall) -> Result<String, ChatError> {
        if !self.is_available() {
            return Err(ChatError::ToolProtocolError("tool provider is unavailable".to_string()));
        }

        let server_name = lock(&self.routes).get(&call.name).cloned().ok_or_else(|| {
            ChatError::ToolInvocationFailure {
                tool: call.name.clone(),
                reason: "MCP tool not found".to_string(),
            }
        })?;
        let peer = self
            .peers()
            .into_iter()
            .find(|(name, _)| *name == server_name)
            .map(|(_, peer)| peer)
            .ok_or_else(|| ChatError::ToolProtocolError(format!("server {} is not running", server_name)))?;

        tracing::info!(tool = %call.name, server = %server_name, "executing MCP tool");

        // Convert args to the format expected by MCP
        let arguments = match &call.args {
            serde_json::Value::Object(map) => Some(map.clone()),
            _ => None,
        };

        let result = peer
            .call_tool(CallToolRequestParam {
                name: call.name.clone().into(),
                arguments,
            })
            .await
            .map_err(|e| match e {
                ServiceError::McpError(err) => ChatError::ToolInvocationFailure {
                    tool: call.name.clone(),
                    reason: err.message.to_string(),
                },
                other => self.protocol_error(&server_name, other),
            })?;

        let content = serde_json::to_value(&result.content)
            .map_err(|e| self.protocol_error(&server_name, e))?;
        let text = content_to_text(&content);

        if result.is_error.unwrap_or(false) {
            return Err(ChatError::ToolInvocationFailure {
                tool: call.name.clone(),
                reason: if text.is_empty() {
                    "tool execution failed".to_string()
                } else {
                    text
                },
            });
        }
        Ok(text)
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
