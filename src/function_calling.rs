use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl FunctionResponse {
    pub fn success(call: &FunctionCall, content: impl Into<String>) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            content: content.into(),
            is_error: false,
        }
    }

    /// An error result that is handed back to the model instead of aborting the turn.
    pub fn error(call: &FunctionCall, reason: impl std::fmt::Display) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            content: format!("Error: {}", reason),
            is_error: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The external process that enumerates and executes tools.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Fetch the advertised tools.
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;

    /// Invoke a tool. `Ok` carries the tool's textual output.
    ///
    /// A tool that runs but reports failure yields
    /// [`ChatError::ToolInvocationFailure`]; a broken transport yields
    /// [`ChatError::ToolProtocolError`].
    async fn call_tool(&self, call: &FunctionCall) -> Result<String>;

    /// `false` once the provider hit a protocol error.
    fn is_available(&self) -> bool {
        true
    }
}

/// Check a requested call against the advertised tool list.
pub fn validate_call(tools: &[ToolDefinition], call: &FunctionCall) -> Result<()> {
    let invalid = |reason: String| ChatError::ToolInvocationFailure {
        tool: call.name.clone(),
        reason,
    };

    let tool = tools
        .iter()
        .find(|tool| tool.name == call.name)
        .ok_or_else(|| invalid("unknown tool".to_string()))?;

    let args = match &call.args {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => return check_required(tool, &serde_json::Map::new()).map_err(invalid),
        other => return Err(invalid(format!("arguments must be an object, got {}", json_type_name(other)))),
    };

    check_required(tool, args).map_err(invalid)?;

    if let Some(properties) = tool.parameters.get("properties").and_then(|p| p.as_object()) {
        for (key, value) in args {
            let expected = properties
                .get(key)
                .and_then(|schema| schema.get("type"))
                .and_then(|t| t.as_str());
            if let Some(expected) = expected {
                if !json_type_matches(expected, value) {
                    return Err(invalid(format!(
                        "parameter '{}' should be {}, got {}",
                        key,
                        expected,
                        json_type_name(value)
                    )));
                }
            }
        }
    }

    Ok(())
}

fn check_required(
    tool: &ToolDefinition,
    args: &serde_json::Map<String, serde_json::Value>,
) -> std::result::Result<(), String> {
    let required = tool
        .parameters
        .get("required")
        .and_then(|r| r.as_array())
        .map(|r| r.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>())
        .unwrap_or_default();

    match required.into_iter().find(|name| !args.contains_key(*name)) {
        Some(missing) => Err(format!("missing required parameter '{}'", missing)),
        None => Ok(()),
    }
}

fn json_type_matches(expected: &str, value: &serde_json::Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown or composite types are left to the tool itself.
        _ => true,
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
