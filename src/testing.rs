//! Fakes shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{ChatError, Result};
use crate::function_calling::{FunctionCall, ToolDefinition, ToolProvider};

pub struct ScriptedToolProvider {
    tools: Vec<ToolDefinition>,
    list_error: Mutex<Option<ChatError>>,
    outcomes: Mutex<VecDeque<Result<String>>>,
    calls: Mutex<Vec<FunctionCall>>,
    list_calls: AtomicUsize,
    available: AtomicBool,
}

impl ScriptedToolProvider {
    pub fn new(tools: Vec<ToolDefinition>) -> Self {
        Self {
            tools,
            list_error: Mutex::new(None),
            outcomes: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// A tool taking an optional string `query`.
    pub fn tool(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: format!("{} tool", name),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" }
                }
            }),
        }
    }

    pub fn failing_list(self, err: ChatError) -> Self {
        *self.list_error.lock().unwrap() = Some(err);
        self
    }

    /// Queue the result of the next call. Unscripted calls succeed.
    pub fn push_outcome(&self, outcome: Result<String>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> Vec<FunctionCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolProvider for ScriptedToolProvider {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.list_error.lock().unwrap().take() {
            self.available.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, call: &FunctionCall) -> Result<String> {
        self.calls.lock().unwrap().push(call.clone());
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(format!("{} ok", call.name)));
        if let Err(ChatError::ToolProtocolError(_)) = &outcome {
            self.available.store(false, Ordering::SeqCst);
        }
        outcome
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}
