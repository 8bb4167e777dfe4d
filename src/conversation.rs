use std::io::Write;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::chat_client::{ChatClient, Message};
use crate::console::Console;
use crate::error::{ChatError, Result};
use crate::stats::StatsTracker;
use crate::tool_calling_client::{ResponseUpdate, ToolCallingClient};
use crate::tools::ToolRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingInput,
    Dispatching,
    Streaming,
    Displaying,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Stats,
    Quit,
    Prompt(String),
}

impl Command {
    /// `stats` and `quit` are matched case-insensitively; anything else,
    /// including an empty line, is a prompt for the model.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        match line.trim().to_lowercase().as_str() {
            "stats" => Command::Stats,
            "quit" => Command::Quit,
            _ => Command::Prompt(line.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub text: String,
    pub duration: Duration,
    pub tool_calls: usize,
    pub truncated: bool,
}

/// The read-eval-print loop. Owns the conversation history.
pub struct ConversationLoop<C, R, W: Write> {
    client: ToolCallingClient<C>,
    tools: ToolRegistry,
    stats: StatsTracker,
    history: Vec<Message>,
    system_prompt: Option<String>,
    input: R,
    console: Console<W>,
    state: LoopState,
}

impl<C, R, W> ConversationLoop<C, R, W>
where
    C: ChatClient + 'static,
    R: AsyncBufRead + Unpin,
    W: Write,
{
    pub fn new(
        client: ToolCallingClient<C>,
        tools: ToolRegistry,
        stats: StatsTracker,
        input: R,
        console: Console<W>,
    ) -> Self {
        Self {
            client,
            tools,
            stats,
            history: Vec::new(),
            system_prompt: None,
            input,
            console,
            state: LoopState::AwaitingInput,
        }
    }

    /// Sent ahead of the history on every request; never part of it.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn console(&self) -> &Console<W> {
        &self.console
    }

    pub fn stats(&self) -> &StatsTracker {
        &self.stats
    }

    pub fn client(&self) -> &ToolCallingClient<C> {
        &self.client
    }

    /// Run until `quit` or end of input. Only console write failures are
    /// returned; a failed turn is reported and the loop continues.
    pub async fn run(&mut self) -> Result<()> {
        while self.state != LoopState::Done {
            self.state = LoopState::AwaitingInput;
            match self.read_command().await {
                Command::Stats => self.display_stats()?,
                Command::Quit => {
                    self.display_stats()?;
                    self.state = LoopState::Done;
                }
                Command::Prompt(prompt) => match self.run_turn(prompt).await {
                    Ok(outcome) => tracing::info!(
                        duration_ms = outcome.duration.as_millis() as u64,
                        tool_calls = outcome.tool_calls,
                        truncated = outcome.truncated,
                        "turn completed"
                    ),
                    Err(ChatError::Console(e)) => return Err(ChatError::Console(e)),
                    Err(e) => {
                        tracing::warn!("turn aborted: {}", e);
                        self.console.error(&format!("Error: {}", e))?;
                    }
                },
            }
        }
        tracing::info!(turns = self.history.len() / 2, "conversation finished");
        Ok(())
    }

    async fn read_command(&mut self) -> Command {
        if let Err(e) = self.console.prompt() {
            tracing::warn!("failed to print prompt: {}", e);
        }

        let mut line = String::new();
        match self.input.read_line(&mut line).await {
            // End of input ends the session like `quit`.
            Ok(0) => Command::Quit,
            Ok(_) => Command::parse(&line),
            Err(e) => {
                tracing::warn!("{}", ChatError::InputReadFailure(e));
                Command::Quit
            }
        }
    }

    /// Answer one prompt. History is only extended when the turn succeeds.
    pub async fn run_turn(&mut self, prompt: String) -> Result<TurnOutcome> {
        self.state = LoopState::Dispatching;
        let result = self.dispatch(prompt).await;
        if result.is_err() {
            self.console.end_response()?;
        }
        self.state = LoopState::AwaitingInput;
        result
    }

    async fn dispatch(&mut self, prompt: String) -> Result<TurnOutcome> {
        let user = Message::user(prompt);
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if let Some(system_prompt) = &self.system_prompt {
            messages.push(Message::system(system_prompt.clone()));
        }
        messages.extend(self.history.iter().cloned());
        messages.push(user.clone());

        let started = Instant::now();
        let mut updates = self
            .client
            .get_streaming_response(messages, self.tools.definitions())
            .await?;

        self.state = LoopState::Streaming;
        let mut text = String::new();
        let mut tool_calls = 0;
        let mut truncated = false;
        while let Some(update) = updates.recv().await {
            match update? {
                ResponseUpdate::TextDelta(delta) => {
                    self.console.fragment(&delta)?;
                    text.push_str(&delta);
                }
                ResponseUpdate::ToolCallRequest(call) => {
                    tool_calls += 1;
                    self.console.tool_call(&call)?;
                }
                ResponseUpdate::ToolCallResult(response) => self.console.tool_result(&response)?,
                ResponseUpdate::Truncated { iterations } => {
                    truncated = true;
                    self.console.notice(&format!(
                        "stopped after {} tool rounds; the answer may be incomplete",
                        iterations
                    ))?;
                }
            }
        }
        let duration = started.elapsed();
        self.console.end_response()?;

        self.stats.record(duration);
        self.history.push(user);
        self.history.push(Message::assistant(text.clone()));

        Ok(TurnOutcome {
            text,
            duration,
            tool_calls,
            truncated,
        })
    }

    fn display_stats(&mut self) -> Result<()> {
        self.state = LoopState::Displaying;
        self.console.stats(&self.stats.summarize())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat_client::Role;
    use crate::mock_llm::MockLLMClient;
    use crate::testing::ScriptedToolProvider;
    use crate::tool_calling_client::FunctionInvocationOptions;
    use std::sync::Arc;
    use tokio::io::BufReader;

    type TestLoop = ConversationLoop<MockLLMClient, BufReader<&'static [u8]>, Vec<u8>>;

    fn conversation(mock: MockLLMClient, input: &'static str) -> TestLoop {
        ConversationLoop::new(
            ToolCallingClient::new(mock),
            ToolRegistry::default(),
            StatsTracker::new(),
            BufReader::new(input.as_bytes()),
            Console::plain(Vec::new()),
        )
    }

    fn output(conversation: &TestLoop) -> String {
        String::from_utf8(conversation.console().get_ref().clone()).unwrap()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("stats\n"), Command::Stats);
        assert_eq!(Command::parse("  STATS \r\n"), Command::Stats);
        assert_eq!(Command::parse("Quit"), Command::Quit);
        assert_eq!(Command::parse("\n"), Command::Prompt(String::new()));
        assert_eq!(
            Command::parse("show stats please\n"),
            Command::Prompt("show stats please".to_string())
        );
    }

    #[tokio::test]
    async fn test_hello_scenario() {
        let mock = MockLLMClient::new();
        mock.push_text(["hi ", "there"]);
        let mut conversation = conversation(mock, "hello\n");

        let outcome = conversation.run_turn("hello".to_string()).await.unwrap();

        assert_eq!(outcome.text, "hi there");
        assert_eq!(
            conversation.history(),
            &[Message::user("hello"), Message::assistant("hi there")]
        );
        assert_eq!(output(&conversation), "hi there\n");
        assert_eq!(conversation.stats().response_count(), 1);
        assert_eq!(conversation.state(), LoopState::AwaitingInput);
    }

    #[tokio::test]
    async fn test_history_grows_by_two_per_turn() {
        for turns in 0..4 {
            let mock = MockLLMClient::new();
            let mut conversation = conversation(mock, "");
            for i in 0..turns {
                conversation.run_turn(format!("message {}", i)).await.unwrap();
            }

            let history = conversation.history();
            assert_eq!(history.len(), 2 * turns);
            for (i, pair) in history.chunks(2).enumerate() {
                assert_eq!(pair[0], Message::user(format!("message {}", i)));
                assert_eq!(pair[1].role, Role::Assistant);
            }

            let report = conversation.stats().summarize();
            assert_eq!(report.count, turns);
        }
    }

    #[tokio::test]
    async fn test_full_session() {
        let mock = MockLLMClient::new();
        mock.push_text(["hi ", "there"]);
        let mut conversation = conversation(mock, "hello\nStats\nquit\nnever read\n");

        conversation.run().await.unwrap();

        assert_eq!(conversation.state(), LoopState::Done);
        assert_eq!(conversation.history().len(), 2);
        let text = output(&conversation);
        assert!(text.starts_with(">>> hi there\n>>> \n=== Session Statistics ==="));
        assert_eq!(text.matches("=== Session Statistics ===").count(), 2);
        assert_eq!(text.matches("Responses: 1").count(), 2);
        assert_eq!(conversation.client().inner().requests().len(), 1);
    }

    #[tokio::test]
    async fn test_stats_does_not_touch_history() {
        let mock = MockLLMClient::new();
        let mut conversation = conversation(mock, "stats\nSTATS\n");

        conversation.run().await.unwrap();

        assert!(conversation.history().is_empty());
        assert!(conversation.client().inner().requests().is_empty());
        // Two requested displays plus the final one on end of input.
        let text = output(&conversation);
        assert_eq!(text.matches("Responses: 0").count(), 3);
        assert!(!text.contains("Average"));
    }

    #[tokio::test]
    async fn test_quit_displays_stats_once() {
        let mock = MockLLMClient::new();
        let mut conversation = conversation(mock, "quit\n");

        conversation.run().await.unwrap();

        assert_eq!(output(&conversation).matches("=== Session Statistics ===").count(), 1);
        assert!(conversation.client().inner().requests().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_backend_leaves_history_unchanged() {
        let mock = MockLLMClient::new();
        mock.push_text(["first"]);
        mock.push_unreachable("connection refused");
        mock.push_text(["third"]);
        let mut conversation = conversation(mock, "one\ntwo\nthree\n");

        conversation.run().await.unwrap();

        let history = conversation.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[1].content, "first");
        assert_eq!(history[2], Message::user("three"));
        assert_eq!(history[3].content, "third");
        assert_eq!(conversation.stats().response_count(), 2);
        assert!(output(&conversation).contains("Error: model backend unreachable: connection refused"));

        // The retried prompt does not see the failed one.
        let requests = conversation.client().inner().requests();
        assert_eq!(requests[2].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_prompt_is_forwarded() {
        let mock = MockLLMClient::new();
        let mut conversation = conversation(mock, "\nquit\n");

        conversation.run().await.unwrap();

        let requests = conversation.client().inner().requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages, vec![Message::user("")]);
        assert_eq!(conversation.history().len(), 2);
    }

    #[tokio::test]
    async fn test_system_prompt_is_sent_but_not_stored() {
        let mock = MockLLMClient::new();
        let mut conversation = conversation(mock, "").with_system_prompt("Be brief.");

        conversation.run_turn("hi".to_string()).await.unwrap();

        let requests = conversation.client().inner().requests();
        assert_eq!(requests[0].messages[0], Message::system("Be brief."));
        assert_eq!(conversation.history().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_tools_is_not_an_error() {
        let provider = Arc::new(ScriptedToolProvider::new(vec![]));
        let tools = ToolRegistry::load(provider.as_ref()).await;
        let mock = MockLLMClient::new();
        mock.push_text(["no tools needed"]);

        let mut conversation = ConversationLoop::new(
            ToolCallingClient::new(mock).with_tool_provider(provider),
            tools,
            StatsTracker::new(),
            BufReader::new("".as_bytes()),
            Console::plain(Vec::new()),
        );
        let outcome = conversation.run_turn("hi".to_string()).await.unwrap();

        assert_eq!(outcome.text, "no tools needed");
        assert!(conversation.client().inner().requests()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn test_tool_turn_is_one_history_entry() {
        let provider = Arc::new(ScriptedToolProvider::new(vec![ScriptedToolProvider::tool("search")]));
        let tools = ToolRegistry::load(provider.as_ref()).await;
        let mock = MockLLMClient::new();
        mock.push_tool_call("Checking. ", "search", serde_json::json!({"query": "weather"}));
        mock.push_text(["Sunny."]);

        let stats = StatsTracker::new();
        let mut conversation = ConversationLoop::new(
            ToolCallingClient::new(mock)
                .with_tool_provider(provider)
                .with_stats(stats.clone()),
            tools,
            stats,
            BufReader::new("".as_bytes()),
            Console::plain(Vec::new()),
        );
        let outcome = conversation.run_turn("weather?".to_string()).await.unwrap();

        assert_eq!(outcome.text, "Checking. Sunny.");
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(conversation.history().len(), 2);
        assert_eq!(conversation.history()[1].content, "Checking. Sunny.");
        let text = String::from_utf8(conversation.console().get_ref().clone()).unwrap();
        assert!(text.contains("🔧 search("));
        assert_eq!(conversation.stats().summarize().tools[0].1.succeeded, 1);
    }

    #[tokio::test]
    async fn test_truncated_turn_keeps_partial_answer() {
        let provider = Arc::new(ScriptedToolProvider::new(vec![ScriptedToolProvider::tool("search")]));
        let tools = ToolRegistry::load(provider.as_ref()).await;
        let mock = MockLLMClient::new();
        for _ in 0..4 {
            mock.push_tool_call("More. ", "search", serde_json::json!({}));
        }

        let mut conversation = ConversationLoop::new(
            ToolCallingClient::new(mock)
                .with_tool_provider(Arc::clone(&provider) as Arc<dyn crate::function_calling::ToolProvider>)
                .with_options(FunctionInvocationOptions {
                    max_iterations: 1,
                    ..Default::default()
                }),
            tools,
            StatsTracker::new(),
            BufReader::new("".as_bytes()),
            Console::plain(Vec::new()),
        );
        let outcome = conversation.run_turn("loop".to_string()).await.unwrap();

        assert!(outcome.truncated);
        assert_eq!(outcome.text, "More. More. ");
        assert_eq!(provider.calls().len(), 1);
        assert_eq!(conversation.history().len(), 2);
        assert_eq!(conversation.stats().response_count(), 1);
    }

    #[tokio::test]
    async fn test_truncated_silent_turn_commits_an_answer() {
        let provider = Arc::new(ScriptedToolProvider::new(vec![ScriptedToolProvider::tool("search")]));
        let tools = ToolRegistry::load(provider.as_ref()).await;
        let mock = MockLLMClient::new();
        for _ in 0..5 {
            mock.push_tool_call("", "search", serde_json::json!({"query": "x"}));
        }

        let mut conversation = ConversationLoop::new(
            ToolCallingClient::new(mock)
                .with_tool_provider(Arc::clone(&provider) as Arc<dyn crate::function_calling::ToolProvider>)
                .with_options(FunctionInvocationOptions {
                    max_iterations: 2,
                    ..Default::default()
                }),
            tools,
            StatsTracker::new(),
            BufReader::new("".as_bytes()),
            Console::plain(Vec::new()),
        );
        let outcome = conversation.run_turn("loop".to_string()).await.unwrap();

        assert!(outcome.truncated);
        assert!(!outcome.text.is_empty());
        assert_eq!(conversation.history().len(), 2);
        assert_eq!(conversation.history()[1].role, Role::Assistant);
        assert!(!conversation.history()[1].content.is_empty());
    }
}
