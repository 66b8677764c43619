use crate::api::{ApiClient, ModelListSource};
use crate::config::{Config, SettingsStore, SETTINGS_KEY_MODEL};
use crate::mcp::{McpStatus, McpToolSource};
use crate::state::{
    summarize_tool_result, ChatError, ConversationManager, ConversationUpdate, SendOptions,
    TurnOutcome,
};
use crate::tools::{register_builtin_tools, ToolDispatcher};
use crate::types::{Role, ToolSource};
use anyhow::Result;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "chatloop=info";

/// One line of user input, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Clear,
    Models,
    Tools,
    Model(String),
    Mcp(Option<String>),
    Help,
    Quit,
    Unknown(String),
    Empty,
}

pub fn parse_command(line: &str) -> Command {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = trimmed.strip_prefix('/') else {
        return Command::Send(trimmed.to_string());
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    match name {
        "clear" => Command::Clear,
        "models" => Command::Models,
        "tools" => Command::Tools,
        "model" if !arg.is_empty() => Command::Model(arg.to_string()),
        "mcp" => Command::Mcp((!arg.is_empty() && arg != "off").then(|| arg.to_string())),
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(trimmed.to_string()),
    }
}

/// Install the stderr subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub struct App {
    config: Config,
    manager: Arc<ConversationManager>,
    mcp: McpToolSource,
    options: SendOptions,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let client = ApiClient::new(&config)?;
        let dispatcher = Arc::new(ToolDispatcher::new(config.tool_timeout()));
        register_builtin_tools(&dispatcher)?;

        let manager = ConversationManager::new(client, Arc::clone(&dispatcher))
            .with_max_tool_rounds(config.max_tool_rounds);
        let mcp = McpToolSource::new(dispatcher, config.mcp_transport);
        let mut options = SendOptions::new(config.model.clone());
        if let Some(prompt) = &config.system_prompt {
            options = options.with_system_prompt(prompt.clone());
        }

        Ok(Self {
            config,
            manager: Arc::new(manager),
            mcp,
            options,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        if let Some(url) = self.config.mcp_url.clone() {
            self.connect_mcp(Some(url)).await;
        }
        if !self.manager.client().has_api_key() {
            println!("No API key configured; set CHATLOOP_API_KEY to chat.");
        }
        println!(
            "{} ({}) - type /help for commands",
            self.config.app_title, self.options.model
        );

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            std::io::stdout().flush()?;
            let Some(line) = lines.next_line().await? else {
                break;
            };

            match parse_command(&line) {
                Command::Empty => {}
                Command::Quit => break,
                Command::Help => print_help(),
                Command::Clear => {
                    self.manager.clear_messages();
                    println!("[conversation cleared]");
                }
                Command::Models => self.print_models().await,
                Command::Tools => self.print_tools(),
                Command::Model(model) => self.switch_model(model)?,
                Command::Mcp(url) => self.connect_mcp(url).await,
                Command::Unknown(command) => println!("Unknown command: {command}"),
                Command::Send(text) => self.send(&text).await,
            }
        }

        self.mcp.disconnect();
        Ok(())
    }

    async fn send(&self, text: &str) {
        let (tx, rx) = mpsc::unbounded_channel();
        let printer = tokio::spawn(print_updates(rx));
        let result = self.manager.send_message(text, &self.options, Some(&tx)).await;
        drop(tx);
        let _ = printer.await;

        match result {
            Ok(TurnOutcome::Completed { .. }) => {}
            Ok(TurnOutcome::RoundLimitReached { rounds }) => {
                println!("[stopped after {rounds} tool rounds without a final answer]");
            }
            Err(ChatError::Cleared) => {}
            Err(error) => println!("[error] {error}"),
        }
    }

    async fn print_models(&self) {
        let list = self.manager.client().list_models().await;
        if list.source == ModelListSource::Fallback {
            println!("(default model list)");
        }
        for model in &list.models {
            let marker = if *model == self.options.model { "*" } else { " " };
            println!("{marker} {model}");
        }
    }

    fn print_tools(&self) {
        let definitions = self.manager.dispatcher().definitions();
        if definitions.is_empty() {
            println!("No tools available.");
        }
        for definition in definitions {
            let source = match definition.source {
                ToolSource::Local => "local",
                ToolSource::Remote => "remote",
            };
            println!(
                "{} [{source}] - {}",
                definition.name(),
                definition.function.description
            );
        }
        match self.mcp.status() {
            McpStatus::Disconnected => {}
            McpStatus::Connected { transport, tools } => {
                println!("MCP: connected via {transport} ({tools} tools)")
            }
            McpStatus::Error(error) => println!("MCP: {error}"),
        }
    }

    fn switch_model(&mut self, model: String) -> Result<()> {
        let mut settings = SettingsStore::open(&self.config.settings_path)?;
        settings.set(SETTINGS_KEY_MODEL, &model)?;
        println!("Model set to {model}");
        self.options.model = model;
        Ok(())
    }

    async fn connect_mcp(&mut self, url: Option<String>) {
        match self.mcp.set_url(url.as_deref()).await {
            McpStatus::Disconnected => println!("[mcp disconnected]"),
            McpStatus::Connected { transport, tools } => {
                println!("[mcp connected via {transport}: {tools} tools]")
            }
            McpStatus::Error(error) => {
                tracing::warn!(error = %error, "remote tool server unavailable");
                println!("[mcp unavailable: {error}]");
            }
        }
    }
}

async fn print_updates(mut rx: mpsc::UnboundedReceiver<ConversationUpdate>) {
    let mut printed = 0usize;
    let mut stdout = std::io::stdout();
    while let Some(update) = rx.recv().await {
        match update {
            ConversationUpdate::ContentDelta(text) => {
                // Content arrives accumulated; print only the unseen suffix.
                if let Some(suffix) = text.get(printed..) {
                    let _ = write!(stdout, "{suffix}");
                    let _ = stdout.flush();
                }
                printed = text.len();
            }
            ConversationUpdate::ToolCalls(calls) => {
                if printed > 0 {
                    println!();
                }
                printed = 0;
                for call in calls {
                    println!("[tool] {}({})", call.function.name, call.function.arguments);
                }
            }
            ConversationUpdate::ToolResults(results) => {
                for result in &results {
                    println!("[tool] {}", summarize_tool_result(result));
                }
            }
            ConversationUpdate::Messages(messages) => {
                // Fallback replies arrive without deltas; print what streaming missed.
                if let Some(last) = messages.last().filter(|m| m.tool_calls().is_empty()) {
                    if last.role() == Role::Assistant && last.content().len() > printed {
                        if let Some(suffix) = last.content().get(printed..) {
                            let _ = write!(stdout, "{suffix}");
                        }
                        printed = last.content().len();
                    }
                }
            }
            ConversationUpdate::Status(_)
            | ConversationUpdate::ToolCallProgress(_)
            | ConversationUpdate::RoundLimitReached { .. } => {}
        }
    }
    if printed > 0 {
        println!();
    }
}

fn print_help() {
    println!("/clear           reset the conversation");
    println!("/models          list available models");
    println!("/model <id>      switch model");
    println!("/tools           list local and remote tools");
    println!("/mcp <url|off>   connect or disconnect a remote tool server");
    println!("/quit            exit");
}
