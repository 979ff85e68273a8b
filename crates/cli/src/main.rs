mod config;
mod error;
mod logging;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use mcp::{Handlers, Session, SessionOptions};
use runtime::{Conversation, ToolOutcome, Transcript, call_tool_direct};
use serde_json::Value;
use tracing::info;

use config::{Config, ConfigError, ServerConfig, ServerEndpoint};
use error::{Error, Result};

#[derive(Parser)]
#[command(name = "purser")]
#[command(about = "Chat with a model that calls tools on an MCP server", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./purser.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at info level and forward server logs to the terminal
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    server: ServerArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Default)]
struct ServerArgs {
    /// Spawn an MCP server and talk to it over stdio
    #[arg(long, global = true, value_name = "COMMAND")]
    stdio: Option<String>,

    /// Argument for the --stdio command (repeatable)
    #[arg(long = "arg", global = true, value_name = "ARG", allow_hyphen_values = true)]
    stdio_args: Vec<String>,

    /// Connect to a streamable HTTP MCP endpoint
    #[arg(long, global = true)]
    url: Option<String>,

    /// Extra HTTP header for --url (repeatable)
    #[arg(long = "header", global = true, value_name = "KEY=VALUE", value_parser = parse_header)]
    headers: Vec<(String, String)>,
}

impl ServerArgs {
    /// Flags take precedence over the `[server]` table.
    fn endpoint(&self, config: &ServerConfig) -> std::result::Result<ServerEndpoint, ConfigError> {
        match (&self.stdio, &self.url) {
            (Some(_), Some(_)) => Err(ConfigError::Invalid(
                "--stdio and --url are mutually exclusive".into(),
            )),
            (Some(command), None) => Ok(ServerEndpoint::Stdio {
                command: command.clone(),
                args: self.stdio_args.clone(),
                env: config.env.clone(),
            }),
            (None, Some(url)) => {
                let mut headers = config.headers.clone();
                headers.extend(self.headers.iter().cloned());
                Ok(ServerEndpoint::Http {
                    url: url.clone(),
                    headers,
                })
            }
            (None, None) => match config.endpoint()? {
                ServerEndpoint::Http { url, mut headers } => {
                    headers.extend(self.headers.iter().cloned());
                    Ok(ServerEndpoint::Http { url, headers })
                }
                stdio => Ok(stdio),
            },
        }
    }
}

fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty header name in '{raw}'"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session
    Chat,
    /// List the tools the server offers
    Tools,
    /// Call a tool directly, without the model
    Call {
        /// Tool name
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::discover(cli.config.as_deref())?;
    let _guard = logging::init(&config.logging, cli.verbose)?;

    let endpoint = cli.server.endpoint(&config.server)?;
    let options = config.chat.session_options(cli.verbose);

    match cli.command {
        Some(Commands::Chat) | None => cmd_chat(&config, &endpoint, options, cli.verbose).await,
        Some(Commands::Tools) => {
            let session = connect(&endpoint, options, cli.verbose).await?;
            let result = cmd_tools(&session).await;
            session.close().await;
            result
        }
        Some(Commands::Call { tool, args }) => {
            let arguments = parse_arguments(&args)?;
            let session = connect(&endpoint, options, cli.verbose).await?;
            let result = cmd_call(&session, &tool, arguments).await;
            session.close().await;
            result
        }
    }
}

async fn connect(
    endpoint: &ServerEndpoint,
    options: SessionOptions,
    verbose: bool,
) -> Result<Session> {
    info!(%endpoint, "connecting to MCP server");
    let pair = match endpoint {
        ServerEndpoint::Stdio { command, args, env } => {
            mcp::connect_stdio(command, args, env).await?
        }
        ServerEndpoint::Http { url, headers } => mcp::connect_streaming_http(url, headers).await?,
    };

    // Elicitation falls back to the terminal prompt.
    let mut handlers = Handlers::new();
    if verbose {
        handlers = handlers.with_log(|text| eprintln!("[server] {text}"));
    }

    Ok(Session::open(pair, handlers, options).await?)
}

async fn cmd_chat(
    config: &Config,
    endpoint: &ServerEndpoint,
    options: SessionOptions,
    verbose: bool,
) -> Result<()> {
    println!("purser v{}", env!("CARGO_PKG_VERSION"));

    let backend = config.build_backend(|var| std::env::var(var).ok())?;
    let model = backend.to_string();

    let session = connect(endpoint, options, verbose).await?;
    if let Some(server) = session.server_info() {
        println!(
            "Server: {} {}",
            server.server_info.name,
            server.server_info.version.as_deref().unwrap_or("")
        );
    }
    println!("Model: {model}");

    let result = chat_loop(config, backend, &session).await;
    session.close().await;
    println!("\nSession ended.");
    result
}

async fn chat_loop(
    config: &Config,
    backend: runtime::ProviderBackend,
    session: &Session,
) -> Result<()> {
    let tools = session.list_tools().await?;
    let names: Vec<&str> = tools.iter().map(|tool| tool.name.as_str()).collect();
    println!("Available tools: {}", names.join(", "));
    println!("Type 'quit' or Ctrl+D to exit.\n");

    let conversation = Conversation::new(backend)
        .with_system_prompt(&config.chat.system_prompt)
        .with_max_turns(config.chat.max_turns);
    let mut transcript = Transcript::new();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            // EOF
            break;
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if is_exit_command(input) {
            break;
        }

        match conversation.run(session, input, &mut transcript).await {
            Ok(response) => {
                println!("\n{response}\n");
            }
            Err(e) => {
                eprintln!("Error: {e}\n");
            }
        }
    }

    Ok(())
}

fn is_exit_command(input: &str) -> bool {
    input.eq_ignore_ascii_case("quit") || input.eq_ignore_ascii_case("exit")
}

async fn cmd_tools(session: &Session) -> Result<()> {
    let tools = session.list_tools().await?;

    if tools.is_empty() {
        println!("No tools offered.");
        return Ok(());
    }

    let width = tools.iter().map(|tool| tool.name.len()).max().unwrap_or(0);
    for tool in tools {
        let description = tool
            .description
            .as_deref()
            .and_then(|d| d.lines().next())
            .unwrap_or("");
        println!("{:<width$}  {description}", tool.name);
    }

    Ok(())
}

fn parse_arguments(raw: &str) -> Result<Value> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| Error::InvalidArguments(e.to_string()))?;
    if !value.is_object() {
        return Err(Error::InvalidArguments(format!(
            "expected a JSON object, got {raw}"
        )));
    }
    Ok(value)
}

async fn cmd_call(session: &Session, tool: &str, arguments: Value) -> Result<()> {
    match call_tool_direct(session, tool, arguments).await? {
        outcome @ ToolOutcome::Success(_) => {
            println!("{outcome}");
            Ok(())
        }
        ToolOutcome::Failure(reason) => Err(Error::ToolFailed {
            tool: tool.to_string(),
            reason,
        }),
    }
}
