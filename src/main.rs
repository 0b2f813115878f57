use agent_rpc::logging::{LogConfig, init_logging};
use agent_rpc::{AgentClient, ClientOptions, MessageOptions, SessionConfig};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Connect to an agent, report what it offers, and shut it down again
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Agent executable (overrides COPILOT_CLI_PATH)
    #[arg(long, value_name = "PATH")]
    cli_path: Option<String>,

    /// Connect to a running agent: PORT, HOST:PORT or URL
    #[arg(long, value_name = "URL", conflicts_with_all = ["cli_path", "tcp"])]
    cli_url: Option<String>,

    /// Spawn the agent in TCP mode instead of stdio
    #[arg(long)]
    tcp: bool,

    /// Port for TCP mode; 0 lets the agent choose
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Working directory for the spawned agent
    #[arg(long, value_name = "DIR")]
    cwd: Option<PathBuf>,

    /// Log level handed to the agent
    #[arg(long, default_value = "info")]
    agent_log_level: String,

    /// Open a session with this model and send PROMPT
    #[arg(long, value_name = "MODEL", requires = "prompt")]
    model: Option<String>,

    /// Prompt sent to the session opened with --model
    #[arg(long)]
    prompt: Option<String>,

    /// Seconds to wait for the session to go idle
    #[arg(long, default_value_t = 120)]
    timeout: u64,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides AGENT_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,
}

impl Args {
    fn client_options(&self) -> ClientOptions {
        ClientOptions {
            cli_path: self.cli_path.clone(),
            cli_url: self.cli_url.clone(),
            use_stdio: self.cli_url.is_none().then_some(!self.tcp),
            port: self.port,
            cwd: self.cwd.clone(),
            log_level: self.agent_log_level.clone(),
            auto_start: false,
            ..Default::default()
        }
    }
}

async fn probe(client: &AgentClient, args: &Args) -> agent_rpc::Result<()> {
    let pong = client.ping("probe").await?;
    println!("ping: {} (timestamp {})", pong.message, pong.timestamp);

    let status = client.get_status().await?;
    println!(
        "agent version {} (protocol {})",
        status.version, status.protocol_version
    );

    let auth = client.get_auth_status().await?;
    match (&auth.login, auth.is_authenticated) {
        (Some(login), true) => println!("authenticated as {login}"),
        (None, true) => println!("authenticated"),
        (_, false) => println!(
            "not authenticated{}",
            auth.status_message
                .as_deref()
                .map(|message| format!(": {message}"))
                .unwrap_or_default()
        ),
    }

    let models = client.list_models().await?;
    println!("{} model(s):", models.len());
    for model in &models {
        println!(
            "  {:<24} {} (context {} tokens)",
            model.id, model.name, model.capabilities.limits.max_context_window_tokens
        );
    }

    if let (Some(model), Some(prompt)) = (&args.model, &args.prompt) {
        let session = client
            .create_session(SessionConfig {
                model: Some(model.clone()),
                client_name: Some("agent-rpc".to_string()),
                ..Default::default()
            })
            .await?;
        println!("session {}", session.id());

        let reply = session
            .send_and_wait(
                MessageOptions::new(prompt.clone()),
                Duration::from_secs(args.timeout),
            )
            .await?;
        match reply.as_ref().and_then(|event| event.content()) {
            Some(content) => println!("{content}"),
            None => println!("(no assistant message)"),
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_config =
        LogConfig::from_env().with_overrides(args.log_level.clone(), args.log_file.clone());
    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let client = AgentClient::new(args.client_options())?;
    info!("Probing agent over {:?}", client.transport());

    if let Err(e) = client.start().await {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let outcome = probe(&client, &args).await;

    let cleanup = client.stop().await;
    for error in &cleanup {
        eprintln!("cleanup: {error}");
    }

    if let Err(e) = outcome {
        eprintln!("{e}");
        std::process::exit(1);
    }
    if !cleanup.is_empty() {
        std::process::exit(2);
    }
    Ok(())
}
