//! wisp: interactive SSH client and JSON-lines session engine.
//!
//! `wisp connect` runs one session on the local terminal. `wisp engine`
//! speaks the control-message protocol as JSON lines on stdin/stdout so
//! another process can play the terminal.

mod config;
mod terminal;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::CliConfig;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use wisp_session::gateway::json::serve_lines;
use wisp_session::{
    Engine, EngineInput, EngineOutput, Gateway, HostBridge, HostEvent, StartSessionArgs,
};

/// Exit code when the session ends without reporting one.
const EXIT_FAILURE: i32 = 255;

/// SSH client session engine.
#[derive(Parser, Debug)]
#[command(name = "wisp", version, about = "SSH client session engine")]
struct Cli {
    /// Config file path (default: ~/.config/wisp/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open an interactive session on this terminal
    Connect {
        /// Destination as [user@]host[:port]
        destination: String,

        /// Port to connect to
        #[arg(short, long)]
        port: Option<u16>,

        /// Login name
        #[arg(short, long)]
        login: Option<String>,

        /// Request compression
        #[arg(short = 'C')]
        compression: bool,

        /// WebSocket relay URL (ws:// or wss://)
        #[arg(long)]
        relay: Option<String>,
    },

    /// Serve control messages as JSON lines on stdin/stdout
    Engine,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("wisp: {:#}", e);
            exit_code_of(&e)
        }
    };
    std::process::exit(code);
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .init();
}

async fn run(cli: Cli) -> Result<i32> {
    let config = CliConfig::locate(cli.config.as_deref())?;

    match cli.command {
        Command::Connect {
            destination,
            port,
            login,
            compression,
            relay,
        } => {
            let login = login.or_else(|| {
                if destination.contains('@') {
                    None
                } else {
                    config.user.clone()
                }
            });
            let args = start_args(&destination, port, login.as_deref(), compression);
            connect(config, args, relay).await
        }
        Command::Engine => serve_engine(config).await,
    }
}

/// Builds `startSession` arguments from command-line flags.
fn start_args(
    destination: &str,
    port: Option<u16>,
    login: Option<&str>,
    compression: bool,
) -> StartSessionArgs {
    let mut arguments = Vec::new();
    if compression {
        arguments.push("-C".to_string());
    }
    if let Some(port) = port {
        arguments.push("-p".to_string());
        arguments.push(port.to_string());
    }
    if let Some(login) = login {
        arguments.push("-l".to_string());
        arguments.push(login.to_string());
    }
    arguments.push(destination.to_string());

    let mut args = StartSessionArgs {
        arguments,
        ..StartSessionArgs::default()
    };
    if let Ok(term) = std::env::var("TERM") {
        args.environment.insert("TERM".to_string(), term);
    }
    let (width, height) = terminal::size();
    args.terminal_width = width;
    args.terminal_height = height;
    args
}

async fn connect(config: CliConfig, args: StartSessionArgs, relay: Option<String>) -> Result<i32> {
    let mut client = config.client;
    if relay.is_some() {
        client.relay_url = relay;
    }
    client.validate().context("invalid connection settings")?;

    let pacing = client.write_pacing_bytes;
    let mut engine = Engine::new(client);
    let (engine_end, host_end) = Gateway::pair();
    let mut host = HostBridge::new(host_end).with_pacing_bytes(pacing);
    host.start_session(args)?;

    let guard = terminal::RawModeGuard::enter()?;
    let (report, code) = tokio::join!(engine.run_session(engine_end), relay_terminal(&mut host));
    drop(guard);

    let report = report?;
    info!(
        session = report.id,
        target = report.target.as_deref().unwrap_or("-"),
        exit_code = report.exit_code,
        "Session finished"
    );
    code
}

/// Copies engine output to the local terminal and keys back to the engine
/// until the session exits.
async fn relay_terminal(host: &mut HostBridge) -> Result<i32> {
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut resizes = terminal::Resizes::new()?;
    let mut buf = vec![0u8; 4096];
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = host.next_event() => match event {
                Some(HostEvent::Stdout(data)) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                Some(HostEvent::Stderr(data)) => {
                    stderr.write_all(&data).await?;
                    stderr.flush().await?;
                }
                Some(HostEvent::Log(line)) => {
                    stderr.write_all(format!("{}\r\n", line).as_bytes()).await?;
                }
                Some(HostEvent::Exit(code)) => return Ok(code),
                None => {
                    debug!("Engine went away without an exit");
                    return Ok(EXIT_FAILURE);
                }
            },
            read = stdin.read(&mut buf), if stdin_open => match read? {
                0 => {
                    debug!("Local input ended");
                    stdin_open = false;
                }
                n => host.send_input(buf[..n].to_vec())?,
            },
            Some((width, height)) = resizes.next() => host.resize(width, height)?,
        }
    }
}

async fn serve_engine(config: CliConfig) -> Result<i32> {
    let mut engine = Engine::new(config.client);
    let (engine_end, host_end) = Gateway::pair();

    let lines = serve_lines::<EngineOutput, EngineInput, _, _>(
        host_end,
        tokio::io::stdin(),
        tokio::io::stdout(),
    );
    let (reports, carried) = tokio::join!(engine.serve(engine_end), lines);
    carried.context("control stream failed")?;
    debug!(sessions = reports.len(), "Engine stopped");
    Ok(0)
}

fn exit_code_of(e: &anyhow::Error) -> i32 {
    e.chain()
        .find_map(|cause| cause.downcast_ref::<wisp_platform::WispError>())
        .map_or(EXIT_FAILURE, |e| e.exit_code())
}
