//! tan-shell: run shell commands on a remote host through a ledger contract.
//!
//! # Modes
//!
//! ```text
//!   controller                          ledger                         server
//!   ┌──────────────────┐   stdin chunks  ┌────────┐  Stdin events   ┌──────────────────┐
//!   │ control / exec   │───────────────▶│Tanshell│───────────────▶│ listen           │
//!   │ CommandDispatcher│◀───────────────│contract│◀───────────────│ CommandListener  │
//!   └──────────────────┘ Stdout/Stderr   └────────┘  stdout/stderr  │ + ShellExecutor  │
//!                          events                     chunks       └──────────────────┘
//! ```

use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use tan_shell::blockchain::{TanshellTransport, Wallet};
use tan_shell::config::load_config;
use tan_shell::exec::ShellExecutor;
use tan_shell::lifecycle::signals::shutdown_on_signal;
use tan_shell::observability::{logging, metrics};
use tan_shell::protocol::{
    ClientId, CommandDispatcher, CommandListener, CommandOutput, DispatcherOptions,
    ListenerOptions, OutputStream, SubmitPolicy, TransactionSubmitter,
};
use tan_shell::Shutdown;

type BoxError = Box<dyn Error + Send + Sync>;

/// Time allowed for in-flight streams to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "tan-shell", version)]
#[command(about = "Remote shell over an append-only ledger", long_about = None)]
struct Cli {
    /// Config file (TOML, or JSON when it ends in .json)
    #[arg(short, long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute commands addressed to this identity
    Listen {
        /// Shell to run commands with (sh or bash)
        #[arg(long)]
        shell: Option<String>,
    },
    /// Interactive prompt sending each line to a server
    Control {
        /// Registry id of the target server
        #[arg(long)]
        client: u64,
    },
    /// Send one command and print its output
    Exec {
        /// Registry id of the target server
        #[arg(long)]
        client: u64,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    if let Commands::Listen { shell: Some(shell) } = &cli.command {
        config.executor.shell = shell.clone();
    }

    logging::init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tan-shell starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let shutdown = Shutdown::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let wallet = Wallet::load(&config.ledger)?;
    let transport = Arc::new(TanshellTransport::connect(&config.ledger, &wallet).await?);
    let submitter = Arc::new(
        TransactionSubmitter::new(transport, SubmitPolicy::from(&config), shutdown.child_token())
            .await?,
    );

    let result = match cli.command {
        Commands::Listen { .. } => {
            let executor = ShellExecutor::from_config(&config.executor)?;
            let listener = CommandListener::start(
                submitter,
                ListenerOptions::from(&config.protocol),
                &shutdown,
            )
            .await?;
            executor.serve(listener, &shutdown).await.map_err(BoxError::from)
        }
        Commands::Control { client } => {
            let dispatcher = CommandDispatcher::new(
                submitter,
                DispatcherOptions::from(&config.protocol),
                &shutdown,
            );
            control(&dispatcher, ClientId(client), &shutdown).await
        }
        Commands::Exec { client, command } => {
            let dispatcher = CommandDispatcher::new(
                submitter,
                DispatcherOptions::from(&config.protocol),
                &shutdown,
            );
            let output = dispatcher.write(ClientId(client), command.join(" ")).await?;
            relay(output).await
        }
    };

    shutdown.trigger();
    if tokio::time::timeout(DRAIN_TIMEOUT, shutdown.drain()).await.is_err() {
        tracing::warn!(remaining = shutdown.active_tasks(), "Shutdown drain timed out");
    }
    tracing::info!("Shutdown complete");
    result
}

/// Read commands from local stdin, one per line, until EOF or shutdown.
async fn control(
    dispatcher: &CommandDispatcher,
    client: ClientId,
    shutdown: &Shutdown,
) -> Result<(), BoxError> {
    let cancel = shutdown.token();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut prompt = tokio::io::stdout();

    loop {
        prompt.write_all(b"> ").await?;
        prompt.flush().await?;

        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let result = match dispatcher.write(client, line).await {
            Ok(output) => relay(output).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            if cancel.is_cancelled() {
                return Ok(());
            }
            eprintln!("error: {e}");
        }
    }
}

/// Copy both output streams of a command to the local stdout and stderr.
async fn relay(output: CommandOutput) -> Result<(), BoxError> {
    let (stdout, stderr) = tokio::join!(
        copy_stream(output.stdout, tokio::io::stdout()),
        copy_stream(output.stderr, tokio::io::stderr()),
    );
    stdout?;
    stderr
}

async fn copy_stream<W>(mut stream: OutputStream, mut out: W) -> Result<(), BoxError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = stream.next_chunk().await {
        out.write_all(&chunk?).await?;
        out.flush().await?;
    }
    Ok(())
}
