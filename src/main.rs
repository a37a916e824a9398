#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use backon::{ExponentialBuilder, Retryable};
use clap::Parser;
use dotenv::dotenv;
use tracing::{info, warn};

use ssh_chain::chain::config::{
    MAX_RETRY_DELAY, resolve_command_timeout, resolve_config_path, resolve_max_retries,
    resolve_poll_interval, resolve_retry_delay,
};
use ssh_chain::chain::{
    ChainError, ChainOrchestrator, ConfigStore, ErrorKind, TransportStrategyFactory,
};

/// Command-line arguments for ssh-chain.
///
/// # Examples
///
/// ```bash
/// # Run through the bastions configured for db-1
/// ssh-chain -H db-1 uptime
///
/// # Different inventory, longer command deadline, two retries
/// ssh-chain -c prod_hosts.json -t 120 --retries 2 -H app-1 "status --all"
///
/// # List configured hosts
/// ssh-chain --list
/// ```
#[derive(Parser, Debug)]
#[command(name = "ssh-chain")]
#[command(version)]
#[command(about = "Run a command on a host reached through a chain of SSH bastions")]
struct Cli {
    /// Target host name from the inventory.
    #[arg(short = 'H', long, value_name = "NAME", required_unless_present = "list")]
    host: Option<String>,

    /// Host inventory (JSON). Defaults to $SSH_CHAIN_CONFIG or ssh_hosts.json.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Seconds to wait for the command's output.
    #[arg(short, long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Retries of retryable failures (network errors, timeouts).
    #[arg(long, value_name = "N")]
    retries: Option<u32>,

    /// Initial delay between retries.
    #[arg(long, value_name = "MS")]
    retry_delay_ms: Option<u64>,

    /// List configured hosts and exit.
    #[arg(short, long)]
    list: bool,

    /// Command to run on the target.
    #[arg(trailing_var_arg = true, required_unless_present = "list")]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let cli = Cli::parse();
    let host = cli.host.clone();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let (salvaged, message) = failure_report(host.as_deref(), &e);
            if let Some(output) = salvaged {
                println!("{}", output);
            }
            eprintln!("{}", message);
            ExitCode::FAILURE
        }
    }
}

/// What a failed run prints: command output that still arrived (stdout) and
/// the error line (stderr).
///
/// Only a teardown failure carries output worth keeping; the command itself
/// completed.
fn failure_report(host: Option<&str>, e: &ChainError) -> (Option<String>, String) {
    let salvaged = match (e.kind(), e.partial_output()) {
        (ErrorKind::Teardown, Some(output)) => Some(match host {
            Some(host) => format!("[{}]\n{}", host, output),
            None => output.to_string(),
        }),
        _ => None,
    };
    (salvaged, format!("Error [{}]: {}", e.kind(), e))
}

async fn run(cli: Cli) -> Result<(), ChainError> {
    let config_path = resolve_config_path(cli.config);
    let store = ConfigStore::load(&config_path)?;

    if cli.list {
        for name in store.host_names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let Some(host) = cli.host else {
        return Err(ChainError::InvalidConfig("no target host given".to_string()));
    };
    let command = cli.command.join(" ");
    let timeout = resolve_command_timeout(cli.timeout);
    let max_retries = resolve_max_retries(cli.retries);
    let min_delay = resolve_retry_delay(cli.retry_delay_ms);

    let orchestrator = ChainOrchestrator::new(Arc::new(TransportStrategyFactory::russh(
        resolve_poll_interval(None),
    )));

    let backoff = ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(max_retries as usize)
        .with_jitter();

    let attempt_counter = AtomicU32::new(0);
    let output = (|| async {
        let attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
        if attempt > 0 {
            warn!("Retry attempt {} on {}", attempt, host);
        }
        orchestrator
            .run_command(&store, &host, &command, timeout)
            .await
    })
    .retry(backoff)
    .when(|e| {
        let retryable = e.is_retryable();
        if !retryable && max_retries > 0 {
            warn!("Not retrying {}: {}", host, e);
        }
        retryable
    })
    .notify(|err, dur| {
        warn!("Run on {} failed: {}. Retrying in {:?}", host, err, dur);
    })
    .await?;

    let retries = attempt_counter.load(Ordering::SeqCst).saturating_sub(1);
    if retries > 0 {
        info!("Succeeded after {} retry attempt(s)", retries);
    }

    println!("[{}]", host);
    println!("{}", output);
    Ok(())
}
