//! fwsentry - Firewall state reconciliation daemon
//!
//! Installs the rules that route new connections into the decision queue,
//! keeps them installed while running, and removes them on exit.
//!
//! # Usage
//!
//! ```bash
//! fwsentry run                          # Install rules and watch for drift
//! fwsentry run --queue-num 2 --debug    # Custom queue, verbose logging
//! fwsentry run --config ./system-fw.json --no-ipv6
//! fwsentry clean --queue-num 2          # Remove stale rules after a crash
//! fwsentry status                       # Are the rules loaded?
//! ```
//!
//! # Exit Status
//!
//! `run` exits with failure when interception could not be set up, either
//! at startup or during a later reinstall. Everything installed so far is
//! removed first.

use clap::{Parser, Subcommand};
use fwsentry::config::FileConfig;
use fwsentry::core::controller::{Controller, ControllerOptions};
use fwsentry::core::error::{Error, IptablesErrorPattern};
use fwsentry::core::executor::IptablesExecutor;
use fwsentry::core::rules::DEFAULT_QUEUE_NUM;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{Level, error, info, warn};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "fwsentry", version = build::PKG_VERSION)]
#[command(about = "Keeps application firewall interception rules installed", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// System rule configuration file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Only manage IPv4 rules, even when IPv6 is available
    #[arg(long, global = true)]
    no_ipv6: bool,

    /// Verbose logging, including cleanup errors
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Install the rules and keep them installed until interrupted
    Run {
        /// Decision queue the redirect rules point at
        #[arg(short, long, default_value_t = DEFAULT_QUEUE_NUM)]
        queue_num: u16,
    },
    /// Remove every rule and chain this tool may have left behind
    Clean {
        /// Decision queue the stale redirect rules point at
        #[arg(short, long, default_value_t = DEFAULT_QUEUE_NUM)]
        queue_num: u16,
    },
    /// Report whether the baseline rules are currently loaded
    Status,
}

fn init_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if !nix::unistd::getuid().is_root() {
        warn!("Not running as root; iptables calls will likely fail");
    }

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn controller(cli: &Cli, queue_num: u16) -> Controller<IptablesExecutor> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| fwsentry::utils::default_config_path(nix::unistd::getuid().is_root()));
    info!("Using configuration {}", path.display());

    let mut options = ControllerOptions {
        queue_num,
        ..ControllerOptions::default()
    };
    if cli.no_ipv6 {
        options.ipv6 = false;
    }
    if !options.ipv6 {
        info!("IPv6 rules disabled");
    }

    Controller::new(IptablesExecutor::new(), Arc::new(FileConfig::new(path)), options)
}

async fn handle_cli(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Run { queue_num } => run(&controller(&cli, queue_num)).await,
        Commands::Clean { queue_num } => {
            controller(&cli, queue_num).clean_rules(true).await;
            println!("Firewall rules removed.");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status => {
            let ctl = controller(&cli, DEFAULT_QUEUE_NUM);
            println!("fwsentry {} ({})", build::PKG_VERSION, build::SHORT_COMMIT);
            if ctl.are_rules_loaded().await {
                println!("Firewall rules: loaded");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("Firewall rules: not loaded");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

async fn run(ctl: &Controller<IptablesExecutor>) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut fatal = ctl
        .fatal_events()
        .await
        .ok_or("fatal event receiver already taken")?;
    let mut sigterm = signal(SignalKind::terminate())?;

    if let Err(e) = ctl.init(None).await {
        report_fatal(&e);
        ctl.clean_rules(true).await;
        return Ok(ExitCode::FAILURE);
    }

    let code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, removing firewall rules");
            ExitCode::SUCCESS
        }
        _ = sigterm.recv() => {
            info!("Terminated, removing firewall rules");
            ExitCode::SUCCESS
        }
        Some(e) = fatal.recv() => {
            report_fatal(&e);
            ExitCode::FAILURE
        }
    };

    ctl.stop(None).await;
    Ok(code)
}

fn report_fatal(e: &Error) {
    error!("{e}");
    if let Some(message) = e.executor_message() {
        let translation = IptablesErrorPattern::match_error(message);
        error!("{}", translation.user_message);
        for suggestion in &translation.suggestions {
            info!("  • {suggestion}");
        }
    }
}
