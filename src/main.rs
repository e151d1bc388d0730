//! gift-hunter - Telegram premium-gift sniper over the Chrome DevTools Protocol.

mod catalog;
mod classify;
mod config;
mod cycle;
mod models;
mod notify;
mod purchase;
mod session;
mod store;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{expand_data_dir, Config, ConfigArgs, DEFAULT_DATA_DIR};
use crate::cycle::CancelFlag;
use crate::session::SessionDriver;

#[derive(Parser)]
#[command(name = "gift-hunter")]
#[command(about = "Hunts premium Telegram gifts by driving Telegram Web over CDP")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start hunting (daemonizes unless --foreground or --once)
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Run in foreground
        #[arg(short, long)]
        foreground: bool,

        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,

        /// Scan and classify but never buy, notify or touch the ledgers
        #[arg(long)]
        dry_run: bool,

        /// Run the browser in headed mode (visible)
        #[arg(long)]
        headed: bool,
    },

    /// Stop the hunting daemon
    Stop {
        /// Data directory holding the PID file
        #[arg(long, default_value = DEFAULT_DATA_DIR)]
        data_dir: String,
    },

    /// Check daemon status
    Status {
        /// Data directory holding the PID file
        #[arg(long, default_value = DEFAULT_DATA_DIR)]
        data_dir: String,
    },

    /// Open a headed browser, log in to Telegram Web and save the session
    Login {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            foreground,
            once,
            dry_run,
            headed,
        } => cmd_run(config, foreground, once, dry_run, !headed),
        Commands::Stop { data_dir } => cmd_stop(data_dir),
        Commands::Status { data_dir } => cmd_status(data_dir),
        Commands::Login { config } => cmd_login(config),
    }
}

fn init_logging() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(format!("gift_hunter={},chromiumoxide=warn", level))
        .init();
}

fn cmd_run(
    args: ConfigArgs,
    foreground: bool,
    once: bool,
    dry_run: bool,
    headless: bool,
) -> Result<()> {
    let cfg = Config::resolve(&args, headless, dry_run)?;

    if once || foreground {
        init_logging();
        let runtime = tokio::runtime::Runtime::new().context("Failed to create runtime")?;
        return if once {
            runtime.block_on(cycle::run_once(&cfg))
        } else {
            runtime.block_on(cycle::run_forever(&cfg, &CancelFlag::new()))
        };
    }

    println!("Starting gift-hunter daemon...");
    println!("Data dir: {}", cfg.data_dir.display());
    println!("Check interval: {:?}", cfg.check_interval);

    use daemonize::Daemonize;

    let daemonize = Daemonize::new()
        .pid_file(&cfg.pid_file)
        .working_directory("/tmp");

    match daemonize.start() {
        Ok(_) => {
            init_logging();
            let runtime = tokio::runtime::Runtime::new().context("Failed to create runtime")?;
            runtime.block_on(cycle::run_forever(&cfg, &CancelFlag::new()))?;
        }
        Err(e) => {
            eprintln!("Failed to daemonize: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn cmd_stop(data_dir: String) -> Result<()> {
    let pid_file = expand_data_dir(&data_dir).join("gift-hunter.pid");

    let pid_str = std::fs::read_to_string(&pid_file)
        .context("Failed to read PID file - daemon may not be running")?;
    let pid: i32 = pid_str.trim().parse().context("Invalid PID in file")?;

    println!("Stopping gift-hunter daemon (PID: {})...", pid);

    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }

    std::thread::sleep(std::time::Duration::from_millis(500));

    let _ = std::fs::remove_file(&pid_file);

    println!("Daemon stopped.");
    Ok(())
}

fn cmd_status(data_dir: String) -> Result<()> {
    let pid_file = expand_data_dir(&data_dir).join("gift-hunter.pid");

    if !pid_file.exists() {
        println!("Status: NOT RUNNING");
        println!("PID file {} does not exist", pid_file.display());
        return Ok(());
    }

    let pid_str = std::fs::read_to_string(&pid_file).context("Failed to read PID file")?;
    let pid: i32 = pid_str.trim().parse().context("Invalid PID in file")?;

    // Signal 0 probes for liveness without delivering anything.
    if unsafe { libc::kill(pid, 0) } == 0 {
        println!("Status: RUNNING");
        println!("PID: {}", pid);
    } else {
        println!("Status: NOT RUNNING");
        println!("Stale PID file for PID {}", pid);
    }

    Ok(())
}

fn cmd_login(args: ConfigArgs) -> Result<()> {
    let cfg = Config::resolve(&args, false, false)?;

    init_logging();
    let runtime = tokio::runtime::Runtime::new().context("Failed to create runtime")?;
    runtime.block_on(async {
        let driver = SessionDriver::launch(&cfg).await?;
        if let Err(e) = driver.restore_state(&cfg).await {
            tracing::debug!("Could not restore the previous session: {}", e);
        }
        driver.ensure_login(&cfg).await?;
        driver.save_state(&cfg).await?;
        driver.close().await
    })?;

    println!("Session saved to {}", cfg.session_state_file.display());
    Ok(())
}
