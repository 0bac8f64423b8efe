//! CLI entry point for copytrade.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::warn;

use copytrade::audit::{self, AuditLog};
use copytrade::config::Config;
use copytrade::convert::QuoteSet;
use copytrade::reconcile;
use copytrade::retry::{Sleeper, ThreadSleeper, with_retry};
use copytrade::sequencer::Mode;
use copytrade::snapshot::{JsonSnapshotStore, SnapshotStore};
use copytrade::target::TargetFile;
use copytrade::watch::{Schedule, Watcher};
use copytrade::{ExecutionReport, Reconciler};
use copytrade_broker::Brokerage;
use copytrade_broker::paper::PaperBroker;

/// Exit code when any account's cycle aborted or recorded failures.
const EXIT_CYCLE_FAILED: i32 = 2;

#[derive(Parser)]
#[command(name = "copytrade")]
#[command(about = "Mirror a target allocation into brokerage accounts")]
#[command(version)]
struct Cli {
    /// Path to config.toml
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one reconciliation cycle per configured account
    Run {
        #[command(flatten)]
        mode: ModeFlags,

        /// Skip the confirmation prompt for LIVE runs (for automation/cron)
        #[arg(long)]
        force: bool,
    },

    /// Poll the target and reconcile whenever it changes
    Watch {
        #[command(flatten)]
        mode: ModeFlags,
    },

    /// Show dollar targets, share quantities and orders without trading
    Plan,

    /// Print the stored snapshot for each account
    Snapshot,

    /// Compare broker positions with the stored snapshot
    Drift,
}

#[derive(Args)]
struct ModeFlags {
    /// Compute and log orders without placing them
    #[arg(long, conflicts_with = "live")]
    dry_run: bool,

    /// Place real orders
    #[arg(long)]
    live: bool,
}

impl ModeFlags {
    fn mode_override(&self) -> Option<Mode> {
        match (self.dry_run, self.live) {
            (true, _) => Some(Mode::DryRun),
            (_, true) => Some(Mode::Live),
            _ => None,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Run { mode, force } => run(&config, mode.mode_override(), force),
        Command::Watch { mode } => watch(&config, mode.mode_override()),
        Command::Plan => plan(&config),
        Command::Snapshot => show_snapshots(&config),
        Command::Drift => show_drift(&config),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
    }
}

fn open_broker(config: &Config) -> Result<PaperBroker> {
    PaperBroker::open(&config.broker.paper_file).context("opening broker")
}

fn open_audit(config: &Config) -> Result<AuditLog> {
    let path = config.audit_path();
    AuditLog::open(&path).with_context(|| format!("opening audit log {}", path.display()))
}

fn run(config: &Config, mode_override: Option<Mode>, force: bool) -> Result<i32> {
    let settings = config.cycle_settings(mode_override);
    let broker = open_broker(config)?;
    let provider = TargetFile::new(&config.source.target_file);
    let store = JsonSnapshotStore::new(&config.snapshot.dir);
    let sleeper = ThreadSleeper;
    let mut audit = open_audit(config)?;
    let reconciler = Reconciler::new(&settings, &provider, &broker, &store, &sleeper);

    if settings.mode == Mode::Live && !force {
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(format!(
                "Place LIVE orders for {} account(s): {}?",
                config.accounts.ids.len(),
                config.accounts.ids.join(", ")
            ))
            .default(false)
            .interact()
            .context("confirmation prompt failed")?;

        audit.user_confirmed(&config.accounts.ids, confirmed)?;
        if !confirmed {
            println!("Aborted.");
            return Ok(0);
        }
    }

    let reports = audit::run_audited(
        &reconciler,
        &config.accounts.ids,
        settings.mode,
        &mut audit,
        &mut |report: &ExecutionReport| print!("{report}"),
    );
    let clean = reports.iter().all(ExecutionReport::is_clean);

    Ok(if clean { 0 } else { EXIT_CYCLE_FAILED })
}

fn watch(config: &Config, mode_override: Option<Mode>) -> Result<i32> {
    let settings = config.cycle_settings(mode_override);
    let broker = open_broker(config)?;
    let provider = TargetFile::new(&config.source.target_file);
    let store = JsonSnapshotStore::new(&config.snapshot.dir);
    let sleeper = ThreadSleeper;
    let mut audit = open_audit(config)?;
    let reconciler = Reconciler::new(&settings, &provider, &broker, &store, &sleeper);

    let schedule = Schedule {
        poll_interval: config.poll_interval(),
        change_wait: config.change_wait(),
    };
    println!(
        "Watching {} every {}s for {} account(s) [{}]",
        config.source.target_file.display(),
        schedule.poll_interval.as_secs(),
        config.accounts.ids.len(),
        settings.mode
    );

    let mut watcher = Watcher::new(&reconciler, &config.accounts.ids, schedule, &sleeper);
    watcher.run(None, &mut |report: &ExecutionReport| {
        if let Err(e) = audit.cycle_report(report) {
            warn!("failed to write audit event: {e}");
        }
    });
    Ok(0)
}

fn plan(config: &Config) -> Result<i32> {
    let settings = config.cycle_settings(Some(Mode::DryRun));
    let broker = open_broker(config)?;
    let provider = TargetFile::new(&config.source.target_file);
    let store = JsonSnapshotStore::new(&config.snapshot.dir);
    let sleeper = ThreadSleeper;
    let reconciler = Reconciler::new(&settings, &provider, &broker, &store, &sleeper);

    let mut code = 0;
    for account_id in &config.accounts.ids {
        match reconciler.plan(account_id) {
            Ok(plan) => println!("{plan}"),
            Err(e) => {
                eprintln!("{account_id}: {e}");
                code = EXIT_CYCLE_FAILED;
            }
        }
    }
    Ok(code)
}

fn show_snapshots(config: &Config) -> Result<i32> {
    let store = JsonSnapshotStore::new(&config.snapshot.dir);
    for account_id in &config.accounts.ids {
        match store.load(account_id)? {
            Some(snapshot) => println!("{snapshot}"),
            None => println!("{account_id}: no snapshot yet\n"),
        }
    }
    Ok(0)
}

fn show_drift(config: &Config) -> Result<i32> {
    let settings = config.cycle_settings(None);
    let broker = open_broker(config)?;
    let store = JsonSnapshotStore::new(&config.snapshot.dir);
    let sleeper: &dyn Sleeper = &ThreadSleeper;

    for account_id in &config.accounts.ids {
        let expected = store
            .load(account_id)?
            .map(|s| s.quantities)
            .unwrap_or_default();
        let positions = with_retry(&settings.retry, sleeper, "positions", || {
            broker.positions(account_id)
        })
        .with_context(|| format!("{account_id}: fetching positions"))?;

        let mut symbols: Vec<_> = expected.iter().map(|(sym, _)| sym.clone()).collect();
        for p in &positions {
            if !symbols.contains(&p.symbol) {
                symbols.push(p.symbol.clone());
            }
        }
        let quotes: QuoteSet = with_retry(&settings.retry, sleeper, "quotes", || {
            broker.quotes(&symbols)
        })
        .with_context(|| format!("{account_id}: fetching quotes"))?
        .into();

        println!(
            "{}",
            reconcile::drift(account_id, &positions, &expected, &quotes)
        );
    }
    Ok(0)
}
