//! Command-line host for the alarm engine.
//!
//! One-shot subcommands edit the alarm store and exit. `reveille run` is the
//! long-lived host: it reconciles, arms timers, prints alarms to stdout as
//! they fire, and reads commands such as `schedule`, `cancel` and `ack` from
//! stdin. While a host holds the store's lease, one-shot writes are refused:
//! their timers would die with the short-lived process.
//!
//! Tracing output goes to stderr so stdout stays readable.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use reveille::alarm::{
    AlarmEngine, AlarmPresenter, AlarmRecord, ChannelPresenter, Clock, HostLease,
    HostLeaseConfig, LeaseDecision, LogPresenter, PlanSlot, PresentationEvent, ReconcileReport,
    SystemClock, active_holder,
};
use reveille::ReveilleConfig;

/// Reveille: alarms that survive restarts and ring until acknowledged.
#[derive(Parser)]
#[command(name = "reveille", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the alarm database (overrides the config file).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Also write a daily rolling log file under `<data_dir>/logs`.
    #[arg(long)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Schedule (or replace) an alarm.
    Schedule {
        slot_id: String,
        /// RFC 3339 timestamp, epoch millis, or a relative offset like `+90`, `+15m`, `+2h`.
        at: String,
        #[arg(short, long, default_value = "")]
        title: String,
    },
    /// Cancel a pending alarm.
    Cancel { slot_id: String },
    /// Move a pending alarm to a new time.
    Reschedule { slot_id: String, at: String },
    /// List every stored alarm.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Acknowledge a delivered alarm.
    Ack { slot_id: String },
    /// Show the transition trail of a slot.
    History {
        slot_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Schedule every future entry of a JSON plan file.
    Import { plan: PathBuf },
    /// Run one reconcile pass (expire missed alarms, purge resolved ones).
    Reconcile,
    /// Remove acknowledged, cancelled and expired alarms.
    Purge,
    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Run the alarm host until interrupted.
    Run {
        /// Seconds between reconcile passes, to pick up alarms written by other processes.
        #[arg(long, default_value_t = 30)]
        reconcile_every: u64,
    },
}

impl Command {
    /// Commands that change the store or arm timers.
    fn writes_store(&self) -> bool {
        matches!(
            self,
            Self::Schedule { .. }
                | Self::Cancel { .. }
                | Self::Reschedule { .. }
                | Self::Ack { .. }
                | Self::Import { .. }
                | Self::Reconcile
                | Self::Purge
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(ReveilleConfig::default_config_path);
    let mut config = ReveilleConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(dir) = cli.data_dir {
        config.store.data_dir = Some(dir);
    }
    if cli.log_file {
        config.logging.to_file = true;
    }

    let _log_guard = init_tracing(&config);

    let clock = SystemClock;
    match cli.command {
        Command::InitConfig { force } => init_config(&config_path, force),
        Command::Run { reconcile_every } => {
            run_host(&config, Duration::from_secs(reconcile_every.max(1))).await
        }
        command => {
            if command.writes_store() {
                refuse_if_hosted(&config.store.resolved_data_dir(), clock.now_millis())?;
            }
            // Timers armed here die with the process; `reveille run` re-arms them.
            let (engine, _fired_rx) = AlarmEngine::open(&config, Arc::new(LogPresenter))?;
            run_once(&engine, command, clock.now_millis()).await
        }
    }
}

fn init_tracing(config: &ReveilleConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if !config.logging.to_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(config.store.logs_dir(), "reveille.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    Some(guard)
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    ReveilleConfig::default().save_to_file(path)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn refuse_if_hosted(data_dir: &Path, now: i64) -> anyhow::Result<()> {
    if let Some(holder) = active_holder(data_dir, now)? {
        bail!(
            "a reveille host (pid {}) owns {}; type the command into its console instead",
            holder.pid,
            data_dir.display()
        );
    }
    Ok(())
}

async fn run_once(engine: &AlarmEngine, command: Command, now: i64) -> anyhow::Result<()> {
    match command {
        Command::Schedule { slot_id, at, title } => {
            let fire_at = parse_fire_at(&at, now)?;
            let record = engine.schedule(&slot_id, &title, fire_at).await?;
            println!("scheduled {} at {}", record.slot_id, format_millis(record.fire_at));
        }
        Command::Cancel { slot_id } => {
            engine.cancel(&slot_id).await?;
            println!("cancelled {slot_id}");
        }
        Command::Reschedule { slot_id, at } => {
            let fire_at = parse_fire_at(&at, now)?;
            let record = engine.reschedule(&slot_id, fire_at).await?;
            println!("rescheduled {} to {}", record.slot_id, format_millis(record.fire_at));
        }
        Command::List { json } => {
            let records = engine.list_all()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_records(&records);
            }
        }
        Command::Ack { slot_id } => {
            engine.acknowledge(&slot_id).await?;
            println!("acknowledged {slot_id}");
        }
        Command::History { slot_id, json } => {
            let entries = engine.history(&slot_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for entry in entries {
                    let from = entry.from.map_or("-", |s| s.as_str());
                    println!("{}  {from} -> {}", format_millis(entry.at), entry.to);
                }
            }
        }
        Command::Import { plan } => {
            let raw = std::fs::read_to_string(&plan)
                .with_context(|| format!("reading {}", plan.display()))?;
            let slots: Vec<PlanSlot> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", plan.display()))?;
            let outcome = engine.schedule_plan(&slots).await;
            println!(
                "scheduled {}, skipped {} past, failed {}",
                outcome.scheduled.len(),
                outcome.skipped_past.len(),
                outcome.failed.len()
            );
            for (slot_id, e) in &outcome.failed {
                eprintln!("  {slot_id}: {e}");
            }
            if !outcome.is_clean() {
                bail!("{} plan slots failed", outcome.failed.len());
            }
        }
        Command::Reconcile => {
            let report = engine.reconcile().await?;
            print_report(&report);
            if !report.is_clean() {
                bail!("{} alarms could not be repaired", report.failures.len());
            }
        }
        Command::Purge => {
            let purged = engine.purge_resolved().await?;
            println!("purged {} alarms", purged.len());
        }
        Command::InitConfig { .. } | Command::Run { .. } => {
            bail!("command must not run through the one-shot path");
        }
    }
    Ok(())
}

async fn run_host(config: &ReveilleConfig, reconcile_every: Duration) -> anyhow::Result<()> {
    let clock = SystemClock;
    let lease = HostLease::new(&config.store.resolved_data_dir(), HostLeaseConfig::default());
    if let LeaseDecision::HeldElsewhere(holder) = lease.try_acquire_or_renew_at(clock.now_millis())? {
        bail!("another reveille host (pid {}) is already running", holder.pid);
    }

    let presenter = Arc::new(ChannelPresenter::new(config.alarm.presentation_buffer));
    let events = presenter.subscribe();
    let (engine, fired_rx) =
        AlarmEngine::open(config, Arc::clone(&presenter) as Arc<dyn AlarmPresenter>)?;
    let engine = Arc::new(engine);

    let printer = tokio::spawn(print_presentations(events));

    match engine.start().await {
        Ok(report) => print_report(&report),
        Err(e) => eprintln!("startup reconcile failed: {e}"),
    }
    let pump = engine.spawn_fire_pump(fired_rx);
    println!("reveille running; {INPUT_HELP}");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut ticker = tokio::time::interval(reconcile_every);
    ticker.tick().await;
    let mut heartbeat = tokio::time::interval(lease.heartbeat());
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = engine.reconcile().await {
                    tracing::warn!("periodic reconcile failed: {e}");
                }
            }
            _ = heartbeat.tick() => {
                match lease.try_acquire_or_renew_at(clock.now_millis()) {
                    Ok(LeaseDecision::Acquired { .. }) => {}
                    Ok(LeaseDecision::HeldElsewhere(holder)) => {
                        tracing::error!(pid = holder.pid, "host lease lost to another process");
                        break;
                    }
                    Err(e) => tracing::warn!("host lease renewal failed: {e}"),
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_input(&engine, line.trim(), clock.now_millis()).await {
                            break;
                        }
                    }
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        tracing::warn!("stdin read failed: {e}");
                        stdin_open = false;
                    }
                }
            }
        }
    }

    engine.shutdown();
    let _ = pump.await;
    printer.abort();
    if let Err(e) = lease.release() {
        tracing::warn!("host lease release failed: {e}");
    }
    Ok(())
}

const INPUT_HELP: &str = "commands: `schedule <slot> <at> [title]`, `reschedule <slot> <at>`, \
                          `cancel <slot>`, `ack <slot>`, `list`, `quit`";

/// Returns false when the host should exit.
async fn handle_input(engine: &AlarmEngine, line: &str, now: i64) -> bool {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return true;
    };
    if matches!(command, "quit" | "exit") {
        return false;
    }
    let args: Vec<&str> = parts.collect();
    if let Err(e) = apply_input(engine, command, &args, now).await {
        eprintln!("{command} failed: {e:#}");
    }
    true
}

async fn apply_input(
    engine: &AlarmEngine,
    command: &str,
    args: &[&str],
    now: i64,
) -> anyhow::Result<()> {
    match (command, args) {
        ("list", []) => print_records(&engine.list_all()?),
        ("ack", [slot_id]) => {
            engine.acknowledge(slot_id).await?;
            println!("acknowledged {slot_id}");
        }
        ("cancel", [slot_id]) => {
            engine.cancel(slot_id).await?;
            println!("cancelled {slot_id}");
        }
        ("schedule", [slot_id, at, title @ ..]) => {
            let fire_at = parse_fire_at(at, now)?;
            let record = engine.schedule(slot_id, &title.join(" "), fire_at).await?;
            println!("scheduled {} at {}", record.slot_id, format_millis(record.fire_at));
        }
        ("reschedule", [slot_id, at]) => {
            let fire_at = parse_fire_at(at, now)?;
            let record = engine.reschedule(slot_id, fire_at).await?;
            println!("rescheduled {} to {}", record.slot_id, format_millis(record.fire_at));
        }
        _ => return Err(anyhow!("unrecognized input; {INPUT_HELP}")),
    }
    Ok(())
}

async fn print_presentations(mut events: broadcast::Receiver<PresentationEvent>) {
    loop {
        match events.recv().await {
            Ok(PresentationEvent::Present { slot_id, title }) => {
                println!("\u{7}ALARM [{slot_id}] {title}  (type `ack {slot_id}` to dismiss)");
            }
            Ok(PresentationEvent::Dismiss { slot_id }) => println!("dismissed [{slot_id}]"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "presentation output lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_records(records: &[AlarmRecord]) {
    if records.is_empty() {
        println!("no alarms");
        return;
    }
    for record in records {
        println!(
            "{:<20} {:<12} {}  {}",
            record.slot_id,
            record.state,
            format_millis(record.fire_at),
            record.title
        );
    }
}

fn print_report(report: &ReconcileReport) {
    println!(
        "reconcile: {} re-armed, {} fired late, {} expired, {} redelivered, {} purged, {} failed",
        report.rearmed.len(),
        report.fired_late.len(),
        report.expired.len(),
        report.redelivered.len(),
        report.purged.len(),
        report.failures.len()
    );
    for failure in &report.failures {
        eprintln!("  {failure}");
    }
}

/// Parse an absolute or relative fire time into epoch millis.
fn parse_fire_at(raw: &str, now: i64) -> anyhow::Result<i64> {
    let raw = raw.trim();
    if let Some(offset) = raw.strip_prefix('+') {
        let (digits, unit_ms) = match offset.char_indices().last() {
            Some((i, 's')) => (&offset[..i], 1_000),
            Some((i, 'm')) => (&offset[..i], 60_000),
            Some((i, 'h')) => (&offset[..i], 3_600_000),
            _ => (offset, 1_000),
        };
        let amount: i64 = digits
            .parse()
            .with_context(|| format!("invalid relative time {raw:?}"))?;
        return Ok(now.saturating_add(amount.saturating_mul(unit_ms)));
    }
    if raw.chars().all(|c| c.is_ascii_digit()) && !raw.is_empty() {
        return raw
            .parse()
            .with_context(|| format!("invalid epoch millis {raw:?}"));
    }
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid time {raw:?}; expected RFC 3339, epoch millis, or +N[s|m|h]"))?;
    Ok(parsed.timestamp_millis())
}

fn format_millis(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.with_timezone(&Local).to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}
