use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use desk_sentinel::activity::{SysfsPower, WorkSchedule};
use desk_sentinel::actuator::CommandLockActuator;
use desk_sentinel::config::Config;
use desk_sentinel::monitor::PostureMonitor;
use desk_sentinel::notify::{LogNotifier, NotificationSink};
use desk_sentinel::presence::PresenceLockTimer;
use desk_sentinel::source::{JsonLinesSource, PoseSource};
use desk_sentinel::store::{JsonlSessionStore, SessionStore};

/// Posture and presence monitor fed with pose landmarks, one JSON frame per
/// line on stdin.
#[derive(Parser)]
#[command(name = "desk-sentinel", version, about, long_about = None)]
struct Cli {
    /// Configuration file, written with defaults when missing
    #[arg(short, long, default_value = "sentinel.toml")]
    config: String,

    /// Session store path, overrides [store].path
    #[arg(long)]
    store: Option<PathBuf>,

    /// Enable auto-lock regardless of the config
    #[arg(long)]
    autolock: bool,

    /// Log filter, overrides log_level (RUST_LOG wins over both)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_create(&cli.config)?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(path) = cli.store {
        config.store.path = path;
    }
    if cli.autolock {
        config.autolock.enabled = true;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(io::stderr))
        .init();

    tracing::info!(
        "Desk Sentinel v{} starting (fps={}, auto-lock={})",
        env!("CARGO_PKG_VERSION"),
        config.camera.fps,
        if config.autolock.enabled { "on" } else { "off" }
    );

    let store: Arc<dyn SessionStore> = Arc::new(
        JsonlSessionStore::open(&config.store.path)
            .with_context(|| format!("Failed to open store {}", config.store.path.display()))?,
    );
    let sink: Arc<dyn NotificationSink> = Arc::new(LogNotifier::new());
    let policy = WorkSchedule::new(&config.activity, Box::new(SysfsPower::default()));
    let presence = config.autolock.enabled.then(|| {
        PresenceLockTimer::new(
            Arc::new(CommandLockActuator::new(&config.autolock)),
            sink.clone(),
            config.autolock.settings(),
            true,
        )
    });

    let mut monitor = PostureMonitor::new(&config, store, Box::new(policy), sink, presence);
    let mut source = JsonLinesSource::new(io::stdin().lock());

    while let Some(frame) = source.next_frame() {
        if let Err(e) = monitor.process_frame(frame.as_deref(), Utc::now()) {
            tracing::warn!("Failed to persist session: {}", e);
        }
    }

    monitor
        .shutdown(Utc::now())
        .context("Failed to save the final session")?;

    let today = monitor.tracker().daily_summary(Local::now().date_naive())?;
    tracing::info!(
        "Today: {} sessions, {:.0} min worked, {} warnings, posture score {:.0}",
        today.summary.session_count,
        today.summary.total_work_secs / 60.0,
        today.summary.total_warnings,
        today.posture_score
    );
    Ok(())
}
