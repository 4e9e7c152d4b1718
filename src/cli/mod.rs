//! CLI interface for the conduit daemon.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fs2::FileExt;

use crate::config::{self, watcher, ResolvedConfig};
use crate::driver;
use crate::lifecycle::Lifecycle;
use crate::service::{Service, ServiceStatus};

/// Debounce applied to config file events
const WATCH_DEBOUNCE: Duration = Duration::from_millis(250);

/// Conduit - supervise feature drivers over framed pipes
#[derive(Parser)]
#[command(name = "conduit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Boot every configured feature and serve until interrupted
    Run {
        /// Config file (defaults to CONDUIT_CONFIG, then discovery)
        #[arg(short, long, env = "CONDUIT_CONFIG")]
        config: Option<PathBuf>,

        /// Do not reload when the config file changes
        #[arg(long)]
        no_watch: bool,
    },

    /// Validate the config and resolve every driver without starting it
    Check {
        #[arg(short, long, env = "CONDUIT_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Show the resolved configuration
    Config {
        #[arg(short, long, env = "CONDUIT_CONFIG")]
        config: Option<PathBuf>,
    },
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { config, no_watch } => run(config.as_deref(), !no_watch).await,
            Commands::Check { config } => check(config.as_deref()),
            Commands::Config { config } => show_config(config.as_deref()),
        }
    }
}

/// Take the per-service lock so two daemons never drive the same features
fn lock_service(cfg: &ResolvedConfig) -> Result<File> {
    std::fs::create_dir_all(&cfg.home)
        .with_context(|| format!("Failed to create home directory: {}", cfg.home.display()))?;

    let path = cfg.lock_path();
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

    file.try_lock_exclusive().with_context(|| {
        format!(
            "Service {} is already running (lock held on {})",
            cfg.service,
            path.display()
        )
    })?;
    Ok(file)
}

async fn run(explicit: Option<&Path>, watch: bool) -> Result<()> {
    let cfg = config::load(explicit)?;
    let plan = cfg.plan()?;
    let _lock = lock_service(&cfg)?;

    let service = Service::new(&cfg.service, cfg.settings(), Lifecycle::new());

    // the loop dispatches the alive signals boot waits for
    let mut serving = tokio::spawn({
        let service = service.clone();
        async move { service.run().await }
    });

    if let Err(e) = service.boot(plan).await {
        service.shutdown().await;
        let _ = serving.await;
        return Err(e).context("Boot failed");
    }
    print_status(&service.status());

    let watch_handle = if watch {
        let (changes, handle) = watcher::watch(&cfg.config_file, WATCH_DEBOUNCE)?;
        service
            .lifecycle()
            .spawn(follow_config(service.clone(), cfg.config_file.clone(), changes));
        Some(handle)
    } else {
        None
    };

    let result = tokio::select! {
        joined = &mut serving => match joined {
            Ok(result) => result.context("Service stopped"),
            Err(e) => Err(e).context("Service loop panicked"),
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
            Ok(())
        }
    };

    service.shutdown().await;
    if !serving.is_finished() {
        let _ = serving.await;
    }
    if let Some(handle) = watch_handle {
        handle.stop().await?;
    }
    print_status(&service.status());

    result
}

/// Re-plan and apply on every config change; bad edits are logged and
/// the running features are left alone
async fn follow_config(
    service: Arc<Service>,
    path: PathBuf,
    mut changes: tokio::sync::mpsc::Receiver<watcher::ConfigChange>,
) {
    let token = service.lifecycle().token();
    loop {
        let change = tokio::select! {
            _ = token.cancelled() => break,
            change = changes.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };

        let plan = match config::load(Some(&path)).and_then(|cfg| cfg.plan()) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(hash = %change.hash, error = %e, "ignoring invalid config");
                continue;
            }
        };

        let report = service.apply(plan).await;
        tracing::info!(
            hash = %change.hash,
            reloaded = report.reloaded.len(),
            failed = report.failed.len(),
            removed = report.removed.len(),
            "config applied"
        );
        for (feature, reason) in &report.failed {
            tracing::warn!(feature = %feature, reason = %reason, "feature failed to reload");
        }
    }
}

fn check(explicit: Option<&Path>) -> Result<()> {
    let cfg = config::load(explicit)?;
    let plan = cfg.plan()?;

    println!("Config: {}", cfg.config_file.display());
    println!("Service: {}", cfg.service);
    println!();

    let mut problems = 0;
    for spec in &plan.features {
        match driver::acquire(&spec.driver, &cfg.driver_dir) {
            Ok(path) => println!(
                "  ✓ {} -> {} ({})",
                spec.feature,
                spec.driver.name,
                path.display()
            ),
            Err(e) => {
                problems += 1;
                let marker = if spec.required { "required" } else { "optional" };
                println!("  ✗ {} -> {} [{}]: {}", spec.feature, spec.driver.name, marker, e);
            }
        }
    }

    println!();
    if problems > 0 {
        anyhow::bail!("{} feature(s) cannot be started", problems);
    }
    println!("{} feature(s) ok", plan.features.len());
    Ok(())
}

fn show_config(explicit: Option<&Path>) -> Result<()> {
    let cfg = config::load(explicit)?;

    println!("Config file: {}", cfg.config_file.display());
    println!();
    println!("Paths:");
    println!("  Home:       {}", cfg.home.display());
    println!("  Drivers:    {}", cfg.driver_dir.display());
    println!("  Lock file:  {}", cfg.lock_path().display());
    println!();
    print!("{}", serde_yaml::to_string(&cfg.file)?);

    Ok(())
}

fn print_status(status: &ServiceStatus) {
    println!(
        "Service: {} (instance {}, recoveries {})",
        status.service, status.instance, status.recoveries
    );
    if status.features.is_empty() {
        println!("  (no features)");
        return;
    }
    for feature in &status.features {
        let pid = feature
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<20} {:<16} {:<10} pid {:<8} gen {}",
            feature.feature, feature.driver, feature.state.as_str(), pid, feature.generation
        );
    }
}
