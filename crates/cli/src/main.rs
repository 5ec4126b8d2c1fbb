/*
 * SPDX-FileCopyrightText: 2024 DBVault Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! DBVault command-line interface
//!
//! One-shot backup and cleanup commands, a notification test, and the
//! daemon mode that runs the scheduler until terminated. Configuration is
//! loaded from a TOML file and handed to the core as a validated struct.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use dbvault_core::{
    BackupClass, LogSink, NotificationSink, Scheduler, SmtpSink, VaultConfig, VaultService,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dbvault", about = "Automated database backup orchestrator", version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one backup and exit; exit code 0 only on full success
    Run {
        /// Backup class to run
        #[arg(long, value_enum, default_value = "all")]
        class: ClassArg,
    },
    /// Enforce retention policies once and exit
    Cleanup,
    /// Run scheduled backups until terminated
    Daemon,
    /// Send a synthetic notification; exit code reflects delivery
    TestNotification,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClassArg {
    Daily,
    Weekly,
    Monthly,
    All,
}

impl ClassArg {
    fn classes(self) -> Vec<BackupClass> {
        match self {
            ClassArg::Daily => vec![BackupClass::Daily],
            ClassArg::Weekly => vec![BackupClass::Weekly],
            ClassArg::Monthly => vec![BackupClass::Monthly],
            ClassArg::All => BackupClass::ALL.to_vec(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(args: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&args.config)?;
    let sink = build_sink(&config)?;
    let service = Arc::new(VaultService::new(config, sink).await?);

    match args.command {
        Commands::Run { class } => run_once(&service, class.classes()).await,
        Commands::Cleanup => cleanup_once(&service).await,
        Commands::Daemon => daemon(service).await,
        Commands::TestNotification => {
            service.test_notification().await?;
            println!("Test notification delivered.");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<VaultConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;
    let config: VaultConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse configuration file {}", path.display()))?;
    Ok(config)
}

fn build_sink(config: &VaultConfig) -> anyhow::Result<Arc<dyn NotificationSink>> {
    if config.notification.enabled {
        let smtp = config
            .notification
            .smtp
            .as_ref()
            .context("notifications enabled but [notification.smtp] is missing")?;
        Ok(Arc::new(SmtpSink::new(smtp)?))
    } else {
        Ok(Arc::new(LogSink))
    }
}

async fn run_once(
    service: &VaultService,
    classes: Vec<BackupClass>,
) -> anyhow::Result<ExitCode> {
    let mut all_ok = true;
    for class in classes {
        let run = service.run_backup(class).await;
        match (&run.artifact, &run.error) {
            (Some(artifact), _) if run.succeeded() => {
                println!(
                    "{class} backup succeeded: {} ({} bytes)",
                    artifact.path.display(),
                    artifact.size_bytes
                );
            }
            (_, Some(err)) => {
                all_ok = false;
                eprintln!("{class} backup failed: {err}");
            }
            _ => {
                all_ok = false;
                eprintln!("{class} backup was skipped: another run of this class is active");
            }
        }
    }
    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cleanup_once(service: &VaultService) -> anyhow::Result<ExitCode> {
    let mut failed = 0;
    for (class, outcome) in service.cleanup().await {
        println!(
            "{class}: examined {}, deleted {}, failed {}",
            outcome.examined, outcome.deleted, outcome.failed
        );
        failed += outcome.failed;
    }
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn daemon(service: Arc<VaultService>) -> anyhow::Result<ExitCode> {
    let (tx, rx) = watch::channel(false);
    spawn_signal_listener(tx);
    Scheduler::new(service, rx)?.run().await?;
    Ok(ExitCode::SUCCESS)
}

/// Flip the shutdown flag on ctrl-c or SIGTERM
fn spawn_signal_listener(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut term) => {
                    term.recv().await;
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!(error = %err, "failed to listen for ctrl-c");
                }
            }
            _ = terminate => {}
        }
        info!("shutdown signal received");
        let _ = tx.send(true);
    });
}
