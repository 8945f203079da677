//! Warden - command-line entry point
//!
//! Certificate and backup operations for platform tenants.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use warden::acme::{RegenerateOutcome, RenewOutcome};
use warden::{run_batch, BatchReport, Warden};
use warden_common::{logging, Fqdn, LogFormat};
use warden_config::Config;

/// Warden - certificate and backup management for platform tenants
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "WARDEN_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format, overriding the configured one
    #[arg(long = "log-format", global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Certificate operations
    #[command(subcommand)]
    Cert(CertCommand),

    /// Archive tenants into the backup directory
    Backup {
        /// Tenant hostnames
        #[arg(required = true)]
        fqdns: Vec<Fqdn>,
    },

    /// Restore a tenant from an archive
    Restore {
        /// Target hostname; may differ from the archived one
        fqdn: Fqdn,

        /// Archive to restore from
        archive: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum CertCommand {
    /// Issue certificates
    Issue {
        /// Tenant hostnames
        #[arg(required = true)]
        fqdns: Vec<Fqdn>,

        /// Application slugs to cover, instead of the installed ones
        #[arg(long = "app", value_name = "SLUG")]
        apps: Vec<String>,
    },

    /// Re-issue when installed applications changed
    Regenerate {
        #[arg(required = true)]
        fqdns: Vec<Fqdn>,
    },

    /// Renew certificates close to expiry
    Renew(Selection),

    /// Show stored certificates
    Status {
        /// Tenant hostnames; all stored certificates if omitted
        fqdns: Vec<Fqdn>,
    },

    /// Delete the ACME account and every stored certificate
    ResetAccount {
        /// Confirm the reset
        #[arg(long = "yes")]
        yes: bool,
    },
}

#[derive(Args, Debug)]
struct Selection {
    /// Tenant hostnames
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    fqdns: Vec<Fqdn>,

    /// Every tenant with a stored certificate
    #[arg(long = "all")]
    all: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config =
        Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config
        .validate()
        .context("Configuration validation failed")?;

    let format = cli.log_format.unwrap_or(config.logging.format);
    logging::init(&config.logging.level, cli.verbose, format);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(cli.command, config))
}

async fn run(command: Commands, config: Config) -> Result<ExitCode> {
    let warden = Warden::new(config).context("Failed to connect to the document store")?;

    match command {
        Commands::Cert(cert) => run_cert(&warden, cert).await,
        Commands::Backup { fqdns } => {
            let archiver = warden.archiver();
            let report = run_batch("backup", fqdns, |fqdn| {
                let archiver = &archiver;
                async move { archiver.backup(&fqdn).await }
            })
            .await;
            Ok(print_report(&report, |summary| {
                format!(
                    "{} ({} databases, {} documents, {} files)",
                    summary.path.display(),
                    summary.databases,
                    summary.documents,
                    summary.files
                )
            }))
        }
        Commands::Restore { fqdn, archive } => {
            let report = warden
                .restore_engine()
                .restore(&fqdn, &archive)
                .await
                .with_context(|| format!("Failed to restore {} from {}", fqdn, archive.display()))?;

            println!(
                "{}: restored {} databases, {} documents, {} files under prefix {}",
                report.fqdn, report.databases, report.documents, report.files, report.prefix
            );
            for rejected in &report.rejected {
                println!(
                    "  rejected {}/{}: {} ({})",
                    rejected.database,
                    rejected.failure.id,
                    rejected.failure.error,
                    rejected.failure.reason
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_cert(warden: &Warden, command: CertCommand) -> Result<ExitCode> {
    let manager = warden
        .certificate_manager()
        .context("Failed to open key material")?;

    match command {
        CertCommand::Issue { fqdns, apps } => {
            let apps: BTreeSet<String> = apps.into_iter().collect();
            let manager = &manager;
            let apps = &apps;
            let report = run_batch("issue", fqdns, |fqdn| async move {
                if apps.is_empty() {
                    manager.issue_for(&fqdn).await
                } else {
                    manager.issue(fqdn.slug(), fqdn.domain(), apps).await
                }
            })
            .await;
            Ok(print_report(&report, |info| {
                format!("issued, valid until {}", info.not_after)
            }))
        }
        CertCommand::Regenerate { fqdns } => {
            let manager = &manager;
            let report =
                run_batch("regenerate", fqdns, |fqdn| async move { manager.regenerate(&fqdn).await })
                    .await;
            Ok(print_report(&report, |outcome| match outcome {
                RegenerateOutcome::Unchanged => "unchanged".to_string(),
                RegenerateOutcome::Issued { names } => format!("issued for {} names", names.len()),
                RegenerateOutcome::Reissued { added, removed } => {
                    format!("reissued (+{:?} -{:?})", added, removed)
                }
            }))
        }
        CertCommand::Renew(selection) => {
            let report = if selection.all {
                manager.renew_all().await?
            } else {
                let manager = &manager;
                run_batch("renew", selection.fqdns, |fqdn| async move {
                    manager.renew(&fqdn).await
                })
                .await
            };
            Ok(print_report(&report, |outcome| match outcome {
                RenewOutcome::NoCertificate => "no certificate".to_string(),
                RenewOutcome::StillValid { remaining_days } => {
                    format!("still valid ({} days left)", remaining_days)
                }
                RenewOutcome::Renewed { not_after } => format!("renewed, valid until {}", not_after),
            }))
        }
        CertCommand::Status { fqdns } => {
            let fqdns = if fqdns.is_empty() {
                warden.key_store()?.list_certificates()?
            } else {
                fqdns
            };

            let mut missing = false;
            for fqdn in fqdns {
                match manager.status(&fqdn)? {
                    Some(status) => {
                        let names: Vec<&str> = status.info.names.iter().map(String::as_str).collect();
                        println!(
                            "{}\t{}\t{} days left{}\t{}",
                            status.fqdn,
                            status.info.not_after,
                            status.remaining_days,
                            if status.due_for_renewal { " (renewal due)" } else { "" },
                            names.join(",")
                        );
                    }
                    None => {
                        println!("{}\tno certificate", fqdn);
                        missing = true;
                    }
                }
            }
            Ok(if missing { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
        CertCommand::ResetAccount { yes } => {
            if !yes {
                bail!("resetting the account deletes every certificate; pass --yes to confirm");
            }
            let removed = warden.reset_account()?;
            info!(removed, "ACME account reset");
            println!("removed {} certificates", removed);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Print one line per tenant; failure exit code if any tenant failed
fn print_report<T>(report: &BatchReport<T>, render: impl Fn(&T) -> String) -> ExitCode {
    for (fqdn, value) in &report.succeeded {
        println!("{}: {}", fqdn, render(value));
    }
    for failure in &report.failed {
        println!("{}: FAILED [{}] {}", failure.fqdn, failure.kind, failure.message);
    }

    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
