//! audit-backfill CLI - per-tenant audit record backfill.

use audit_backfill::core::{RecordSource, SourceConnector, TenantQueue};
use audit_backfill::source::MysqlConnector;
use audit_backfill::{
    BackfillError, Config, MigrationQueueService, TenantDescriptor, TimeRangeCounter,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "audit-backfill")]
#[command(about = "Backfill historical audit records into the object store")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

/// Identifies one tenant, either from the config file or ad hoc.
#[derive(clap::Args)]
struct TenantArgs {
    /// Tenant routing key
    #[arg(long)]
    org: String,

    /// Tenant pod, when the org is not listed in the config
    #[arg(long, requires = "tenant_id")]
    pod: Option<String>,

    /// Tenant id, when the org is not listed in the config
    #[arg(long, requires = "pod")]
    tenant_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Backfill one tenant in this process
    Run {
        #[command(flatten)]
        tenant: TenantArgs,
    },

    /// Add tenants to the backfill queue
    Enqueue {
        /// Tenant routing keys listed in the config
        #[arg(long = "org", required = true, num_args = 1..)]
        orgs: Vec<String>,

        /// Stay and drain the queue until it is empty
        #[arg(long)]
        drain: bool,
    },

    /// Drain the backfill queue until it is empty
    Worker,

    /// Count source records in a time range
    Count {
        #[command(flatten)]
        tenant: TenantArgs,

        /// Inclusive start (RFC 3339)
        #[arg(long)]
        from: DateTime<Utc>,

        /// Exclusive end (RFC 3339)
        #[arg(long)]
        to: DateTime<Utc>,
    },

    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), BackfillError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    if let Commands::Validate = cli.command {
        println!(
            "Configuration is valid ({} tenants, sink: {}, queue: {})",
            config.tenants.len(),
            config.sink.r#type,
            config.queue.r#type
        );
        return Ok(());
    }

    let config = config.with_auto_tuning();
    let cancel_token = setup_signal_handler();

    match cli.command {
        Commands::Validate => unreachable!(), // Handled above

        Commands::Run { tenant } => {
            let tenant = resolve_tenant(&config, &tenant)?;
            // no lane: a re-queued tenant is left for the workers
            let service =
                MigrationQueueService::from_config_without_lane(&config, cancel_token).await?;
            let report = service.run_tenant(tenant).await?;

            if report.requeued {
                service.flush_requeues().await;
            }

            if cli.output_json {
                println!("{}", report.to_json()?);
            } else {
                println!("\nBackfill {}!", if report.complete { "completed" } else { "incomplete" });
                println!("  Run ID: {}", report.run_id);
                println!("  Tenant: {}@{}", report.org, report.pod);
                println!("  Earliest date: {}", report.earliest_date.date_naive());
                println!("  Duration: {:.2}s", report.duration_seconds);
                println!("  Days: {}/{} copied", report.days_copied, report.days_scanned);
                println!("  Created: {}", report.stats.newly_created_in_target);
                println!("  Already present: {}", report.stats.already_existed_in_target);
                println!("  Missing from source: {}", report.stats.missing_from_source);
                println!("  Exceptions: {}", report.stats.exceptions);
                if report.requeued {
                    println!("  Re-queued for another attempt");
                }
            }

            if report.cancelled {
                return Err(BackfillError::Cancelled);
            }
        }

        Commands::Enqueue { orgs, drain } => {
            let tenants = orgs
                .iter()
                .map(|org| {
                    config.tenant(org).cloned().ok_or_else(|| {
                        BackfillError::invalid_tenant(format!("org '{}' is not configured", org))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            if drain {
                let service = MigrationQueueService::from_config(&config, cancel_token.clone()).await?;
                for tenant in &tenants {
                    service.enqueue(tenant).await?;
                }
                drain_until_empty(&service, &cancel_token, cli.output_json).await?;
            } else {
                // producer only: no drain lane in this process
                let queue = audit_backfill::queue::from_config(&config.queue).await?;
                for tenant in &tenants {
                    tenant.validate()?;
                    if queue.add(&tenant.org).await? {
                        println!("Queued {}", tenant);
                    } else {
                        println!("Already queued {}", tenant);
                    }
                }
            }
        }

        Commands::Worker => {
            let service = MigrationQueueService::from_config(&config, cancel_token.clone()).await?;
            drain_until_empty(&service, &cancel_token, cli.output_json).await?;
        }

        Commands::Count { tenant, from, to } => {
            let tenant = resolve_tenant(&config, &tenant)?;
            let connector = MysqlConnector::new(config.source.clone(), &config.backfill);
            let source = connector.connect(&tenant).await?;
            let counter = TimeRangeCounter::new(source.clone(), config.backfill.epoch_floor);
            let count = counter.count(from, to).await;
            source.close().await;
            let count = count?;

            if cli.output_json {
                println!(
                    "{}",
                    serde_json::json!({ "org": tenant.org, "from": from, "to": to, "count": count })
                );
            } else {
                println!("{}: {} records in [{}, {})", tenant, count, from, to);
            }
        }
    }

    Ok(())
}

/// Drain passes until the queue is empty and no re-add is pending.
async fn drain_until_empty(
    service: &MigrationQueueService,
    cancel_token: &CancellationToken,
    output_json: bool,
) -> Result<(), BackfillError> {
    let mut total = audit_backfill::DrainSummary::default();

    loop {
        let pass = service.drain().await;
        total.popped += pass.popped;
        total.completed += pass.completed;
        total.incomplete += pass.incomplete;
        total.failed += pass.failed;
        total.skipped += pass.skipped;

        if cancel_token.is_cancelled() {
            let scheduled = service.scheduled_requeues();
            if scheduled > 0 {
                warn!(
                    "Shutting down with {} delayed re-queues pending, retry opportunities lost",
                    scheduled
                );
            }
            break;
        }

        if service.scheduled_requeues() > 0 {
            info!(
                "Waiting for {} delayed re-queues",
                service.scheduled_requeues()
            );
            tokio::select! {
                _ = service.flush_requeues() => {}
                _ = cancel_token.cancelled() => continue,
            }
        }

        if service.pending().await? == 0 && service.scheduled_requeues() == 0 {
            break;
        }
    }

    if output_json {
        println!("{}", serde_json::to_string_pretty(&total)?);
    } else {
        println!("\nDrain finished");
        println!("  Tenants: {}", total.popped);
        println!("  Complete: {}", total.completed);
        println!("  Incomplete: {}", total.incomplete);
        println!("  Failed: {}", total.failed);
        println!("  Skipped: {}", total.skipped);
    }

    if cancel_token.is_cancelled() {
        return Err(BackfillError::Cancelled);
    }
    Ok(())
}

fn resolve_tenant(config: &Config, args: &TenantArgs) -> Result<TenantDescriptor, BackfillError> {
    let tenant = match (config.tenant(&args.org), &args.pod, &args.tenant_id) {
        (_, Some(pod), Some(tenant_id)) => TenantDescriptor::new(&args.org, pod, tenant_id),
        (Some(tenant), _, _) => tenant.clone(),
        (None, _, _) => {
            return Err(BackfillError::invalid_tenant(format!(
                "org '{}' is not configured; pass --pod and --tenant-id",
                args.org
            )))
        }
    };
    tenant.validate()?;
    Ok(tenant)
}

/// `RUST_LOG` overrides `--verbosity` when set.
fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to install {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!("\nReceived {}. Finishing in-flight windows and shutting down...", name);
            token.cancel();
        });
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl-C handler: {}", e);
            return;
        }
        eprintln!("\nReceived Ctrl-C. Finishing in-flight windows and shutting down...");
        token.cancel();
    });

    cancel_token
}
