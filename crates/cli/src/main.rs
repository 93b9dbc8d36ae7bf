//! Operational tools.
//!
//! Each tool either appends events (visibility changes, recoveries, retries)
//! or resets bus infrastructure for a full replay. Exit codes: 0 success,
//! 1 usage error, 2 infrastructure error.

use clap::error::ErrorKind;
use clap::{ArgGroup, Parser, Subcommand};

use lifestream_core::SubjectId;
use lifestream_events::{LinkStatus, Visibility};
use lifestream_infra::admin::{self, AdminTarget, RetryFailedOptions};
use lifestream_infra::bus::RedisBus;
use lifestream_infra::{db, Config, PostgresLedger};

/// Life-stream operational tools.
#[derive(Parser, Debug)]
#[command(name = "lifestream")]
#[command(about = "Operational tools for the life-stream pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Change link visibility by emitting link.visibility_changed events.
    #[command(group(ArgGroup::new("target").required(true).args(["subject_id", "all"])))]
    SetVisibility {
        #[arg(long)]
        subject_id: Option<String>,

        /// Act on every link (optionally filtered by --status).
        #[arg(long)]
        all: bool,

        /// Only links currently in this status (with --all).
        #[arg(long)]
        status: Option<LinkStatus>,

        #[arg(long)]
        visibility: Visibility,

        /// List affected subjects without emitting anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Re-emit link.added for error links that exhausted their retries.
    RetryFailed {
        #[arg(long)]
        subject_id: Option<String>,

        /// Maximum number of links to act on.
        #[arg(long, default_value_t = 50)]
        limit: u32,

        /// Only links with at least this many recorded retries.
        #[arg(long, default_value_t = 3)]
        max_retries: u32,

        #[arg(long)]
        dry_run: bool,
    },

    /// Re-emit a synthetic enrichment.completed from projected metadata.
    #[command(group(ArgGroup::new("target").required(true).args(["subject_id", "all"])))]
    RecoverStuck {
        #[arg(long)]
        subject_id: Option<String>,

        #[arg(long)]
        all: bool,

        #[arg(long)]
        dry_run: bool,
    },

    /// Delete and recreate bus topics; clear idempotency ledger, consumer
    /// progress, and forwarded flags, enabling full replay.
    ResetBus,
}

#[tokio::main]
async fn main() {
    lifestream_observability::init("lifestream-cli");

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    match run(cli).await {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let pool = db::connect_pool(&config).await?;
    db::ensure_schema(&pool).await?;
    let ledger = PostgresLedger::new(pool.clone());

    match cli.command {
        Command::SetVisibility {
            subject_id,
            all: _,
            status,
            visibility,
            dry_run,
        } => {
            let target = target_from(subject_id, status);
            let affected =
                admin::set_visibility(&pool, &ledger, &target, visibility, dry_run).await?;
            print_affected("set-visibility", &affected, dry_run);
        }
        Command::RetryFailed {
            subject_id,
            limit,
            max_retries,
            dry_run,
        } => {
            let options = RetryFailedOptions {
                subject_id: subject_id.map(|s| SubjectId::from(s.as_str())),
                limit,
                max_retries,
            };
            let affected = admin::retry_failed(&pool, &ledger, &options, dry_run).await?;
            print_affected("retry-failed", &affected, dry_run);
        }
        Command::RecoverStuck {
            subject_id,
            all: _,
            dry_run,
        } => {
            let target = target_from(subject_id, None);
            let affected = admin::recover_stuck(&pool, &ledger, &target, dry_run).await?;
            print_affected("recover-stuck", &affected, dry_run);
        }
        Command::ResetBus => {
            let bus = RedisBus::connect(&config.bus_url).await?;
            let summary = admin::reset_bus(
                &pool,
                &bus,
                config.events_partitions,
                config.work_partitions,
            )
            .await?;
            println!(
                "reset-bus: {} streams deleted, {} events queued for re-forwarding",
                summary.streams_deleted, summary.events_reflagged
            );
        }
    }

    pool.close().await;
    Ok(())
}

fn target_from(subject_id: Option<String>, status: Option<LinkStatus>) -> AdminTarget {
    match subject_id {
        Some(id) => AdminTarget::Subject(SubjectId::from(id.as_str())),
        None => AdminTarget::All { status },
    }
}

fn print_affected(tool: &str, affected: &[SubjectId], dry_run: bool) {
    let prefix = if dry_run { "would affect" } else { "affected" };
    println!("{tool}: {prefix} {} subject(s)", affected.len());
    for subject in affected {
        println!("  {subject}");
    }
}
