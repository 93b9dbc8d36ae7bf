//! Pipeline daemon: one long-running component per process.
//!
//! Each subcommand owns a single responsibility; parallelism comes from
//! running more processes against more partitions. All components share the
//! graceful-shutdown contract: stop intake on SIGINT/SIGTERM, finish the
//! in-flight unit, then exit within the hard deadline.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use lifestream_infra::bus::RedisBus;
use lifestream_infra::materializer::{Materializer, MaterializerConfig};
use lifestream_infra::outbox::{BusEventSink, OutboxConfig, OutboxForwarder};
use lifestream_infra::router::{PgProjectionReads, Router, RouterConfig};
use lifestream_infra::shutdown;
use lifestream_infra::workers::enricher::{Enricher, HttpModelClient};
use lifestream_infra::workers::fetcher::Fetcher;
use lifestream_infra::workers::publisher::Publisher;
use lifestream_infra::workers::{WorkerConfig, WorkerLoop};
use lifestream_infra::{db, Config, PostgresLedger};

/// Life-stream pipeline daemon.
#[derive(Parser, Debug)]
#[command(name = "lifestream-daemon")]
#[command(about = "Event pipeline components (outbox, router, materializer, workers)")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    component: Component,
}

#[derive(Subcommand, Debug)]
enum Component {
    /// Forward unforwarded ledger events to the bus.
    Outbox,
    /// Turn facts into work commands; handle retries and dead-letters.
    Router,
    /// Project facts into the domain state tables.
    Materializer,
    /// Fetch worker (URL → content.fetched).
    FetchWorker,
    /// Enrich worker (content → enrichment.completed).
    EnrichWorker,
    /// Publish worker (enrichment → publish.completed).
    PublishWorker,
}

#[tokio::main]
async fn main() {
    lifestream_observability::init("lifestream-daemon");

    let args = Args::parse();
    if let Err(err) = run(args).await {
        tracing::error!(error = %format!("{err:#}"), "daemon failed");
        std::process::exit(2);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = Config::from_env().context("configuration")?;
    let pool = db::connect_pool(&config).await.context("database")?;
    db::ensure_schema(&pool).await.context("schema bootstrap")?;
    let bus = RedisBus::connect(&config.bus_url).await.context("bus")?;

    let shutdown = shutdown::signal_listener();

    let outcome = match args.component {
        Component::Outbox => {
            let forwarder = OutboxForwarder::new(
                PostgresLedger::new(pool.clone()),
                BusEventSink::new(bus, config.events_partitions),
                OutboxConfig {
                    batch_size: config.outbox_batch_size,
                    poll_interval: config.outbox_poll_interval,
                    max_consecutive_failures: config.outbox_max_consecutive_failures,
                },
            );
            shutdown::drain_with_deadline(shutdown.clone(), async move {
                forwarder.run(shutdown).await.map_err(anyhow::Error::from)
            })
            .await
        }
        Component::Router => {
            let router = Router::new(
                bus,
                PgProjectionReads::new(pool.clone()),
                RouterConfig {
                    events_partitions: config.events_partitions,
                    work_partitions: config.work_partitions,
                    work_retry: config.work_retry,
                    ..RouterConfig::default()
                },
            );
            shutdown::drain_with_deadline(shutdown.clone(), async move {
                router.run(shutdown).await.map_err(anyhow::Error::from)
            })
            .await
        }
        Component::Materializer => {
            let materializer = Materializer::new(
                pool.clone(),
                bus,
                MaterializerConfig {
                    partitions: config.events_partitions,
                    ..MaterializerConfig::default()
                },
            );
            shutdown::drain_with_deadline(shutdown.clone(), async move {
                materializer.run(shutdown).await.map_err(anyhow::Error::from)
            })
            .await
        }
        Component::FetchWorker => {
            let fetcher = Fetcher::new(config.fetch_timeout, config.fetch_min_host_interval)
                .context("fetch client")?;
            let worker = WorkerLoop::new(
                bus,
                fetcher,
                PostgresLedger::new(pool.clone()),
                worker_config(&config),
            );
            shutdown::drain_with_deadline(shutdown.clone(), async move {
                worker.run(shutdown).await.map_err(anyhow::Error::from)
            })
            .await
        }
        Component::EnrichWorker => {
            let api_key = config.require_model_api_key().context("model access")?;
            let model = HttpModelClient::new(
                config.model.base_url.clone(),
                api_key,
                config.model.model_name.clone(),
                config.model.timeout,
            )
            .context("model client")?;
            let enricher = Enricher::new(
                model,
                RedisBus::connect(&config.bus_url).await.context("bus")?,
                config.enrich_truncate_chars,
                config.model.timeout,
            );
            let worker = WorkerLoop::new(
                bus,
                enricher,
                PostgresLedger::new(pool.clone()),
                worker_config(&config),
            );
            shutdown::drain_with_deadline(shutdown.clone(), async move {
                worker.run(shutdown).await.map_err(anyhow::Error::from)
            })
            .await
        }
        Component::PublishWorker => {
            let worker = WorkerLoop::new(
                bus,
                Publisher,
                PostgresLedger::new(pool.clone()),
                worker_config(&config),
            );
            shutdown::drain_with_deadline(shutdown.clone(), async move {
                worker.run(shutdown).await.map_err(anyhow::Error::from)
            })
            .await
        }
    };

    pool.close().await;

    match outcome {
        Some(result) => result,
        None => anyhow::bail!("component did not drain within the shutdown deadline"),
    }
}

fn worker_config(config: &Config) -> WorkerConfig {
    WorkerConfig {
        partitions: config.work_partitions,
        ..WorkerConfig::default()
    }
}
