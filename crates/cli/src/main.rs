//! mirrad: wires the replication engine into a controller loop. The
//! controller serializes reconciles per source and re-enqueues every known
//! source when any namespace changes; the engine does the rest.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::Api,
    runtime::{
        controller::{Action, Controller},
        reflector::ObjectRef,
        watcher,
    },
    Client, ResourceExt,
};
use tracing::{error, info, warn};

use mirra_api::MirrorSource;
use mirra_engine::{Engine, EngineConfig, EngineError};
use mirra_kubehub::KubeStore;

#[derive(Parser, Debug)]
#[command(name = "mirrad", version, about = "Mirra namespace replication controller")]
struct Cli {
    /// Periodic resync interval
    #[arg(long = "sync-period-minutes", env = "MIRRA_SYNC_PERIOD_MINUTES", default_value_t = 10)]
    sync_period_minutes: u64,

    /// Retention window for the status error history
    #[arg(
        long = "error-retention-minutes",
        env = "MIRRA_ERROR_RETENTION_MINUTES",
        default_value_t = 15
    )]
    error_retention_minutes: u64,
}

struct Ctx {
    engine: Engine,
    sync_period: Duration,
}

fn init_tracing() {
    let env = std::env::var("MIRRA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MIRRA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MIRRA_METRICS_ADDR; expected host:port");
        }
    }
}

async fn reconcile(src: Arc<MirrorSource>, ctx: Arc<Ctx>) -> Result<Action, EngineError> {
    let outcome = ctx.engine.reconcile(&src.name_any()).await?;
    Ok(match outcome.requeue {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

fn error_policy(src: Arc<MirrorSource>, err: &EngineError, ctx: Arc<Ctx>) -> Action {
    if err.retryable() {
        warn!(source = %src.name_any(), error = %err, "reconcile failed, retrying shortly");
        Action::requeue(Duration::from_secs(30))
    } else {
        // Retrying a broken definition is useless until it is edited;
        // check back at the resync cadence anyway.
        warn!(source = %src.name_any(), error = %err, "definition rejected, waiting for an edit");
        Action::requeue(ctx.sync_period)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let cfg = EngineConfig {
        sync_period: Duration::from_secs(cli.sync_period_minutes * 60),
        error_retention: Duration::from_secs(cli.error_retention_minutes * 60),
    };

    let client = Client::try_default().await?;
    let store = Arc::new(KubeStore::new(client.clone()));
    let ctx = Arc::new(Ctx {
        engine: Engine::new(store, cfg.clone()),
        sync_period: cfg.sync_period,
    });

    let sources: Api<MirrorSource> = Api::all(client.clone());
    let namespaces: Api<Namespace> = Api::all(client);

    let controller = Controller::new(sources, watcher::Config::default());
    let reader = controller.store();

    info!(
        sync_period_minutes = cli.sync_period_minutes,
        error_retention_minutes = cli.error_retention_minutes,
        "mirrad starting"
    );

    controller
        .watches(namespaces, watcher::Config::default(), move |_ns| {
            // A namespace appeared, changed labels or is going away:
            // every known source needs a fresh look.
            reader
                .state()
                .into_iter()
                .map(|src| ObjectRef::from_obj(src.as_ref()))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((src, _)) => info!(source = %src.name, "reconciled"),
                Err(e) => error!(error = %e, "reconcile dispatch failed"),
            }
        })
        .await;

    info!("mirrad stopped");
    Ok(())
}
