use std::future::ready;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use envconfig::Envconfig;
use health::HealthRegistry;

use probe_worker::config::{Cli, Config};
use probe_worker::error::WorkerError;
use probe_worker::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::init_from_env().expect("invalid configuration");

    let liveness = HealthRegistry::new("liveness");

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get({
            let liveness = liveness.clone();
            move || ready(liveness.get_status())
        }))
        .route("/_liveness", get({
            let liveness = liveness.clone();
            move || ready(liveness.get_status())
        }));
    let router = router.merge(probe_common::metrics::setup_metrics_router());
    let bind = config.metrics_bind();
    tokio::task::spawn(async move {
        probe_common::metrics::serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let orchestrator = match Orchestrator::startup(&cli.config, &liveness, &config).await {
        Ok(orchestrator) => orchestrator,
        Err(error) => {
            eprintln!("failed to start: {error}");
            std::process::exit(1);
        }
    };

    if cli.once {
        orchestrator.run_once().await;
    } else {
        orchestrator.run_until_signal().await;
    }

    Ok(())
}

async fn index() -> &'static str {
    "probe-worker"
}
