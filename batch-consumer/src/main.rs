use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use batch_consumer::app_context::AppContext;
use batch_consumer::config::Config;
use batch_consumer::server::{router, serve, setup_metrics_recorder, with_metrics_routes};
use batch_consumer::subscription::Receiver;

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown_signal() {
    let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(term) => term,
        Err(error) => {
            error!(%error, "failed to register SIGTERM handler, only handling ctrl-c");
            if let Err(error) = signal::ctrl_c().await {
                error!(%error, "failed to listen for ctrl-c");
            }
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => {},
        _ = signal::ctrl_c() => {},
    };

    info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_with_defaults().context("failed to load configuration from env")?;
    let recorder = setup_metrics_recorder().context("failed to install metrics recorder")?;
    let context = AppContext::new(&config).await?;

    let app = with_metrics_routes(
        router(context.liveness.clone(), context.readiness.clone()),
        recorder,
    );
    let bind = config.bind();
    let http_server = tokio::spawn(async move {
        if let Err(error) = serve(app, &bind).await {
            error!(%error, "http server failed");
        }
    });

    let stop_receiving = CancellationToken::new();
    tokio::spawn({
        let token = stop_receiving.clone();
        async move {
            shutdown_signal().await;
            token.cancel();
        }
    });

    let stop_flushing = CancellationToken::new();
    let flush_loop = tokio::spawn({
        let worker = context.worker.clone();
        let token = stop_flushing.clone();
        async move { worker.run(token).await }
    });

    let received = context
        .subscription
        .run(context.receiver.as_ref(), stop_receiving)
        .await;

    // Drain in dependency order: buffered records, then their retries, then the acks they settled
    stop_flushing.cancel();
    flush_loop.await.context("flush loop panicked")?;
    context.retry.close().await;
    if context.ledger.pending() > 0 {
        error!(pending = context.ledger.pending(), "exiting with unsettled records");
    }
    if let Err(error) = context.receiver.close().await {
        error!(%error, "failed to commit offsets on shutdown");
    }

    context.stop_probes();
    http_server.abort();
    info!("exiting");

    received.context("subscription stopped")
}
