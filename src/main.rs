use std::sync::Arc;

use refbuild::config::Config;
use refbuild::enqueue::Enqueuer;
use refbuild::github::GitHubClient;
use refbuild::pipeline::BuildPipeline;
use refbuild::runner::{Runner, Scheduler};
use refbuild::server::{AppState, build_router};
use refbuild::store::Store;
use refbuild::sync::Reconciler;
use refbuild::webhooks::WebhookIngester;
use refbuild::workspace::WorkspaceManager;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "refbuild=debug,axum=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "Fatal error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    if config.github_token.is_none() {
        warn!("GITHUB_TOKEN not set; reconciliation will be skipped");
    }
    if config.webhook_secret.is_none() {
        warn!("GITHUB_WEBHOOK_SECRET not set; webhooks will be ignored");
    }

    let store = Store::open(&config.state_dir)?;
    info!(dir = %config.state_dir.display(), "Opened store");

    let source = Arc::new(GitHubClient::from_token(config.github_token.as_deref())?);
    let enqueuer = Enqueuer::new(store.clone(), config.build_cooldown);
    let reconciler = Arc::new(Reconciler::new(
        enqueuer.clone(),
        source,
        config.artifacts_dir.clone(),
    ));

    let pipeline = BuildPipeline::new(
        store.clone(),
        config.artifacts_dir.clone(),
        config.compile_timeout,
        config.binary_extension.clone(),
    );
    let runner = Arc::new(Runner::new(
        store.clone(),
        WorkspaceManager::new(config.workdir.clone()),
        pipeline,
    ));
    let scheduler = Scheduler::new(runner, reconciler.clone(), config.scheduler());
    scheduler.start().await;

    let ingester = WebhookIngester::new(enqueuer, config.webhook_secret.clone());
    let app = build_router(AppState::new(store, ingester, reconciler));

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!("listening on {}", config.listen_addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    scheduler.stop().await;
    info!("Shut down");
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
