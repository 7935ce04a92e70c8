use anyhow::{bail, Result};
use clap::Parser;
use lib_engagement::loggers::setup_logging;
use lib_engagement::retrieve::RestEngagementApi;
use lib_engagement::transport::WsTransport;
use lib_engagement::{EngagementEngine, EngagementSnapshot, ResourceId};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

mod config;

const APP_NAME: &str = "engagement_monitor";
const START_RETRY_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();
    let _ = dotenvy::dotenv();

    let config = config::load_config(config::Config::parse())?;
    setup_logging(APP_NAME, &config.log_dir(), config.log_level())?;

    let engine_config = config.engine_config()?;
    log::info!("Monitoring hub {}", engine_config.hub_url());

    let transport = Arc::new(WsTransport::new(engine_config.clone())?);
    let api = Arc::new(RestEngagementApi::from_config(&engine_config)?);
    let engine = EngagementEngine::init(engine_config, transport, api);

    connect(&engine, config.start_attempts()).await?;

    let mut states = engine.watch_connection_state();
    let state_logger = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            log::info!("Connection state: {:?}", state);
        }
    });

    let resources: Vec<ResourceId> = config.resources().into_iter().map(ResourceId::from).collect();
    if resources.is_empty() {
        log::warn!("No resources configured; only the connection will be monitored");
    }

    let mut watchers = Vec::with_capacity(resources.len());
    for resource_id in &resources {
        watchers.push(engine.subscribe(resource_id, Arc::new(log_snapshot)));
        match engine.acquire_resource(resource_id).await {
            Ok(snapshot) => log_snapshot(&snapshot),
            Err(e) => log::warn!("{}", e),
        }
    }

    wait_for_shutdown().await;

    for resource_id in &resources {
        engine.release_resource(resource_id);
    }
    drop(watchers);
    engine.teardown().await;
    state_logger.abort();

    log::info!("Shutdown complete.");
    Ok(())
}

async fn connect(engine: &EngagementEngine, attempts: u32) -> Result<()> {
    for attempt in 1..=attempts {
        match engine.start().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!("Connection attempt {}/{} failed: {}", attempt, attempts, e);
                if attempt < attempts {
                    tokio::time::sleep(START_RETRY_DELAY).await;
                }
            }
        }
    }
    bail!("Could not connect to the hub after {} attempt(s)", attempts)
}

fn log_snapshot(snapshot: &EngagementSnapshot) {
    match &snapshot.state {
        Some(state) => log::info!(
            "{}: {} like(s), liked: {}, pending: {:?}, comments: {}",
            snapshot.resource_id,
            state.like_count,
            state.liked_by_current_user,
            snapshot.pending,
            snapshot.comments.len()
        ),
        None => log::info!(
            "{}: not loaded yet, comments: {}",
            snapshot.resource_id,
            snapshot.comments.len()
        ),
    }
}

async fn wait_for_shutdown() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}
