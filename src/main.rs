use anyhow::{Context, Result};
use common::geo::GeoResolver;
use common::store::Store;
use detection::{DetectionEngine, Notifier, ViolationSink};
use session_tracker::adapters;
use session_tracker::{CachedGeoResolver, HouseholdLearner, NullGeoResolver, Poller, PollerConfig};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use storage::PgStore;
use streammon::{create_router, AppConfig, AppState};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CONNECTION_TEST_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_logging("streammon");

    let config = AppConfig::from_env()?;
    info!(bind = %config.bind_addr, interval = ?config.poll_interval, "starting streammon");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    let pg = PgStore::new(pool);
    pg.migrate().await?;
    let store: Arc<dyn Store> = Arc::new(pg);
    info!("database ready");

    // mmdb readers are wired in by the host deployment; without one,
    // geo-dependent rules skip.
    let inner_resolver: Arc<dyn GeoResolver> = match &config.geoip_db {
        Some(path) => {
            warn!(path = %path.display(), "GEOIP_DB set but no mmdb reader is linked; geographic rules will skip");
            Arc::new(NullGeoResolver)
        }
        None => {
            info!("no GeoIP database configured; geographic rules will skip");
            Arc::new(NullGeoResolver)
        }
    };
    let geo: Arc<dyn GeoResolver> = Arc::new(CachedGeoResolver::new(inner_resolver, store.clone()));

    let household = HouseholdLearner::new(
        store.clone(),
        geo.clone(),
        config.household_autolearn_min_sessions,
    );
    let poller = Arc::new(Poller::new(
        PollerConfig {
            poll_interval: config.poll_interval,
        },
        store.clone(),
        household,
    ));

    for backend in store.list_backends().await? {
        let adapter = adapters::build(&backend);
        match adapter.test_connection(CONNECTION_TEST_DEADLINE).await {
            Ok(()) => info!(backend = %backend.id, kind = %backend.kind, "backend connection verified"),
            Err(e) => warn!(
                backend = %backend.id,
                error = %e,
                "backend connection test failed; polling will keep trying"
            ),
        }
        poller.add_backend(backend.id.clone(), adapter).await;
    }

    let notifier = Arc::new(Notifier::new());
    let sink = ViolationSink::new(store.clone(), notifier);
    let engine = Arc::new(DetectionEngine::new(store.clone(), geo, sink));
    engine.reload_rules().await?;

    let shutdown = CancellationToken::new();

    let poller_task = tokio::spawn(poller.clone().run(shutdown.clone()));
    let engine_task = tokio::spawn(run_engine(
        engine.clone(),
        poller.subscribe(),
        shutdown.clone(),
    ));
    let completion_task = tokio::spawn(run_completions(
        engine,
        poller.clone(),
        poller.subscribe_completions(),
        shutdown.clone(),
    ));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let app = create_router(AppState {
        poller: poller.clone(),
        store: store.clone(),
    });
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .context("failed to bind listen address")?;
    info!(addr = %config.bind_addr, "status API listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("server error")?;

    // The poller finalizes every open viewing before returning.
    let _ = poller_task.await;
    let _ = engine_task.await;
    let _ = completion_task.await;
    info!("shutdown complete");

    Ok(())
}

async fn run_engine(
    engine: Arc<DetectionEngine>,
    mut snapshots: broadcast::Receiver<Arc<common::streams::Snapshot>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = snapshots.recv() => match received {
                Ok(snapshot) => engine.evaluate_snapshot(snapshot).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "rule engine lagged behind snapshots");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn run_completions(
    engine: Arc<DetectionEngine>,
    poller: Arc<Poller>,
    mut completions: broadcast::Receiver<Arc<common::history::WatchHistoryEntry>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = completions.recv() => match received {
                Ok(entry) => {
                    let snapshot = poller.current_snapshot().await;
                    engine.notify_session_ended(&entry, &snapshot).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "completion handler lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
