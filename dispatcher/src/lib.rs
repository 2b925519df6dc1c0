//! Dispatcher Service
//!
//! Pulls queued jobs out of Redis, paces and routes each recipient to a
//! sticky session queue, and lets one consumer per connected WhatsApp
//! session hand tasks off to the orchestrator without tripping its
//! per-session rate limits.
//!
//! ## Architecture
//!
//! ```text
//! gateway:jobs / queue:priority
//!   ↓ (IntakeLoop)
//! queue:session:<phone>
//!   ↓ (one consumer per connected session)
//! Orchestrator outbox
//! ```
//!
//! SmartGuard ticks independently, narrowing or widening each session's RPM
//! within its trust-policy ceiling. A control HTTP API exposes health,
//! queue depth, live pacer state and incident history, and can start/stop
//! the dispatch loops without restarting the process.

use dispatcher_config::{DispatcherConfig, Environment, FromEnv};
use dispatcher_core::api::{self, AppState};
use dispatcher_core::incidents::IncidentSink;
use dispatcher_core::intake::IntakeLoop;
use dispatcher_core::kv::KvClient;
use dispatcher_core::orchestrator::OrchestratorClient;
use dispatcher_core::router::Router;
use dispatcher_core::session::{SessionDeps, SessionRuntime};
use dispatcher_core::smartguard::{self, SmartGuard};
use eyre::{Result, WrapErr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Run the dispatcher.
///
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Initializes Prometheus metrics
/// 3. Connects to Redis with retry logic
/// 4. Starts the intake loop, session reconciler, session-retry drain and
///    SmartGuard ticker, all gated by a shared start/stop flag
/// 5. Serves the control API until a shutdown signal arrives
///
/// # Errors
///
/// Returns an error if configuration is missing/invalid, Redis cannot be
/// reached, or the control API fails to bind its listener.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    dispatcher_config::tracing::init_tracing(&environment);

    dispatcher_core::metrics::init_metrics();

    let config =
        DispatcherConfig::from_env().wrap_err("failed to load dispatcher configuration")?;
    info!(environment = ?environment, port = config.server.port, "starting anti-ban dispatcher");

    info!("connecting to Redis...");
    let kv = KvClient::connect_with_retry(&config.redis.url)
        .await
        .wrap_err("failed to connect to Redis")?;
    info!("connected to Redis");

    let orchestrator = OrchestratorClient::new(config.orchestrator.clone(), kv.clone())
        .wrap_err("failed to build orchestrator client")?;
    let incidents = Arc::new(IncidentSink::new(kv.clone(), config.orchestrator.brain_url.clone()));
    let router = Arc::new(Router::default());
    let smartguard = Arc::new(SmartGuard::new(kv.clone(), orchestrator.clone(), incidents.clone()));
    if let Err(e) = smartguard.seed_enabled_if_absent(config.smartguard.enabled).await {
        warn!(error = %e, "failed to seed config:smartguard:enabled, live value may default to enabled");
    }

    let intake_loop = IntakeLoop::new(
        kv.clone(),
        config.queues.clone(),
        config.job_stats_ttl_seconds as i64,
        config.pacer.retry_delay_ms,
        config.poll_interval_ms,
        orchestrator.clone(),
        router.clone(),
        incidents.clone(),
    );
    let intake_stats = intake_loop.stats.clone();

    let session_deps = SessionDeps {
        kv: kv.clone(),
        queues: config.queues.clone(),
        orchestrator: orchestrator.clone(),
        incidents: incidents.clone(),
        burst_limit: config.pacer.burst_limit,
        burst_cooldown_ms: config.pacer.burst_cooldown_ms,
        max_retries: config.pacer.max_retries,
        retry_delay_ms: config.pacer.retry_delay_ms,
    };
    let sessions = Arc::new(SessionRuntime::new(session_deps));

    // Shared start/stop flag: seeded from AUTO_START and flipped live by
    // `POST /start` and `POST /stop`. Unlike the shutdown signal below, this
    // never ends the background tasks, only pauses what they do.
    let running = Arc::new(AtomicBool::new(config.auto_start));
    if !config.auto_start {
        info!("AUTO_START is false, dispatcher will idle until POST /start");
    }

    let intake_handle = {
        let running = running.clone();
        tokio::spawn(async move { intake_loop.run(running).await })
    };
    let reconciler_handle = {
        let sessions = sessions.clone();
        let running = running.clone();
        tokio::spawn(async move { sessions.run_reconciler(running).await })
    };
    let retry_drain_handle = {
        let sessions = sessions.clone();
        let kv = kv.clone();
        let running = running.clone();
        tokio::spawn(async move { sessions.run_retry_drain(kv, running).await })
    };
    let smartguard_handle = {
        let smartguard = smartguard.clone();
        let tick_ms = config.smartguard.tick_ms;
        let running = running.clone();
        smartguard::spawn_ticker(smartguard, tick_ms, running)
    };

    let state = AppState {
        kv: kv.clone(),
        queues: config.queues.clone(),
        incidents: incidents.clone(),
        smartguard: smartguard.clone(),
        smartguard_tick_ms: config.smartguard.tick_ms,
        sessions: sessions.clone(),
        intake_stats,
        running: running.clone(),
    };
    let app = api::router(state);

    let addr = config.server.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("failed to bind control API to {}", addr))?;
    info!(address = %addr, "control API listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!(error = %e, "error waiting for shutdown signal");
        }
        let _ = shutdown_tx.send(true);
    });

    let server_shutdown_rx = shutdown_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let mut rx = server_shutdown_rx;
        let _ = rx.changed().await;
    });

    tokio::select! {
        result = server => {
            result.wrap_err("control API server failed")?;
        }
        _ = shutdown_rx.changed() => {}
    }

    info!("shutting down background loops");
    intake_handle.abort();
    reconciler_handle.abort();
    retry_drain_handle.abort();
    smartguard_handle.abort();

    info!("dispatcher stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
