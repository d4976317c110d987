use std::fmt::Debug;
use std::fmt::Display;
use std::time::Duration;

use anyhow::Context;
use notify_dispatch::configuration::get_configuration;
use notify_dispatch::degradation::run_mode_probes;
use notify_dispatch::dispatcher::init_dispatch_workers;
use notify_dispatch::event_ingress::init_event_ingress;
use notify_dispatch::idempotency::init_expiry_worker;
use notify_dispatch::outbox::init_outbox_publisher;
use notify_dispatch::selector::run_health_probes;
use notify_dispatch::selector::HEALTH_PROBE_INTERVAL;
use notify_dispatch::startup::build_shared_state;
use notify_dispatch::startup::Application;
use notify_dispatch::telemetry::get_subscriber;
use notify_dispatch::telemetry::init_subscriber;
use notify_dispatch::webhook_retry::init_webhook_retry_worker;
use tokio::sync::watch;
use tokio::task::JoinError;

const MODE_PROBE_INTERVAL: Duration = Duration::from_secs(10);
const OUTBOX_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn report_exit(name: &str, outcome: Result<Result<(), impl Debug + Display>, JoinError>) {
    match outcome {
        Ok(Ok(())) => tracing::info!("{name} exited gracefully"),
        Ok(Err(e)) => tracing::error!(
            error.cause_chain = ?e,
            error.message = %e,
            "{name} failed"
        ),
        Err(e) => tracing::error!(
            error.cause_chain = ?e,
            error.message = %e,
            "{name} panicked"
        ),
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber("notify-dispatch", "info", std::io::stdout);
    init_subscriber(subscriber);

    let cfg = get_configuration().context("failed to load configuration")?;
    let state = build_shared_state(&cfg).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let app = Application::build(cfg.clone(), &state).await?;
    tracing::info!(port = app.get_port(), "starting notification dispatch service");

    let mut api = tokio::spawn(app.run_until_stopped());
    let mut dispatcher = tokio::spawn(init_dispatch_workers(
        state.dispatch.clone(),
        cfg.dispatcher.worker_count(),
        shutdown_rx.clone(),
    ));
    let mut outbox = tokio::spawn(init_outbox_publisher(
        state.pool.clone(),
        OUTBOX_POLL_INTERVAL,
        shutdown_rx.clone(),
    ));
    let mut ingress = tokio::spawn(init_event_ingress(
        cfg.clone(),
        state.pool.clone(),
        state.redis.clone(),
        state.queue_healthy.clone(),
        shutdown_rx.clone(),
    ));
    let mut webhook_retry = tokio::spawn(init_webhook_retry_worker(
        state.pool.clone(),
        state.directory.clone(),
        shutdown_rx.clone(),
    ));
    let mut expiry = tokio::spawn(init_expiry_worker(cfg.clone(), shutdown_rx.clone()));
    let health_probes = tokio::spawn(run_health_probes(
        state.directory.clone(),
        HEALTH_PROBE_INTERVAL,
        shutdown_rx.clone(),
    ));
    let mode_probes = tokio::spawn(run_mode_probes(
        state.degradation.clone(),
        state.pool.clone(),
        state.directory.clone(),
        state.queue_healthy.clone(),
        state.redis.clone(),
        MODE_PROBE_INTERVAL,
        shutdown_rx.clone(),
    ));

    // any worker ending outside a shutdown is a crash; exiting non-zero
    // hands recovery to the orchestrator
    let crashed: Option<&str> = tokio::select! {
        o = &mut api => { report_exit("API", o); Some("API") }
        o = &mut dispatcher => { report_exit("dispatch worker pool", o); Some("dispatch worker pool") }
        o = &mut outbox => { report_exit("outbox publisher", o); Some("outbox publisher") }
        o = &mut ingress => { report_exit("event ingress", o); Some("event ingress") }
        o = &mut webhook_retry => { report_exit("webhook retry processor", o); Some("webhook retry processor") }
        o = &mut expiry => { report_exit("idempotency expiry worker", o); Some("idempotency expiry worker") }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received; draining in-flight work");
            None
        }
    };

    let _ = shutdown_tx.send(true);
    if let Some(name) = crashed {
        anyhow::bail!("{name} terminated unexpectedly");
    }

    // stop intake, drain with a deadline, then cancel whatever remains;
    // leased jobs and unacked bus messages are redelivered
    let drain = async {
        let _ = tokio::join!(
            &mut dispatcher,
            &mut outbox,
            &mut ingress,
            &mut webhook_retry,
            &mut expiry
        );
    };
    let drain_timeout = Duration::from_secs(cfg.dispatcher.drain_timeout_seconds);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tracing::warn!(
            timeout_secs = drain_timeout.as_secs(),
            "drain deadline exceeded; cancelling remaining work"
        );
    }
    health_probes.abort();
    mode_probes.abort();
    Ok(())
}
