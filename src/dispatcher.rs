use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::PgPool;
use tokio::sync::watch;

use crate::compliance::ComplianceDecision;
use crate::compliance::ComplianceGate;
use crate::degradation::DegradationController;
use crate::degradation::DispatchDecision;
use crate::domain::AttemptState;
use crate::domain::Channel;
use crate::domain::ErrorClass;
use crate::domain::NotificationRequest;
use crate::providers::ProviderPayload;
use crate::rate_limit::LimitDecision;
use crate::rate_limit::LimitSubject;
use crate::rate_limit::RateLimiter;
use crate::repository;
use crate::repository::JobRow;
use crate::retry::RetryDecision;
use crate::retry::RetryPolicy;
use crate::selector::ProviderDirectory;

/// Everything one worker needs to process a job. Shared across the pool and
/// with the HTTP surface (admission, health).
pub struct DispatchContext {
    pub pool: PgPool,
    pub directory: Arc<ProviderDirectory>,
    pub compliance: ComplianceGate,
    pub limiter: RateLimiter,
    pub retry: RetryPolicy,
    pub degradation: Arc<DegradationController>,
    pub lease: Duration,
    pub poll_interval: Duration,
}

/// Spawn the worker pool and run until shutdown. The queue handle lives
/// here; workers receive claims, never the producer.
pub async fn init_dispatch_workers(
    ctx: Arc<DispatchContext>,
    worker_count: usize,
    shutdown: watch::Receiver<bool>,
) -> Result<(), anyhow::Error> {
    tracing::info!(worker_count, "starting dispatch workers");
    let mut handles = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        handles.push(tokio::spawn(worker_loop(
            ctx.clone(),
            worker_id,
            shutdown.clone(),
        )));
    }
    for handle in handles {
        handle.await?;
    }
    Ok(())
}

async fn worker_loop(ctx: Arc<DispatchContext>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            tracing::info!(worker_id, "dispatch worker draining");
            return;
        }
        match repository::claim_due_job(&ctx.pool, ctx.lease).await {
            Ok(Some(job)) => {
                if let Err(e) = process_job(&ctx, &job).await {
                    // the lease expires and the job is redelivered
                    tracing::error!(
                        error.cause_chain = ?e,
                        request_id = %job.request_id,
                        attempt_no = job.attempt_no,
                        "job processing failed"
                    );
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(ctx.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
            Err(e) => {
                tracing::error!(error.cause_chain = ?e, worker_id, "failed to claim job");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

#[tracing::instrument(
    skip_all,
    fields(
        request_id = %job.request_id,
        tenant_id = %job.tenant_id,
        attempt_no = job.attempt_no,
        correlation_id = tracing::field::Empty,
    ),
    err
)]
async fn process_job(ctx: &DispatchContext, job: &JobRow) -> Result<(), anyhow::Error> {
    // 1. load the request; the tenant predicate means a mismatched job finds
    // nothing and is dropped
    let Some(request) = repository::get_request(&ctx.pool, job.tenant_id, job.request_id).await?
    else {
        tracing::warn!("job references no request for its tenant; dropping");
        repository::delete_job(&ctx.pool, job.id).await?;
        return Ok(());
    };
    tracing::Span::current().record(
        "correlation_id",
        tracing::field::display(request.correlation_id),
    );

    // 2. terminal requests are acked and dropped; a stale `sending` slot from
    // a cancelled worker is closed as timeout and its successor scheduled
    if let Some(latest) = repository::latest_attempt(&ctx.pool, job.request_id).await? {
        if latest.state.is_terminal() && latest.attempt_no >= job.attempt_no {
            repository::delete_job(&ctx.pool, job.id).await?;
            return Ok(());
        }
        if latest.state == AttemptState::Sending && latest.attempt_no >= job.attempt_no {
            tracing::warn!(
                stale_attempt_no = latest.attempt_no,
                "closing stale sending attempt from an expired lease"
            );
            repository::mark_attempt_timed_out(&ctx.pool, job.request_id, latest.attempt_no)
                .await?;
            repository::reschedule_job(
                &ctx.pool,
                job.id,
                Duration::ZERO,
                Some(latest.attempt_no + 1),
                None,
            )
            .await?;
            return Ok(());
        }
    }

    // 3. degradation: shed, defer, or rewrite the channel
    let availability = ctx.directory.channel_availability(job.channel);
    let mut channel = job.channel;
    match ctx
        .degradation
        .decide_dispatch(&request, job.channel, availability)
    {
        DispatchDecision::Proceed => {}
        DispatchDecision::Defer { delay } => {
            repository::reschedule_job(&ctx.pool, job.id, delay, None, None).await?;
            return Ok(());
        }
        DispatchDecision::Fallback { channel: fallback } => {
            tracing::warn!(from = %channel, to = %fallback, "channel fallback under degradation");
            channel = fallback;
        }
    }

    // 4. compliance gate; terminal reasons are recorded and the job acked
    match ctx.compliance.evaluate(&request, channel).await {
        ComplianceDecision::Allow => {}
        ComplianceDecision::Suppress { reason_code } => {
            record_compliance_outcome(ctx, job, AttemptState::Suppressed, reason_code).await?;
            return Ok(());
        }
        ComplianceDecision::Reject { reason_code } => {
            record_compliance_outcome(ctx, job, AttemptState::Rejected, reason_code).await?;
            return Ok(());
        }
        ComplianceDecision::Reschedule {
            resume_at,
            reason_code,
        } => {
            let delay = (resume_at - chrono::Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tracing::info!(reason_code, delay_secs = delay.as_secs(), "send window closed");
            repository::reschedule_job(&ctx.pool, job.id, delay, None, changed(job, channel))
                .await?;
            return Ok(());
        }
    }

    // 5. rate limits
    let subject = LimitSubject {
        tenant_id: request.tenant_id,
        channel,
        recipient_id: Some(request.recipient.id.clone()),
        principal: None,
    };
    if let LimitDecision::Denied { retry_after } =
        ctx.limiter.check(&subject, request.notification_type).await
    {
        repository::reschedule_job(&ctx.pool, job.id, retry_after, None, changed(job, channel))
            .await?;
        return Ok(());
    }

    // 6. provider candidates in priority order; exhausting the budget
    // without a provider is a dead letter, not a silent drop
    let candidates = match ctx.directory.usable_candidates(channel) {
        Ok(candidates) => candidates,
        Err(e) => {
            repository::insert_terminal_attempt(
                &ctx.pool,
                job.tenant_id,
                job.request_id,
                job.attempt_no,
                AttemptState::Failed,
                "no_provider_available",
            )
            .await?;
            match ctx.retry.decide(
                request.notification_type,
                ErrorClass::Retryable,
                job.attempt_no,
                None,
            ) {
                RetryDecision::Retry {
                    delay,
                    next_attempt_no,
                } => {
                    repository::reschedule_job(
                        &ctx.pool,
                        job.id,
                        delay,
                        Some(next_attempt_no),
                        changed(job, channel),
                    )
                    .await?;
                }
                _ => {
                    repository::insert_dead_letter(
                        &ctx.pool,
                        job.tenant_id,
                        job.request_id,
                        job.attempt_no,
                        "no_provider_available",
                        json!({ "channel": channel.as_str(), "error": e.to_string() }),
                    )
                    .await?;
                    repository::delete_job(&ctx.pool, job.id).await?;
                }
            }
            return Ok(());
        }
    };

    // 7. circuit breaker admission before any provider I/O. A candidate that
    // lost the race for its last half-open slot between selection and
    // acquire falls through to the next one, so recovery load still fails
    // over instead of waiting on the recovering provider.
    let mut acquired = None;
    let mut earliest_retry: Option<Duration> = None;
    for candidate in candidates {
        let breaker = ctx
            .directory
            .breakers()
            .get(candidate.id())
            .ok_or_else(|| anyhow::anyhow!("no breaker registered for {}", candidate.id()))?
            .clone();
        match breaker.try_acquire() {
            Ok(()) => {
                acquired = Some((candidate, breaker));
                break;
            }
            Err(open) => {
                tracing::info!(
                    provider = candidate.id(),
                    retry_in = ?open.retry_in,
                    "circuit refused the call; trying next candidate"
                );
                earliest_retry = Some(match earliest_retry {
                    None => open.retry_in,
                    Some(d) => d.min(open.retry_in),
                });
            }
        }
    }
    let Some((provider, breaker)) = acquired else {
        let delay = earliest_retry.unwrap_or(Duration::from_secs(1));
        tracing::info!(channel = %channel, retry_in = ?delay, "all candidate circuits saturated; deferring");
        repository::reschedule_job(&ctx.pool, job.id, delay, None, changed(job, channel)).await?;
        return Ok(());
    };
    if ctx.directory.primary_id(channel) != Some(provider.id()) {
        tracing::warn!(
            provider = provider.id(),
            channel = %channel,
            "dispatching via non-primary provider"
        );
    }

    // 8. open the attempt slot; losing the race means another worker owns it
    let attempt_id = match repository::insert_sending_attempt(
        &ctx.pool,
        job.tenant_id,
        job.request_id,
        job.attempt_no,
        provider.id(),
    )
    .await
    {
        Ok(Some(id)) => id,
        Ok(None) => {
            tracing::info!("attempt slot already taken by a concurrent worker");
            breaker.record_success();
            return Ok(());
        }
        Err(e) => {
            breaker.record_failure();
            return Err(e);
        }
    };

    // 9. the provider call; the adapter enforces its own deadline
    let contact = request
        .recipient
        .contact_for(channel)
        .ok_or_else(|| anyhow::anyhow!("compliance admitted a job without a contact"))?;
    let payload = ProviderPayload {
        to: contact,
        subject: request.subject.as_deref(),
        body_text: request.body_text.as_deref(),
        body_html: request.body_html.as_deref(),
        correlation_id: request.correlation_id,
    };
    let outcome = provider.send(&payload).await;

    if outcome.accepted {
        breaker.record_success();
        ctx.directory.health().record_success(provider.id());
        repository::record_attempt_outcome(
            &ctx.pool,
            attempt_id,
            AttemptState::Sent,
            outcome.provider_message_id.as_deref(),
            None,
            None,
            Some(outcome.latency.as_millis() as i64),
        )
        .await?;
        repository::delete_job(&ctx.pool, job.id).await?;
        tracing::info!(
            provider = provider.id(),
            latency_ms = outcome.latency.as_millis() as i64,
            "attempt sent"
        );
        return Ok(());
    }

    breaker.record_failure();
    let error_class = outcome.error_class.unwrap_or(ErrorClass::Unknown);
    let error_code = outcome.error_code.as_deref().unwrap_or("unknown");
    ctx.directory
        .health()
        .record_failure(provider.id(), error_code);
    repository::record_attempt_outcome(
        &ctx.pool,
        attempt_id,
        AttemptState::Failed,
        None,
        Some(error_code),
        Some(error_class),
        Some(outcome.latency.as_millis() as i64),
    )
    .await?;
    tracing::warn!(
        provider = provider.id(),
        error_class = %error_class,
        error_code,
        "attempt failed"
    );

    // 10. follow-up per the retry engine
    match ctx.retry.decide(
        request.notification_type,
        error_class,
        job.attempt_no,
        outcome.retry_after,
    ) {
        RetryDecision::Retry {
            delay,
            next_attempt_no,
        } => {
            repository::reschedule_job(
                &ctx.pool,
                job.id,
                delay,
                Some(next_attempt_no),
                changed(job, channel),
            )
            .await?;
        }
        RetryDecision::DeadLetter => {
            repository::insert_dead_letter(
                &ctx.pool,
                job.tenant_id,
                job.request_id,
                job.attempt_no,
                "retry_budget_exhausted",
                dead_letter_context(&request, provider.id(), error_code, error_class, &outcome.error_detail),
            )
            .await?;
            repository::delete_job(&ctx.pool, job.id).await?;
            tracing::warn!(provider = provider.id(), "request dead-lettered");
        }
        RetryDecision::GiveUp => {
            repository::delete_job(&ctx.pool, job.id).await?;
        }
    }
    Ok(())
}

async fn record_compliance_outcome(
    ctx: &DispatchContext,
    job: &JobRow,
    state: AttemptState,
    reason_code: &str,
) -> Result<(), anyhow::Error> {
    tracing::info!(reason_code, state = %state, "compliance verdict recorded");
    repository::insert_terminal_attempt(
        &ctx.pool,
        job.tenant_id,
        job.request_id,
        job.attempt_no,
        state,
        reason_code,
    )
    .await?;
    repository::delete_job(&ctx.pool, job.id).await?;
    Ok(())
}

fn changed(job: &JobRow, channel: Channel) -> Option<Channel> {
    (channel != job.channel).then_some(channel)
}

fn dead_letter_context(
    request: &NotificationRequest,
    provider: &str,
    error_code: &str,
    error_class: ErrorClass,
    error_detail: &Option<String>,
) -> serde_json::Value {
    json!({
        "provider": provider,
        "error_code": error_code,
        "error_class": error_class.as_str(),
        "error_detail": error_detail,
        "channel": request.channel.as_str(),
        "notification_type": request.notification_type.as_str(),
        "correlation_id": request.correlation_id,
    })
}
