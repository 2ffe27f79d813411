use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::duration_ms;
use crate::notify::AdmissionEvent;
use crate::observability::*;
use crate::store::BookingStore;

use super::handle::Outcome;
use super::{AdmissionError, BookingRequest, Shared};

/// Drain the shared queue until the scheduler stops running.
pub(super) async fn run_worker<S: BookingStore>(id: usize, shared: Arc<Shared<S>>) {
    shared.live_workers.fetch_add(1, Ordering::AcqRel);
    metrics::gauge!(WORKERS_ACTIVE).increment(1.0);
    debug!("admission worker {id} started");

    while shared.queue.is_running() {
        let Some(request) = shared.queue.pop(shared.config.poll_interval).await else {
            continue;
        };
        if request.handle().is_resolved() {
            debug!(
                "worker {id}: dropping request for practitioner {}, handle already resolved",
                request.practitioner()
            );
            continue;
        }
        if let Err(panic) = AssertUnwindSafe(process(&shared, &request)).catch_unwind().await {
            let msg = panic_message(panic.as_ref());
            error!(
                "worker {id}: panic while admitting for practitioner {}: {msg}",
                request.practitioner()
            );
            finish(&shared, &request, Err(AdmissionError::Internal(msg)));
        }
    }

    shared.live_workers.fetch_sub(1, Ordering::AcqRel);
    metrics::gauge!(WORKERS_ACTIVE).decrement(1.0);
    info!("admission worker {id} stopped");
}

/// Conflict query, then create. No lock is held across the two calls.
async fn attempt<S: BookingStore>(shared: &Shared<S>, request: &BookingRequest) -> Outcome {
    let practitioner = request.practitioner();
    let window = request.window(shared.slot_ms);

    let conflicts = shared.store.find_conflicts(practitioner, window).await?;
    if let Some(existing) = conflicts.first() {
        return Err(AdmissionError::Conflict {
            practitioner,
            existing: existing.booking_id,
        });
    }

    let id = shared
        .store
        .create_booking(
            practitioner,
            request.subject(),
            window,
            request.status(),
            request.notes().map(str::to_owned),
        )
        .await?;
    Ok(id)
}

async fn process<S: BookingStore>(shared: &Shared<S>, request: &BookingRequest) {
    metrics::counter!(ATTEMPTS_TOTAL).increment(1);
    let started = Instant::now();
    let result = attempt(shared, request).await;
    metrics::histogram!(ATTEMPT_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    match result {
        Ok(id) => {
            debug!(
                "admitted booking {id} for practitioner {} at {} (attempt {})",
                request.practitioner(),
                request.start(),
                request.attempt()
            );
            finish(shared, request, Ok(id));
        }
        Err(cause) => retry_or_fail(shared, request, cause),
    }
}

fn retry_or_fail<S: BookingStore>(shared: &Shared<S>, request: &BookingRequest, cause: AdmissionError) {
    let max_attempts = shared.config.max_attempts;
    if !cause.is_retryable() || request.attempt() + 1 >= max_attempts {
        warn!(
            "giving up on practitioner {} at {} after {} attempts: {cause}",
            request.practitioner(),
            request.start(),
            request.attempt() + 1
        );
        let outcome = if cause.is_retryable() {
            AdmissionError::Exhausted {
                attempts: max_attempts,
                cause: Box::new(cause),
            }
        } else {
            cause
        };
        finish(shared, request, Err(outcome));
        return;
    }

    let delay = shared.backoff.delay_for(request.attempt());
    let reason = retry_reason(&cause);
    metrics::counter!(RETRIES_TOTAL, "reason" => reason).increment(1);
    debug!(
        "attempt {} for practitioner {} at {} failed ({cause}), retrying in {delay:?}",
        request.attempt() + 1,
        request.practitioner(),
        request.start()
    );
    shared.notify.send(
        request.practitioner(),
        AdmissionEvent::Retrying {
            subject: request.subject(),
            start: request.start(),
            attempt: request.attempt(),
            delay_ms: duration_ms(delay),
            reason,
        },
    );
    shared.timer.schedule(request.next_attempt(), delay);
}

/// Resolve the request's handle and publish the outcome.
fn finish<S: BookingStore>(shared: &Shared<S>, request: &BookingRequest, outcome: Outcome) {
    let label = outcome_label(&outcome);
    let event = match &outcome {
        Ok(id) => AdmissionEvent::Admitted {
            booking_id: *id,
            subject: request.subject(),
            start: request.start(),
            attempt: request.attempt(),
        },
        Err(e) => AdmissionEvent::Failed {
            subject: request.subject(),
            start: request.start(),
            error: e.to_string(),
        },
    };
    let created: Option<Ulid> = outcome.as_ref().ok().copied();

    if request.resolve(outcome) {
        metrics::counter!(ADMISSIONS_TOTAL, "outcome" => label).increment(1);
    } else if let Some(id) = created {
        warn!(
            "booking {id} created for practitioner {} but its request was already resolved",
            request.practitioner()
        );
    }
    shared.notify.send(request.practitioner(), event);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
