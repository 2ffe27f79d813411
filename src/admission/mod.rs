//! Queue-backed appointment admission.
//!
//! Callers submit booking requests and get a [`CompletionHandle`] back at once.
//! A fixed pool of workers drains the shared [`AdmissionQueue`]. Each worker
//! asks the store for conflicts in the requested window and creates the
//! booking if there are none. Conflicts and store failures go back through the
//! [`DelayScheduler`] with exponential backoff until `max_attempts` is spent.
//!
//! The conflict query and the create are two separate store calls, so two
//! overlapping requests for the same practitioner that are processed at the
//! same moment can both be admitted. Ordering across requests is not
//! guaranteed either: whichever request reaches an idle worker first wins.

mod backoff;
mod error;
mod handle;
mod queue;
mod request;
mod timer;
mod worker;
#[cfg(test)]
mod tests;

pub use backoff::{next_delay, BackoffPolicy};
pub use error::AdmissionError;
pub use handle::{CompletionHandle, Outcome};
pub use queue::AdmissionQueue;
pub use request::BookingRequest;
pub use timer::DelayScheduler;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};
use ulid::Ulid;

use crate::config::AdmissionConfig;
use crate::limits::*;
use crate::model::*;
use crate::notify::{AdmissionEvent, NotifyHub};
use crate::observability::ADMISSIONS_TOTAL;
use crate::store::BookingStore;

/// State shared by the workers, the timer and the public handle.
pub(crate) struct Shared<S> {
    store: Arc<S>,
    queue: Arc<AdmissionQueue>,
    timer: DelayScheduler,
    notify: NotifyHub,
    config: AdmissionConfig,
    backoff: BackoffPolicy,
    slot_ms: Ms,
    live_workers: AtomicUsize,
}

/// Owner of the worker pool and the delay timer. Dropping it shuts them down.
pub struct AdmissionScheduler<S: BookingStore> {
    shared: Arc<Shared<S>>,
}

impl<S: BookingStore> AdmissionScheduler<S> {
    /// Spawn the workers and the timer. Must be called inside a tokio runtime.
    pub fn start(store: Arc<S>, config: AdmissionConfig) -> Self {
        let config = config.normalized();
        let queue = Arc::new(AdmissionQueue::new());
        let (timer, _timer_task) = DelayScheduler::spawn(queue.clone(), config.poll_interval);
        let shared = Arc::new(Shared {
            store,
            queue,
            timer,
            notify: NotifyHub::new(),
            backoff: BackoffPolicy::from_config(&config),
            slot_ms: duration_ms(config.slot_duration),
            live_workers: AtomicUsize::new(0),
            config,
        });

        for id in 0..shared.config.workers {
            tokio::spawn(worker::run_worker(id, shared.clone()));
        }
        info!(
            "admission scheduler started: {} workers, max {} attempts, backoff {:?}..{:?}, slot {:?}",
            shared.config.workers,
            shared.config.max_attempts,
            shared.config.initial_backoff,
            shared.config.backoff_cap,
            shared.config.slot_duration
        );
        Self { shared }
    }

    /// Book `start` for `practitioner` as soon as a worker is free.
    ///
    /// Invalid input is returned as an error right away. Otherwise the handle
    /// is returned without waiting; after shutdown it comes back already
    /// resolved with [`AdmissionError::ShuttingDown`].
    pub fn submit(
        &self,
        practitioner: PractitionerId,
        subject: SubjectId,
        start: Ms,
        notes: Option<String>,
    ) -> Result<CompletionHandle, AdmissionError> {
        self.admit(practitioner, subject, start, notes, None, Duration::ZERO)
    }

    /// Like [`submit`](Self::submit), but the request only enters the queue
    /// once `delay` has passed.
    pub fn submit_with_delay(
        &self,
        practitioner: PractitionerId,
        subject: SubjectId,
        start: Ms,
        notes: Option<String>,
        delay: Duration,
    ) -> Result<CompletionHandle, AdmissionError> {
        self.admit(practitioner, subject, start, notes, None, delay)
    }

    /// Like [`submit`](Self::submit), creating the booking with `status`
    /// instead of `Scheduled`.
    pub fn submit_with_status(
        &self,
        practitioner: PractitionerId,
        subject: SubjectId,
        start: Ms,
        notes: Option<String>,
        status: BookingStatus,
    ) -> Result<CompletionHandle, AdmissionError> {
        self.admit(practitioner, subject, start, notes, Some(status), Duration::ZERO)
    }

    fn admit(
        &self,
        practitioner: PractitionerId,
        subject: SubjectId,
        start: Ms,
        notes: Option<String>,
        status: Option<BookingStatus>,
        delay: Duration,
    ) -> Result<CompletionHandle, AdmissionError> {
        validate(practitioner, subject, start, notes.as_deref(), delay, now_ms())?;

        let handle = CompletionHandle::new();
        let request = BookingRequest::new(practitioner, subject, start, notes, status, handle.clone());
        if delay.is_zero() || !self.shared.queue.is_running() {
            self.shared.queue.enqueue(request);
        } else {
            self.shared.timer.schedule(request, delay);
        }
        Ok(handle)
    }

    /// Stop accepting work. Requests still queued are rejected; in-flight
    /// attempts are not waited for. Only the first call has any effect.
    pub fn shutdown(&self) {
        let Some(leftover) = self.shared.queue.close() else {
            return;
        };
        let rejected = leftover.len();
        for request in leftover {
            if request.resolve(Err(AdmissionError::ShuttingDown)) {
                metrics::counter!(ADMISSIONS_TOTAL, "outcome" => "rejected").increment(1);
            }
        }
        self.shared.notify.prune();
        info!("admission scheduler shutting down, {rejected} queued requests rejected");
    }

    /// Best-effort lookup; store errors read as "not found".
    pub async fn try_get(&self, id: Ulid) -> Option<Booking> {
        match self.shared.store.lookup_booking(id).await {
            Ok(booking) => booking,
            Err(e) => {
                warn!("lookup of booking {id} failed: {e}");
                None
            }
        }
    }

    /// Stream of admission outcomes for one practitioner.
    pub fn subscribe(&self, practitioner: PractitionerId) -> broadcast::Receiver<AdmissionEvent> {
        self.shared.notify.subscribe(practitioner)
    }

    pub fn is_running(&self) -> bool {
        self.shared.queue.is_running()
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queue.len()
    }

    /// Worker loops that have not exited yet.
    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::Acquire)
    }
}

impl<S: BookingStore> Drop for AdmissionScheduler<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn validate(
    practitioner: PractitionerId,
    subject: SubjectId,
    start: Ms,
    notes: Option<&str>,
    delay: Duration,
    now: Ms,
) -> Result<(), AdmissionError> {
    if !practitioner.is_valid() {
        return Err(AdmissionError::InvalidInput("practitioner id is required"));
    }
    if !subject.is_valid() {
        return Err(AdmissionError::InvalidInput("subject id is required"));
    }
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&start) {
        return Err(AdmissionError::InvalidInput("start out of range"));
    }
    if start < now {
        return Err(AdmissionError::InvalidInput("start is in the past"));
    }
    if notes.is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(AdmissionError::InvalidInput("notes too long"));
    }
    if duration_ms(delay) > MAX_SUBMIT_DELAY_MS {
        return Err(AdmissionError::InvalidInput("delay too long"));
    }
    Ok(())
}
