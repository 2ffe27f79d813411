use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::*;
use crate::store::{MemoryStore, StoreError};

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

/// MemoryStore wrapper that counts calls and injects failures.
#[derive(Default)]
struct ProbeStore {
    inner: MemoryStore,
    find_calls: AtomicUsize,
    create_calls: AtomicUsize,
    created_subjects: Mutex<Vec<SubjectId>>,
    first_find_at: Mutex<Option<Instant>>,
    /// Remaining `find_conflicts` calls that fail as unavailable.
    failing_finds: AtomicU32,
    /// Remaining `find_conflicts` calls that panic.
    panicking_finds: AtomicU32,
    failing_lookups: AtomicBool,
    /// When set, every `find_conflicts` consumes one permit first.
    gate: Option<Arc<Semaphore>>,
}

impl ProbeStore {
    fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    fn finds(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BookingStore for ProbeStore {
    async fn find_conflicts(
        &self,
        practitioner: PractitionerId,
        window: Span,
    ) -> Result<Vec<ConflictRecord>, StoreError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.first_find_at
            .lock()
            .unwrap()
            .get_or_insert_with(Instant::now);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if Self::take_one(&self.panicking_finds) {
            panic!("injected store panic");
        }
        if Self::take_one(&self.failing_finds) {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.find_conflicts(practitioner, window).await
    }

    async fn create_booking(
        &self,
        practitioner: PractitionerId,
        subject: SubjectId,
        window: Span,
        status: BookingStatus,
        notes: Option<String>,
    ) -> Result<Ulid, StoreError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.created_subjects.lock().unwrap().push(subject);
        self.inner
            .create_booking(practitioner, subject, window, status, notes)
            .await
    }

    async fn lookup_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        if self.failing_lookups.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("lookup timed out".into()));
        }
        self.inner.lookup_booking(id).await
    }
}

fn fast_config(workers: usize, max_attempts: u32) -> AdmissionConfig {
    AdmissionConfig {
        workers,
        max_attempts,
        initial_backoff: Duration::from_millis(5),
        backoff_cap: Duration::from_millis(40),
        slot_duration: Duration::from_secs(30 * 60),
        poll_interval: Duration::from_millis(10),
        jitter_min: Duration::ZERO,
        jitter_max: Duration::from_millis(2),
    }
}

fn start(store: ProbeStore, workers: usize, max_attempts: u32) -> (AdmissionScheduler<ProbeStore>, Arc<ProbeStore>) {
    let store = Arc::new(store);
    let scheduler = AdmissionScheduler::start(store.clone(), fast_config(workers, max_attempts));
    (scheduler, store)
}

async fn outcome(handle: &CompletionHandle) -> Outcome {
    tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("request did not resolve in time")
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn tomorrow() -> Ms {
    now_ms() + 24 * H
}

// ── Admission ────────────────────────────────────────────

#[tokio::test]
async fn distinct_practitioners_get_unique_ids() {
    let (scheduler, store) = start(ProbeStore::default(), 4, 5);
    let at = tomorrow();

    let handles: Vec<_> = (1..=20u64)
        .map(|p| {
            scheduler
                .submit(PractitionerId(p), SubjectId(100 + p), at, None)
                .unwrap()
        })
        .collect();

    let mut ids = HashSet::new();
    for h in &handles {
        ids.insert(outcome(h).await.unwrap());
    }
    assert_eq!(ids.len(), 20);
    assert_eq!(store.creates(), 20);
    assert_eq!(store.inner.booking_count(), 20);
}

#[tokio::test]
async fn admitted_booking_is_readable() {
    let (scheduler, _store) = start(ProbeStore::default(), 2, 5);
    let at = tomorrow();
    let handle = scheduler
        .submit(PractitionerId(3), SubjectId(9), at, Some("bring x-rays".into()))
        .unwrap();
    let id = outcome(&handle).await.unwrap();

    let booking = scheduler.try_get(id).await.unwrap();
    assert_eq!(booking.practitioner, PractitionerId(3));
    assert_eq!(booking.subject, SubjectId(9));
    assert_eq!(booking.span, Span::new(at, at + 30 * M));
    assert_eq!(booking.status, BookingStatus::Scheduled);
    assert_eq!(booking.notes.as_deref(), Some("bring x-rays"));
}

#[tokio::test]
async fn caller_status_is_used() {
    let (scheduler, _store) = start(ProbeStore::default(), 2, 5);
    let handle = scheduler
        .submit_with_status(PractitionerId(1), SubjectId(1), tomorrow(), None, BookingStatus::Confirmed)
        .unwrap();
    let id = outcome(&handle).await.unwrap();
    assert_eq!(scheduler.try_get(id).await.unwrap().status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn overlapping_request_goes_through_conflict_retries() {
    // one worker keeps the two requests strictly sequential
    let (scheduler, store) = start(ProbeStore::default(), 1, 3);
    let p = PractitionerId(7);
    let mut events = scheduler.subscribe(p);
    let at = tomorrow();

    let first = scheduler.submit(p, SubjectId(1), at, None).unwrap();
    let second = scheduler.submit(p, SubjectId(2), at + 15 * M, None).unwrap();

    let first_id = outcome(&first).await.unwrap();
    let err = outcome(&second).await.unwrap_err();
    match &err {
        AdmissionError::Exhausted { attempts, cause } => {
            assert_eq!(*attempts, 3);
            assert_eq!(
                **cause,
                AdmissionError::Conflict {
                    practitioner: p,
                    existing: first_id
                }
            );
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(store.finds(), 1 + 3);
    assert_eq!(store.creates(), 1);

    let mut conflict_retries = 0;
    while let Ok(event) = events.try_recv() {
        if let AdmissionEvent::Retrying { reason, subject, .. } = event {
            assert_eq!(subject, SubjectId(2));
            assert_eq!(reason, "conflict");
            conflict_retries += 1;
        }
    }
    assert_eq!(conflict_retries, 2);
}

#[tokio::test]
async fn adjacent_slots_do_not_conflict() {
    let (scheduler, store) = start(ProbeStore::default(), 1, 3);
    let p = PractitionerId(2);
    let at = tomorrow();
    let a = scheduler.submit(p, SubjectId(1), at, None).unwrap();
    let b = scheduler.submit(p, SubjectId(2), at + 30 * M, None).unwrap();
    assert!(outcome(&a).await.is_ok());
    assert!(outcome(&b).await.is_ok());
    assert_eq!(store.finds(), 2);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let store = ProbeStore::default();
    store.failing_finds.store(2, Ordering::SeqCst);
    let (scheduler, store) = start(store, 2, 5);

    let handle = scheduler
        .submit(PractitionerId(1), SubjectId(1), tomorrow(), None)
        .unwrap();
    assert!(outcome(&handle).await.is_ok());
    assert_eq!(store.finds(), 3);
    assert_eq!(store.creates(), 1);
}

#[tokio::test]
async fn exhaustion_names_max_attempts() {
    let store = ProbeStore::default();
    store.failing_finds.store(u32::MAX, Ordering::SeqCst);
    let (scheduler, store) = start(store, 2, 4);

    let handle = scheduler
        .submit(PractitionerId(1), SubjectId(1), tomorrow(), None)
        .unwrap();
    let err = outcome(&handle).await.unwrap_err();
    assert!(matches!(
        &err,
        AdmissionError::Exhausted { attempts: 4, cause }
            if matches!(**cause, AdmissionError::Store(StoreError::Unavailable(_)))
    ));
    assert!(err.to_string().contains("4 attempts"), "{err}");
    assert_eq!(store.finds(), 4);
    assert_eq!(store.creates(), 0);
}

#[tokio::test]
async fn single_attempt_budget_fails_without_retry() {
    let store = ProbeStore::default();
    store.failing_finds.store(1, Ordering::SeqCst);
    let (scheduler, store) = start(store, 1, 1);

    let handle = scheduler
        .submit(PractitionerId(1), SubjectId(1), tomorrow(), None)
        .unwrap();
    assert!(matches!(
        outcome(&handle).await,
        Err(AdmissionError::Exhausted { attempts: 1, .. })
    ));
    assert_eq!(store.finds(), 1);
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn cancelled_request_never_reaches_create() {
    let gate = Arc::new(Semaphore::new(0));
    let (scheduler, store) = start(ProbeStore::gated(gate.clone()), 1, 5);
    let at = tomorrow();

    let blocker = scheduler.submit(PractitionerId(1), SubjectId(1), at, None).unwrap();
    eventually("the only worker to pick up the blocker", || store.finds() == 1).await;

    let victim = scheduler.submit(PractitionerId(2), SubjectId(2), at, None).unwrap();
    assert!(victim.cancel());
    gate.add_permits(16);

    assert!(outcome(&blocker).await.is_ok());
    assert_eq!(outcome(&victim).await, Err(AdmissionError::Cancelled));
    eventually("the queue to drain", || scheduler.queue_depth() == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(store.finds(), 1);
    assert_eq!(*store.created_subjects.lock().unwrap(), vec![SubjectId(1)]);
}

#[tokio::test]
async fn cancelling_during_backoff_stops_retries() {
    let store = ProbeStore::default();
    store.failing_finds.store(u32::MAX, Ordering::SeqCst);
    let store = Arc::new(store);
    let config = AdmissionConfig {
        initial_backoff: Duration::from_millis(200),
        backoff_cap: Duration::from_millis(200),
        ..fast_config(1, 10)
    };
    let scheduler = AdmissionScheduler::start(store.clone(), config);

    let handle = scheduler
        .submit(PractitionerId(1), SubjectId(1), tomorrow(), None)
        .unwrap();
    eventually("the first attempt", || store.finds() == 1).await;
    assert!(handle.cancel());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.finds(), 1);
    assert_eq!(handle.try_result(), Some(Err(AdmissionError::Cancelled)));
}

// ── Delayed submission ───────────────────────────────────

#[tokio::test]
async fn delayed_submit_waits_before_touching_the_store() {
    let (scheduler, store) = start(ProbeStore::default(), 2, 5);
    let delay = Duration::from_millis(300);

    let submitted = Instant::now();
    let handle = scheduler
        .submit_with_delay(PractitionerId(1), SubjectId(1), tomorrow(), None, delay)
        .unwrap();
    assert!(!handle.is_resolved());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(store.finds(), 0);

    assert!(outcome(&handle).await.is_ok());
    let first_find = store.first_find_at.lock().unwrap().unwrap();
    assert!(first_find.duration_since(submitted) >= delay);
}

#[tokio::test]
async fn delayed_submit_is_rejected_on_shutdown() {
    let (scheduler, store) = start(ProbeStore::default(), 2, 5);
    let handle = scheduler
        .submit_with_delay(PractitionerId(1), SubjectId(1), tomorrow(), None, Duration::from_secs(60))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    scheduler.shutdown();
    assert_eq!(outcome(&handle).await, Err(AdmissionError::ShuttingDown));
    assert_eq!(store.finds(), 0);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn submit_after_shutdown_is_rejected_without_store_calls() {
    let (scheduler, store) = start(ProbeStore::default(), 2, 5);
    scheduler.shutdown();
    assert!(!scheduler.is_running());

    let handle = scheduler
        .submit(PractitionerId(1), SubjectId(1), tomorrow(), None)
        .unwrap();
    assert_eq!(handle.try_result(), Some(Err(AdmissionError::ShuttingDown)));

    let delayed = scheduler
        .submit_with_delay(PractitionerId(1), SubjectId(1), tomorrow(), None, Duration::from_millis(5))
        .unwrap();
    assert_eq!(delayed.try_result(), Some(Err(AdmissionError::ShuttingDown)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.finds(), 0);
    assert_eq!(store.creates(), 0);
}

#[tokio::test]
async fn shutdown_is_idempotent_and_stops_workers() {
    let (scheduler, _store) = start(ProbeStore::default(), 3, 5);
    eventually("workers to start", || scheduler.live_workers() == 3).await;

    scheduler.shutdown();
    scheduler.shutdown();
    eventually("workers to stop", || scheduler.live_workers() == 0).await;
}

#[tokio::test]
async fn shutdown_rejects_queued_requests() {
    let gate = Arc::new(Semaphore::new(0));
    let (scheduler, store) = start(ProbeStore::gated(gate.clone()), 1, 5);
    let at = tomorrow();

    let in_flight = scheduler.submit(PractitionerId(1), SubjectId(1), at, None).unwrap();
    eventually("the worker to pick up the first request", || store.finds() == 1).await;
    let queued = scheduler.submit(PractitionerId(2), SubjectId(2), at, None).unwrap();

    scheduler.shutdown();
    assert_eq!(queued.try_result(), Some(Err(AdmissionError::ShuttingDown)));

    // the in-flight attempt is not interrupted
    gate.add_permits(16);
    assert!(outcome(&in_flight).await.is_ok());
    assert_eq!(*store.created_subjects.lock().unwrap(), vec![SubjectId(1)]);
}

#[tokio::test]
async fn dropping_the_scheduler_shuts_it_down() {
    let (scheduler, store) = start(ProbeStore::default(), 1, 5);
    let handle = scheduler
        .submit_with_delay(PractitionerId(1), SubjectId(1), tomorrow(), None, Duration::from_secs(60))
        .unwrap();
    drop(scheduler);
    assert_eq!(outcome(&handle).await, Err(AdmissionError::ShuttingDown));
    assert_eq!(store.finds(), 0);
}

// ── Validation ───────────────────────────────────────────

#[tokio::test]
async fn invalid_input_is_rejected_synchronously() {
    let (scheduler, store) = start(ProbeStore::default(), 1, 5);
    let at = tomorrow();

    let cases = [
        scheduler.submit(PractitionerId(0), SubjectId(1), at, None),
        scheduler.submit(PractitionerId(1), SubjectId(0), at, None),
        scheduler.submit(PractitionerId(1), SubjectId(1), now_ms() - H, None),
        scheduler.submit(PractitionerId(1), SubjectId(1), 0, None),
        scheduler.submit(PractitionerId(1), SubjectId(1), at, Some("x".repeat(MAX_NOTES_LEN + 1))),
        scheduler.submit_with_delay(PractitionerId(1), SubjectId(1), at, None, Duration::from_secs(400 * 24 * 3600)),
    ];
    for result in cases {
        assert!(matches!(result, Err(AdmissionError::InvalidInput(_))));
    }

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(store.finds(), 0);
    assert_eq!(scheduler.queue_depth(), 0);
}

#[test]
fn validate_reports_the_first_problem() {
    let now = 1_800_000_000_000;
    assert_eq!(
        validate(PractitionerId(1), SubjectId(1), now - 1, None, Duration::ZERO, now),
        Err(AdmissionError::InvalidInput("start is in the past"))
    );
    assert_eq!(
        validate(PractitionerId(0), SubjectId(0), now - 1, None, Duration::ZERO, now),
        Err(AdmissionError::InvalidInput("practitioner id is required"))
    );
    assert!(validate(PractitionerId(1), SubjectId(1), now, Some("ok"), Duration::from_secs(60), now).is_ok());
}

// ── Fault containment ────────────────────────────────────

#[tokio::test]
async fn panicking_store_call_does_not_kill_the_worker() {
    let store = ProbeStore::default();
    store.panicking_finds.store(1, Ordering::SeqCst);
    let (scheduler, store) = start(store, 1, 5);
    let at = tomorrow();

    let doomed = scheduler.submit(PractitionerId(1), SubjectId(1), at, None).unwrap();
    assert!(matches!(outcome(&doomed).await, Err(AdmissionError::Internal(msg)) if msg.contains("injected")));

    let next = scheduler.submit(PractitionerId(1), SubjectId(2), at, None).unwrap();
    assert!(outcome(&next).await.is_ok());
    assert_eq!(scheduler.live_workers(), 1);
    assert_eq!(store.creates(), 1);
}

#[tokio::test]
async fn try_get_swallows_store_errors() {
    let (scheduler, store) = start(ProbeStore::default(), 1, 5);
    let handle = scheduler
        .submit(PractitionerId(1), SubjectId(1), tomorrow(), None)
        .unwrap();
    let id = outcome(&handle).await.unwrap();

    store.failing_lookups.store(true, Ordering::SeqCst);
    assert_eq!(scheduler.try_get(id).await, None);
    store.failing_lookups.store(false, Ordering::SeqCst);
    assert!(scheduler.try_get(id).await.is_some());
    assert_eq!(scheduler.try_get(Ulid::new()).await, None);
}

#[tokio::test]
async fn outcomes_are_published() {
    let (scheduler, _store) = start(ProbeStore::default(), 1, 5);
    let p = PractitionerId(9);
    let mut events = scheduler.subscribe(p);

    let handle = scheduler.submit(p, SubjectId(4), tomorrow(), None).unwrap();
    let id = outcome(&handle).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        AdmissionEvent::Admitted { booking_id, subject: SubjectId(4), attempt: 0, .. } if booking_id == id
    ));
}
