use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::observability::{ADMISSIONS_TOTAL, QUEUE_DEPTH};

use super::{AdmissionError, BookingRequest};

/// Unbounded FIFO shared by all workers, plus the scheduler-wide running flag.
///
/// `enqueue` checks the flag and `close` flips it under the same lock, so a
/// request is either drained by `close` or rejected. Never stranded.
pub struct AdmissionQueue {
    items: Mutex<VecDeque<BookingRequest>>,
    ready: Notify,
    running: AtomicBool,
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            running: AtomicBool::new(true),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<BookingRequest>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Append `request`, or resolve it as `ShuttingDown` once closed.
    pub fn enqueue(&self, request: BookingRequest) -> bool {
        {
            let mut items = self.items();
            if !self.is_running() {
                drop(items);
                if request.resolve(Err(AdmissionError::ShuttingDown)) {
                    metrics::counter!(ADMISSIONS_TOTAL, "outcome" => "rejected").increment(1);
                }
                return false;
            }
            items.push_back(request);
            metrics::gauge!(QUEUE_DEPTH).set(items.len() as f64);
        }
        self.ready.notify_one();
        true
    }

    pub fn try_pop(&self) -> Option<BookingRequest> {
        let mut items = self.items();
        let request = items.pop_front();
        if request.is_some() {
            metrics::gauge!(QUEUE_DEPTH).set(items.len() as f64);
        }
        request
    }

    /// Next request, waiting at most `wait` for one to arrive.
    pub async fn pop(&self, wait: Duration) -> Option<BookingRequest> {
        if let Some(request) = self.try_pop() {
            return Some(request);
        }
        if !self.is_running() {
            return None;
        }
        let _ = tokio::time::timeout(wait, self.ready.notified()).await;
        self.try_pop()
    }

    /// Stop accepting work and hand back whatever was still queued.
    /// `None` if the queue was already closed.
    pub fn close(&self) -> Option<Vec<BookingRequest>> {
        let leftover = {
            let mut items = self.items();
            if !self.running.swap(false, Ordering::AcqRel) {
                return None;
            }
            let leftover: Vec<_> = items.drain(..).collect();
            metrics::gauge!(QUEUE_DEPTH).set(0.0);
            leftover
        };
        self.ready.notify_waiters();
        Some(leftover)
    }
}
