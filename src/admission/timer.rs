use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::time::DelayQueue;
use tracing::{debug, info};

use crate::observability::{ADMISSIONS_TOTAL, DELAYED_PENDING};

use super::{AdmissionError, AdmissionQueue, BookingRequest};

/// `DelayQueue` refuses deadlines beyond roughly two years.
const MAX_TIMER_DELAY: Duration = Duration::from_secs(365 * 24 * 3600);

/// Sending side of the single shared timer.
#[derive(Clone)]
pub struct DelayScheduler {
    tx: mpsc::UnboundedSender<(BookingRequest, Duration)>,
}

impl DelayScheduler {
    /// Spawn the timer task feeding `queue`. It exits once the queue stops running.
    pub fn spawn(queue: Arc<AdmissionQueue>, poll_interval: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(timer_loop(queue, rx, poll_interval));
        (Self { tx }, task)
    }

    /// Enqueue `request` once `delay` has elapsed. After the timer has
    /// stopped the request is resolved as `ShuttingDown` instead.
    pub fn schedule(&self, request: BookingRequest, delay: Duration) {
        if let Err(mpsc::error::SendError((request, _))) = self.tx.send((request, delay.min(MAX_TIMER_DELAY))) {
            reject(&request);
        }
    }
}

fn reject(request: &BookingRequest) {
    if request.resolve(Err(AdmissionError::ShuttingDown)) {
        metrics::counter!(ADMISSIONS_TOTAL, "outcome" => "rejected").increment(1);
    }
}

async fn timer_loop(
    queue: Arc<AdmissionQueue>,
    mut rx: mpsc::UnboundedReceiver<(BookingRequest, Duration)>,
    poll_interval: Duration,
) {
    let mut timers: DelayQueue<u64> = DelayQueue::new();
    let mut parked: HashMap<u64, BookingRequest> = HashMap::new();
    let mut next_token = 0u64;
    let mut tick = tokio::time::interval(poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some((request, delay)) = cmd else { break };
                let token = next_token;
                next_token += 1;
                timers.insert(token, delay);
                parked.insert(token, request);
                metrics::gauge!(DELAYED_PENDING).set(parked.len() as f64);
            }
            Some(expired) = timers.next(), if !timers.is_empty() => {
                if let Some(request) = parked.remove(&expired.into_inner()) {
                    metrics::gauge!(DELAYED_PENDING).set(parked.len() as f64);
                    debug!(
                        "timer released request for practitioner {} (attempt {})",
                        request.practitioner(),
                        request.attempt()
                    );
                    queue.enqueue(request);
                }
            }
            _ = tick.tick() => {
                if !queue.is_running() {
                    break;
                }
            }
        }
    }

    rx.close();
    let mut abandoned = parked.len();
    for (_, request) in parked.drain() {
        reject(&request);
    }
    while let Ok((request, _)) = rx.try_recv() {
        abandoned += 1;
        reject(&request);
    }
    metrics::gauge!(DELAYED_PENDING).set(0.0);
    info!("delay scheduler stopped, {abandoned} delayed requests rejected");
}
