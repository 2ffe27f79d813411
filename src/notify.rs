use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Ms, PractitionerId, SubjectId};

const CHANNEL_CAPACITY: usize = 256;

/// What happened to one attempt of a booking request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    Admitted {
        booking_id: Ulid,
        subject: SubjectId,
        start: Ms,
        attempt: u32,
    },
    Retrying {
        subject: SubjectId,
        start: Ms,
        attempt: u32,
        delay_ms: Ms,
        reason: &'static str,
    },
    Failed {
        subject: SubjectId,
        start: Ms,
        error: String,
    },
}

/// Broadcast hub of admission outcomes per practitioner.
pub struct NotifyHub {
    channels: DashMap<PractitionerId, broadcast::Sender<AdmissionEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a practitioner's outcomes. Creates the channel if needed.
    pub fn subscribe(&self, practitioner: PractitionerId) -> broadcast::Receiver<AdmissionEvent> {
        self.channels
            .entry(practitioner)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Send a notification. No-op if nobody is listening; a channel whose
    /// subscribers have all gone away is removed.
    pub fn send(&self, practitioner: PractitionerId, event: AdmissionEvent) {
        let Some(sender) = self.channels.get(&practitioner) else {
            return;
        };
        if sender.send(event).is_err() {
            drop(sender);
            // a subscriber may have arrived since the failed send
            self.channels
                .remove_if(&practitioner, |_, tx| tx.receiver_count() == 0);
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
