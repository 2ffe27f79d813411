use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::MAX_BOOKINGS_PER_PRACTITIONER;
use crate::model::*;

use super::{BookingStore, SharedSchedule, StoreError};

/// Volatile booking store: one locked schedule per practitioner plus an id index.
pub struct MemoryStore {
    schedules: DashMap<PractitionerId, SharedSchedule>,
    /// Reverse lookup: booking id → practitioner
    index: DashMap<Ulid, PractitionerId>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            schedules: DashMap::new(),
            index: DashMap::new(),
        }
    }

    pub fn booking_count(&self) -> usize {
        self.index.len()
    }

    pub fn schedule(&self, practitioner: PractitionerId) -> Option<SharedSchedule> {
        self.schedules.get(&practitioner).map(|e| e.value().clone())
    }

    pub(crate) fn schedule_or_create(&self, practitioner: PractitionerId) -> SharedSchedule {
        self.schedules
            .entry(practitioner)
            .or_insert_with(|| Arc::new(RwLock::new(Schedule::new(practitioner))))
            .clone()
    }

    /// Lookup booking → practitioner, acquire that schedule's write lock.
    pub(crate) async fn resolve_write(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<Schedule>, StoreError> {
        let practitioner = self
            .index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))?;
        let schedule = self
            .schedule(practitioner)
            .ok_or(StoreError::NotFound(id))?;
        Ok(schedule.write_owned().await)
    }

    pub(crate) fn check_room(schedule: &Schedule) -> Result<(), StoreError> {
        if schedule.bookings.len() >= MAX_BOOKINGS_PER_PRACTITIONER {
            return Err(StoreError::LimitExceeded("too many bookings for practitioner"));
        }
        Ok(())
    }

    /// Apply an event to a schedule (caller holds the lock).
    pub(crate) fn apply(&self, schedule: &mut Schedule, event: &Event) {
        match event {
            Event::BookingCreated {
                id,
                practitioner,
                subject,
                span,
                status,
                notes,
            } => {
                schedule.insert(Booking {
                    id: *id,
                    practitioner: *practitioner,
                    subject: *subject,
                    span: *span,
                    status: *status,
                    notes: notes.clone(),
                });
                self.index.insert(*id, *practitioner);
            }
            Event::StatusChanged { id, status, .. } => {
                if let Some(booking) = schedule.get_mut(*id) {
                    booking.status = *status;
                }
            }
        }
    }

    /// One `BookingCreated` per booking, carrying its current status.
    pub async fn snapshot(&self) -> Vec<Event> {
        let schedules: Vec<SharedSchedule> =
            self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::with_capacity(self.index.len());
        for schedule in schedules {
            let guard = schedule.read().await;
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated {
                id: b.id,
                practitioner: b.practitioner,
                subject: b.subject,
                span: b.span,
                status: b.status,
                notes: b.notes.clone(),
            }));
        }
        events
    }

    pub async fn get(&self, id: Ulid) -> Option<Booking> {
        let practitioner = *self.index.get(&id)?.value();
        let schedule = self.schedule(practitioner)?;
        let guard = schedule.read().await;
        guard.get(id).cloned()
    }

    /// All bookings of a practitioner intersecting `window`, any status.
    pub async fn bookings_for(&self, practitioner: PractitionerId, window: Span) -> Vec<Booking> {
        let Some(schedule) = self.schedule(practitioner) else {
            return vec![];
        };
        let guard = schedule.read().await;
        guard.overlapping(&window).cloned().collect()
    }

    pub async fn update_status(&self, id: Ulid, status: BookingStatus) -> Result<Booking, StoreError> {
        let mut guard = self.resolve_write(id).await?;
        let practitioner = guard.practitioner;
        self.apply(&mut guard, &Event::StatusChanged { id, practitioner, status });
        guard.get(id).cloned().ok_or(StoreError::NotFound(id))
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn find_conflicts(
        &self,
        practitioner: PractitionerId,
        window: Span,
    ) -> Result<Vec<ConflictRecord>, StoreError> {
        let Some(schedule) = self.schedule(practitioner) else {
            return Ok(vec![]);
        };
        let guard = schedule.read().await;
        Ok(guard.conflicts(&window))
    }

    async fn create_booking(
        &self,
        practitioner: PractitionerId,
        subject: SubjectId,
        window: Span,
        status: BookingStatus,
        notes: Option<String>,
    ) -> Result<Ulid, StoreError> {
        let schedule = self.schedule_or_create(practitioner);
        let mut guard = schedule.write().await;
        Self::check_room(&guard)?;
        let id = Ulid::new();
        let event = Event::BookingCreated {
            id,
            practitioner,
            subject,
            span: window,
            status,
            notes,
        };
        self.apply(&mut guard, &event);
        Ok(id)
    }

    async fn lookup_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.get(id).await)
    }
}
