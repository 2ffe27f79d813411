use crate::model::*;

use super::handle::{CompletionHandle, Outcome};

/// One booking attempt waiting for a worker. Never mutated: a retry is a new
/// value with `attempt + 1` that shares the original handle.
#[derive(Debug, Clone)]
pub struct BookingRequest {
    practitioner: PractitionerId,
    subject: SubjectId,
    start: Ms,
    notes: Option<String>,
    status: Option<BookingStatus>,
    attempt: u32,
    handle: CompletionHandle,
}

impl BookingRequest {
    pub(crate) fn new(
        practitioner: PractitionerId,
        subject: SubjectId,
        start: Ms,
        notes: Option<String>,
        status: Option<BookingStatus>,
        handle: CompletionHandle,
    ) -> Self {
        Self {
            practitioner,
            subject,
            start,
            notes,
            status,
            attempt: 0,
            handle,
        }
    }

    pub fn practitioner(&self) -> PractitionerId {
        self.practitioner
    }

    pub fn subject(&self) -> SubjectId {
        self.subject
    }

    pub fn start(&self) -> Ms {
        self.start
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }

    /// Status to create the booking with, `Scheduled` when unset.
    pub fn status(&self) -> BookingStatus {
        self.status.unwrap_or(BookingStatus::Scheduled)
    }

    /// Prior tries; 0 on the first attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn handle(&self) -> &CompletionHandle {
        &self.handle
    }

    /// `[start, start + slot)`.
    pub fn window(&self, slot: Ms) -> Span {
        Span::slot(self.start, slot)
    }

    pub(crate) fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    pub(crate) fn resolve(&self, outcome: Outcome) -> bool {
        self.handle.resolve(outcome)
    }
}
