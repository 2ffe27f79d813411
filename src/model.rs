use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Convert a `Duration` to `Ms`, saturating at `Ms::MAX`.
pub fn duration_ms(d: Duration) -> Ms {
    Ms::try_from(d.as_millis()).unwrap_or(Ms::MAX)
}

/// Whether `[a_start, a_end)` and `[b_start, b_end)` intersect.
pub fn overlaps(a_start: Ms, a_end: Ms, b_start: Ms, b_end: Ms) -> bool {
    a_start < b_end && b_start < a_end
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// The window of a fixed-length slot starting at `start`.
    pub fn slot(start: Ms, length: Ms) -> Self {
        Self::new(start, start.saturating_add(length))
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Ids are positive; zero stands for "missing".
            pub fn is_valid(&self) -> bool {
                self.0 > 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

opaque_id!(
    /// The doctor, nurse or room a booking is made against.
    PractitionerId
);
opaque_id!(
    /// The patient a booking is made for.
    SubjectId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Scheduled,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    /// Active bookings occupy their window; everything else frees it.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Scheduled | BookingStatus::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Scheduled => "SCHEDULED",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::NoShow => "NO_SHOW",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub practitioner: PractitionerId,
    pub subject: SubjectId,
    pub span: Span,
    pub status: BookingStatus,
    pub notes: Option<String>,
}

/// An existing active booking whose window intersects a requested one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub booking_id: Ulid,
    pub practitioner: PractitionerId,
    pub span: Span,
    pub status: BookingStatus,
}

impl From<&Booking> for ConflictRecord {
    fn from(b: &Booking) -> Self {
        Self {
            booking_id: b.id,
            practitioner: b.practitioner,
            span: b.span,
            status: b.status,
        }
    }
}

/// All bookings of one practitioner, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub practitioner: PractitionerId,
    pub bookings: Vec<Booking>,
}

impl Schedule {
    pub fn new(practitioner: PractitionerId) -> Self {
        Self {
            practitioner,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Active bookings that would collide with `query`.
    pub fn conflicts(&self, query: &Span) -> Vec<ConflictRecord> {
        self.overlapping(query)
            .filter(|b| b.status.is_active() && b.span.overlaps(query))
            .map(ConflictRecord::from)
            .collect()
    }
}

/// Record format of the booking log. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        id: Ulid,
        practitioner: PractitionerId,
        subject: SubjectId,
        span: Span,
        status: BookingStatus,
        notes: Option<String>,
    },
    StatusChanged {
        id: Ulid,
        practitioner: PractitionerId,
        status: BookingStatus,
    },
}

impl Event {
    pub fn practitioner(&self) -> PractitionerId {
        match self {
            Event::BookingCreated { practitioner, .. } | Event::StatusChanged { practitioner, .. } => {
                *practitioner
            }
        }
    }
}
