//! Persistence boundary of the admission core.
//!
//! The scheduler only ever talks to a [`BookingStore`]. Two implementations
//! ship with the crate: [`MemoryStore`] and the log-backed [`WalStore`].

mod durable;
mod memory;

pub use durable::WalStore;
pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedSchedule = Arc<RwLock<Schedule>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached or refused the call.
    Unavailable(String),
    NotFound(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            StoreError::NotFound(id) => write!(f, "booking not found: {id}"),
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Booking persistence consumed by the admission workers.
///
/// Every method may be called concurrently from several workers.
/// `find_conflicts` and `create_booking` are separate calls: nothing here
/// makes the pair atomic.
#[async_trait]
pub trait BookingStore: Send + Sync + 'static {
    /// Active bookings of `practitioner` whose window intersects `window`.
    async fn find_conflicts(
        &self,
        practitioner: PractitionerId,
        window: Span,
    ) -> Result<Vec<ConflictRecord>, StoreError>;

    /// Persist a new booking and return its freshly assigned id.
    async fn create_booking(
        &self,
        practitioner: PractitionerId,
        subject: SubjectId,
        window: Span,
        status: BookingStatus,
        notes: Option<String>,
    ) -> Result<Ulid, StoreError>;

    /// `Ok(None)` when no booking has this id.
    async fn lookup_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;
}
