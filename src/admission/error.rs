use ulid::Ulid;

use crate::model::PractitionerId;
use crate::store::StoreError;

/// Every way a booking request can fail. Cloneable so a resolved handle can be
/// read any number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// Rejected at submission; never queued, never retried.
    InvalidInput(&'static str),
    /// The practitioner already has an active booking in the window.
    Conflict {
        practitioner: PractitionerId,
        existing: Ulid,
    },
    /// The store failed a call.
    Store(StoreError),
    /// The attempt budget ran out; `cause` is the last failure.
    Exhausted {
        attempts: u32,
        cause: Box<AdmissionError>,
    },
    ShuttingDown,
    Cancelled,
    /// A worker caught a panic while processing the request.
    Internal(String),
}

impl AdmissionError {
    /// Conflicts and store failures count against the attempt budget;
    /// everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdmissionError::Conflict { .. } | AdmissionError::Store(_))
    }
}

impl std::fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::InvalidInput(msg) => write!(f, "invalid booking request: {msg}"),
            AdmissionError::Conflict {
                practitioner,
                existing,
            } => write!(
                f,
                "practitioner {practitioner} is already booked in this window (booking {existing})"
            ),
            AdmissionError::Store(e) => write!(f, "{e}"),
            AdmissionError::Exhausted { attempts, cause } => {
                write!(f, "booking not admitted after {attempts} attempts: {cause}")
            }
            AdmissionError::ShuttingDown => write!(f, "rejected: scheduler is shutting down"),
            AdmissionError::Cancelled => write!(f, "cancelled by caller"),
            AdmissionError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for AdmissionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AdmissionError::Store(e) => Some(e),
            AdmissionError::Exhausted { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl From<StoreError> for AdmissionError {
    fn from(e: StoreError) -> Self {
        AdmissionError::Store(e)
    }
}
