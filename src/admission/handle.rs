use std::future::IntoFuture;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;
use ulid::Ulid;

use super::AdmissionError;

pub type Outcome = Result<Ulid, AdmissionError>;

/// Write-once result slot of one booking request.
///
/// Clones share the slot. The first `resolve` wins and later ones are
/// ignored; the value can then be read any number of times. Resolving it from
/// outside (see [`CompletionHandle::cancel`]) is how a caller gives up on a
/// request: workers drop requests whose handle is already resolved.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    slot: Arc<watch::Sender<Option<Outcome>>>,
}

impl Default for CompletionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { slot: Arc::new(tx) }
    }

    /// Store `outcome` unless a value is already there. Returns whether it was stored.
    pub(crate) fn resolve(&self, outcome: Outcome) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    /// Resolve with [`AdmissionError::Cancelled`]. `false` if already resolved.
    pub fn cancel(&self) -> bool {
        self.resolve(Err(AdmissionError::Cancelled))
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Non-blocking peek.
    pub fn try_result(&self) -> Option<Outcome> {
        self.slot.borrow().clone()
    }

    /// Wait for the outcome.
    pub async fn wait(&self) -> Outcome {
        let mut rx = self.slot.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot
                .clone()
                .unwrap_or_else(|| Err(AdmissionError::Internal("empty completion slot".into()))),
            // unreachable while `self` holds the sender
            Err(_) => Err(AdmissionError::Internal("completion slot closed".into())),
        }
    }

    /// Whether both handles share one slot.
    pub fn same_slot(&self, other: &CompletionHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl IntoFuture for CompletionHandle {
    type Output = Outcome;
    type IntoFuture = BoxFuture<'static, Outcome>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}
