use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

use super::{BookingStore, MemoryStore, StoreError};

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the log and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then flushes and fsyncs once for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch: Vec<Pending> = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // control commands see everything appended before them
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-buffered bytes never leak into the next batch.
    let flushed = wal.flush_sync();
    let result = appended.and(flushed);

    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let _ = response.send(wal.compact(&snapshot));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Durable booking store: a [`MemoryStore`] whose every change is logged first.
pub struct WalStore {
    books: MemoryStore,
    wal_tx: mpsc::Sender<WalCommand>,
    path: PathBuf,
    /// Writers hold it shared; compaction holds it exclusively so no append
    /// can land between the snapshot and the file swap.
    compaction: RwLock<()>,
}

impl WalStore {
    /// Replay the log at `path` and start its writer task. Needs a tokio runtime.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let events = Wal::replay(&path)?;
        let wal = Wal::open(&path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let books = MemoryStore::new();
        // Sole owner of every schedule here, so try_write never contends.
        for event in &events {
            let schedule = books.schedule_or_create(event.practitioner());
            let mut guard = schedule
                .try_write()
                .map_err(|_| io::Error::other("replay: schedule unexpectedly locked"))?;
            books.apply(&mut guard, event);
        }
        info!(
            "booking log {} replayed: {} events, {} bookings",
            path.display(),
            events.len(),
            books.booking_count()
        );

        Ok(Self {
            books,
            wal_tx,
            path,
            compaction: RwLock::new(()),
        })
    }

    /// Read-side view of the replayed state.
    pub fn books(&self) -> &MemoryStore {
        &self.books
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn update_status(&self, id: Ulid, status: BookingStatus) -> Result<Booking, StoreError> {
        let _gate = self.compaction.read().await;
        let mut guard = self.books.resolve_write(id).await?;
        let event = Event::StatusChanged {
            id,
            practitioner: guard.practitioner,
            status,
        };
        self.wal_append(&event).await?;
        self.books.apply(&mut guard, &event);
        guard.get(id).cloned().ok_or(StoreError::NotFound(id))
    }

    pub async fn appends_since_compact(&self) -> Result<u64, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))
    }

    /// Rewrite the log as one record per live booking.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.compaction.write().await;
        let snapshot = self.books.snapshot().await;
        let count = snapshot.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))?;
        info!("booking log {} compacted to {count} records", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl BookingStore for WalStore {
    async fn find_conflicts(
        &self,
        practitioner: PractitionerId,
        window: Span,
    ) -> Result<Vec<ConflictRecord>, StoreError> {
        self.books.find_conflicts(practitioner, window).await
    }

    async fn create_booking(
        &self,
        practitioner: PractitionerId,
        subject: SubjectId,
        window: Span,
        status: BookingStatus,
        notes: Option<String>,
    ) -> Result<Ulid, StoreError> {
        let _gate = self.compaction.read().await;
        let schedule = self.books.schedule_or_create(practitioner);
        let mut guard = schedule.write().await;
        MemoryStore::check_room(&guard)?;
        let id = Ulid::new();
        let event = Event::BookingCreated {
            id,
            practitioner,
            subject,
            span: window,
            status,
            notes,
        };
        self.wal_append(&event).await?;
        self.books.apply(&mut guard, &event);
        Ok(id)
    }

    async fn lookup_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.books.get(id).await)
    }
}
