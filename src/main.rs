use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{info, warn};
use ulid::Ulid;

use admitd::admission::{AdmissionScheduler, CompletionHandle};
use admitd::config::AdmissionConfig;
use admitd::model::{BookingStatus, Ms, PractitionerId, SubjectId};
use admitd::store::{BookingStore, WalStore};

/// One line of input.
#[derive(Debug, Deserialize)]
struct RequestLine {
    practitioner: u64,
    subject: u64,
    start: Ms,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    delay_ms: u64,
    #[serde(default)]
    status: Option<BookingStatus>,
}

/// One line of output per input line, in completion order.
#[derive(Debug, Serialize)]
struct OutcomeLine {
    line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    booking_id: Option<Ulid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl OutcomeLine {
    fn print(&self) {
        match serde_json::to_string(self) {
            Ok(json) => println!("{json}"),
            Err(e) => warn!("failed to encode outcome for line {}: {e}", self.line),
        }
    }
}

fn submit(
    scheduler: &AdmissionScheduler<WalStore>,
    req: RequestLine,
) -> Result<CompletionHandle, admitd::admission::AdmissionError> {
    let practitioner = PractitionerId(req.practitioner);
    let subject = SubjectId(req.subject);
    match (req.status, req.delay_ms) {
        (Some(status), _) => scheduler.submit_with_status(practitioner, subject, req.start, req.notes, status),
        (None, 0) => scheduler.submit(practitioner, subject, req.start, req.notes),
        (None, ms) => scheduler.submit_with_delay(
            practitioner,
            subject,
            req.start,
            req.notes,
            Duration::from_millis(ms),
        ),
    }
}

/// Wait until every outstanding request has printed its outcome. A signal
/// during the wait shuts the scheduler down, which resolves whatever is still
/// queued or delayed, so the wait ends promptly.
async fn drain<S: BookingStore>(
    scheduler: &AdmissionScheduler<S>,
    pending: &mut JoinSet<()>,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    info!("waiting for {} outstanding requests", pending.len());
    loop {
        tokio::select! {
            joined = pending.join_next() => {
                if joined.is_none() {
                    break;
                }
            }
            _ = &mut shutdown, if scheduler.is_running() => {
                info!("shutdown signal received, rejecting outstanding requests");
                scheduler.shutdown();
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let metrics_port: Option<u16> = std::env::var("ADMITD_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    admitd::observability::init(metrics_port)?;

    let data_dir = std::env::var("ADMITD_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let compact_threshold: u64 = std::env::var("ADMITD_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);
    let config = AdmissionConfig::from_env();

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("bookings.wal");
    let store = Arc::new(WalStore::open(&wal_path)?);
    let scheduler = AdmissionScheduler::start(store.clone(), config);
    info!("admitd reading requests from stdin");
    info!("  wal: {}", wal_path.display());
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Stop reading on SIGTERM/ctrl-c
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("failed to register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = JoinSet::new();
    let mut line_no = 0usize;
    let mut interrupted = false;

    loop {
        tokio::select! {
            next = lines.next_line() => {
                let line = match next {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdin read error: {e}");
                        break;
                    }
                };
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }

                let handle = serde_json::from_str::<RequestLine>(&line)
                    .map_err(|e| format!("malformed request: {e}"))
                    .and_then(|req| submit(&scheduler, req).map_err(|e| e.to_string()));
                match handle {
                    Ok(handle) => {
                        let line = line_no;
                        pending.spawn(async move {
                            let outcome = handle.await;
                            OutcomeLine {
                                line,
                                booking_id: outcome.as_ref().ok().copied(),
                                error: outcome.err().map(|e| e.to_string()),
                            }
                            .print();
                        });
                    }
                    Err(error) => OutcomeLine {
                        line: line_no,
                        booking_id: None,
                        error: Some(error),
                    }
                    .print(),
                }
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping input");
                interrupted = true;
                break;
            }
        }
    }

    // On a signal, reject what is still queued before waiting; on EOF let it
    // finish unless a signal arrives meanwhile.
    if interrupted {
        scheduler.shutdown();
    }
    drain(&scheduler, &mut pending, &mut shutdown).await;
    scheduler.shutdown();

    match store.appends_since_compact().await {
        Ok(n) if n >= compact_threshold => {
            if let Err(e) = store.compact().await {
                warn!("compaction failed: {e}");
            }
        }
        Ok(_) => {}
        Err(e) => warn!("could not read log state: {e}"),
    }

    info!("admitd stopped");
    Ok(())
}
