//! Structured access log for the mint and verify endpoints.
//!
//! Request handlers hand finished records to [`AccessLogger::log`], which
//! never blocks: records go through a bounded queue to a single writer task
//! that appends JSON lines to the log file and keeps running statistics.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AccessLogConfig;

const QUEUE_CAPACITY: usize = 1000;
const TOP_CALLERS: usize = 100;
const HOUR: Duration = Duration::from_secs(60 * 60);

/// Errors raised while managing the log file.
#[derive(Debug, thiserror::Error)]
pub enum AccessLogError {
    /// The log file or its directory could not be opened or renamed.
    #[error("access log {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
    /// The writer task has already stopped.
    #[error("access log writer has stopped")]
    Closed,
}

/// Whether a request was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessResult {
    /// Granted: a mint redirect or an allowed verify.
    Success,
    /// Anything else.
    Failed,
}

/// One finished request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRecord {
    /// When the request finished.
    pub timestamp: DateTime<Utc>,
    /// Peer address of the caller.
    pub remote_ip: String,
    /// HTTP method.
    pub method: String,
    /// Request URI, credentials masked.
    pub uri: String,
    /// Response status code.
    pub status: u16,
    /// Masked credential, when the request carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    /// `User-Agent` header.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    /// `Referer` header.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub referer: String,
    /// Handling time.
    pub duration_ms: u64,
    /// Outcome class.
    pub result: AccessResult,
    /// Outcome label.
    pub reason: String,
    /// `Location` header of a redirect, credentials masked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    /// Path the caller asked for, when it differs from the URI path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_path: Option<String>,
}

/// Counters for the current hour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyStats {
    /// Requests this hour.
    pub requests: u64,
    /// Granted requests this hour.
    pub success: u64,
    /// Refused requests this hour.
    pub failed: u64,
}

/// Per-caller counters, keyed by masked credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerStats {
    /// Masked credential.
    pub credential: String,
    /// Requests seen.
    pub requests: u64,
    /// Time of the most recent request.
    pub last_seen: DateTime<Utc>,
}

/// Snapshot of access statistics since startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessStats {
    /// All requests.
    pub total_requests: u64,
    /// Granted requests.
    pub success_requests: u64,
    /// Refused requests.
    pub failed_requests: u64,
    /// Refusals by reason.
    pub fail_reasons: BTreeMap<String, u64>,
    /// Counters reset every hour.
    pub last_hour: HourlyStats,
    /// The first callers seen, capped.
    pub top_callers: Vec<CallerStats>,
}

impl AccessStats {
    fn record(&mut self, record: &AccessRecord) {
        self.total_requests += 1;
        self.last_hour.requests += 1;
        match record.result {
            AccessResult::Success => {
                self.success_requests += 1;
                self.last_hour.success += 1;
            }
            AccessResult::Failed => {
                self.failed_requests += 1;
                self.last_hour.failed += 1;
                if !record.reason.is_empty() {
                    *self.fail_reasons.entry(record.reason.clone()).or_default() += 1;
                }
            }
        }

        let Some(credential) = record.credential.as_deref().filter(|c| !c.is_empty()) else {
            return;
        };
        if let Some(caller) = self.top_callers.iter_mut().find(|c| c.credential == credential) {
            caller.requests += 1;
            caller.last_seen = record.timestamp;
        } else if self.top_callers.len() < TOP_CALLERS {
            self.top_callers.push(CallerStats {
                credential: credential.to_string(),
                requests: 1,
                last_seen: record.timestamp,
            });
        }
    }
}

enum Command {
    Record(Box<AccessRecord>),
    Rotate(oneshot::Sender<Result<Option<PathBuf>, AccessLogError>>),
    Shutdown(oneshot::Sender<()>),
}

/// Asynchronous JSON-lines access logger with running statistics.
pub struct AccessLogger {
    tx: mpsc::Sender<Command>,
    stats: Arc<RwLock<AccessStats>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for AccessLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessLogger")
            .field("queued", &(QUEUE_CAPACITY - self.tx.capacity()))
            .finish_non_exhaustive()
    }
}

impl AccessLogger {
    /// Open the log file (when enabled) and start the writer task.
    pub async fn start(config: &AccessLogConfig) -> Result<Self, AccessLogError> {
        let sink = if config.enabled {
            let file = open_append(&config.path).await?;
            info!(path = %config.path.display(), "access log opened");
            Some(Sink {
                path: config.path.clone(),
                file,
            })
        } else {
            None
        };

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let stats = Arc::new(RwLock::new(AccessStats::default()));
        let task = tokio::spawn(write_loop(rx, sink, Arc::clone(&stats)));

        Ok(Self {
            tx,
            stats,
            task: Mutex::new(Some(task)),
        })
    }

    /// Queue a record. Drops it with a warning when the queue is full.
    pub fn log(&self, record: AccessRecord) {
        match self.tx.try_send(Command::Record(Box::new(record))) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("access log queue full, dropping record")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("access log closed, dropping record")
            }
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> AccessStats {
        self.stats.read().clone()
    }

    /// Move the current file aside with a timestamp suffix and start a new
    /// one. Returns the rotated path, or `None` when file logging is off.
    pub async fn rotate(&self) -> Result<Option<PathBuf>, AccessLogError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Rotate(ack))
            .await
            .map_err(|_| AccessLogError::Closed)?;
        done.await.map_err(|_| AccessLogError::Closed)?
    }

    /// Stop accepting records, write everything already queued and close
    /// the file. Waits at most `grace` in total, queueing the stop included.
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        let (ack, done) = oneshot::channel();
        match tokio::time::timeout_at(deadline, self.tx.send(Command::Shutdown(ack))).await {
            Ok(Ok(())) => {
                if tokio::time::timeout_at(deadline, done).await.is_err() {
                    warn!("access log did not drain in time");
                }
            }
            Ok(Err(_)) => debug!("access log writer already stopped"),
            Err(_) => warn!("access log queue stayed full, abandoning queued records"),
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if !task.is_finished() {
                task.abort();
            }
        }
    }
}

struct Sink {
    path: PathBuf,
    file: File,
}

impl Sink {
    async fn write(&mut self, record: &AccessRecord) {
        let mut line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "cannot serialize access record");
                return;
            }
        };
        line.push(b'\n');
        if let Err(e) = self.file.write_all(&line).await {
            error!(path = %self.path.display(), error = %e, "access log write failed");
        }
    }

    async fn rotate(&mut self) -> Result<PathBuf, AccessLogError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| AccessLogError::Io { path, source }
        };
        self.file.flush().await.map_err(io_err(&self.path))?;

        let suffix = Utc::now().format("%Y%m%d-%H%M%S");
        let mut rotated = self.path.clone().into_os_string();
        rotated.push(format!(".{suffix}"));
        let rotated = PathBuf::from(rotated);

        tokio::fs::rename(&self.path, &rotated)
            .await
            .map_err(io_err(&rotated))?;
        self.file = open_append(&self.path).await?;
        info!(from = %self.path.display(), to = %rotated.display(), "access log rotated");
        Ok(rotated)
    }

    async fn close(&mut self) {
        if let Err(e) = self.file.flush().await {
            error!(path = %self.path.display(), error = %e, "access log flush failed");
        }
    }
}

async fn open_append(path: &Path) -> Result<File, AccessLogError> {
    let io_err = |source| AccessLogError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(io_err)
}

async fn write_loop(
    mut rx: mpsc::Receiver<Command>,
    mut sink: Option<Sink>,
    stats: Arc<RwLock<AccessStats>>,
) {
    let mut hourly = tokio::time::interval(HOUR);
    hourly.tick().await;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Record(record)) => {
                    handle_record(&record, sink.as_mut(), &stats).await;
                }
                Some(Command::Rotate(ack)) => {
                    let result = match sink.as_mut() {
                        Some(sink) => sink.rotate().await.map(Some),
                        None => Ok(None),
                    };
                    let _ = ack.send(result);
                }
                Some(Command::Shutdown(ack)) => {
                    rx.close();
                    while let Some(command) = rx.recv().await {
                        if let Command::Record(record) = command {
                            handle_record(&record, sink.as_mut(), &stats).await;
                        }
                    }
                    if let Some(sink) = sink.as_mut() {
                        sink.close().await;
                    }
                    info!("access log closed");
                    let _ = ack.send(());
                    return;
                }
                None => {
                    if let Some(sink) = sink.as_mut() {
                        sink.close().await;
                    }
                    return;
                }
            },
            _ = hourly.tick() => {
                stats.write().last_hour = HourlyStats::default();
                debug!("hourly access stats reset");
            }
        }
    }
}

async fn handle_record(
    record: &AccessRecord,
    sink: Option<&mut Sink>,
    stats: &RwLock<AccessStats>,
) {
    if let Some(sink) = sink {
        sink.write(record).await;
    }
    stats.write().record(record);
}
