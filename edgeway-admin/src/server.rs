//! Unix socket listener for the control plane.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::{handle_line, AdminError, FleetControl};

/// How long open connections get to finish their current request on shutdown.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Accepts control connections on a Unix socket.
#[derive(Debug)]
pub struct AdminServer {
    path: PathBuf,
    listener: UnixListener,
}

impl AdminServer {
    /// Bind the socket, replacing a stale socket file left by a previous run.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, AdminError> {
        let path = path.as_ref().to_path_buf();
        let bind_err = |source| AdminError::Bind {
            path: path.display().to_string(),
            source,
        };

        match std::fs::remove_file(&path) {
            Ok(()) => debug!(socket = %path.display(), "removed stale admin socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_err(e)),
        }
        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        Ok(Self { path, listener })
    }

    /// Path of the bound socket.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serve connections until `shutdown` turns true, then close open
    /// connections and remove the socket file.
    pub async fn serve(self, control: Arc<dyn FleetControl>, mut shutdown: watch::Receiver<bool>) {
        info!(socket = %self.path.display(), "admin socket listening");
        let path = self.path;
        let mut incoming = UnixListenerStream::new(self.listener);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                next = incoming.next() => match next {
                    Some(Ok(stream)) => {
                        let control = Arc::clone(&control);
                        connections.spawn(handle_connection(stream, control, shutdown.clone()));
                    }
                    Some(Err(e)) => warn!(error = %e, "admin accept failed"),
                    None => break,
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => break,
            }
        }

        drop(incoming);
        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = connections.len(), "admin connections still open, aborting them");
            connections.abort_all();
        }

        if let Err(e) = std::fs::remove_file(&path) {
            debug!(socket = %path.display(), error = %e, "could not remove admin socket");
        }
        info!("admin socket closed");
    }
}

async fn handle_connection(
    stream: UnixStream,
    control: Arc<dyn FleetControl>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let next = tokio::select! {
            next = lines.next_line() => next,
            _ = shutdown.changed() => break,
        };
        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "admin connection read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(control.as_ref(), &line);
        let mut payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode admin response");
                break;
            }
        };
        payload.push(b'\n');
        if write_half.write_all(&payload).await.is_err() {
            break;
        }
    }
}
