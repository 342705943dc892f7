//! Unix socket server
//!
//! One task per connection. A connection becomes the UI listener by sending
//! `attach`; from then on it receives `action` messages in addition to the
//! responses to its own requests. A dropped connection detaches itself.
//!
//! Writes to a client are bounded: a UI that stops reading is dropped after
//! [`WRITE_TIMEOUT`], and shutdown never waits on it.

use crate::daemon::control::ControlHandle;
use crate::ipc::hub::{ActionHub, Listener, ListenerEvent};
use crate::ipc::protocol::{decode, write_line, Message, Request};
use crate::ipc::{DetachReason, IpcError};
use serde::Serialize;
use std::io::ErrorKind;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
// Budget for the final shutdown notice and for draining connections on stop
const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Binds the socket, taking over a stale socket file but refusing to
    /// replace one a live daemon still answers on, or anything that is not a socket.
    pub async fn bind(path: &Path) -> Result<Self, IpcError> {
        match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) if !metadata.file_type().is_socket() => {
                return Err(IpcError::NotASocket(path.to_path_buf()));
            }
            Ok(_) => match UnixStream::connect(path).await {
                Ok(_) => return Err(IpcError::AlreadyRunning(path.to_path_buf())),
                Err(e) => {
                    info!("Removing stale socket {} ({})", path.display(), e);
                    tokio::fs::remove_file(path).await?;
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(IpcError::Transport(e)),
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let listener = UnixListener::bind(path)?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        info!("IPC server listening on {}", path.display());

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts connections until `cancel` fires, then gives open connections
    /// a short while to wind down, aborts the rest and removes the socket file.
    pub async fn run(self, hub: Arc<ActionHub>, control: ControlHandle, cancel: CancellationToken) {
        let mut connections = JoinSet::new();
        let mut next_connection: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        next_connection += 1;
                        let id = next_connection;
                        debug!("Connection {} opened", id);
                        let hub = hub.clone();
                        let control = control.clone();
                        let cancel = cancel.child_token();
                        connections.spawn(async move {
                            if let Err(e) = serve_connection(stream, hub, control, cancel).await {
                                warn!("Connection {} dropped: {}", id, e);
                            } else {
                                debug!("Connection {} closed", id);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("Aborting {} connections that did not close", connections.len());
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            warn!("Failed to remove socket {}: {}", self.path.display(), e);
        }
        info!("IPC server stopped");
    }
}

/// Writes one message, giving up after `limit` or once `cancel` fires.
async fn write_bounded<T: Serialize>(
    writer: &mut OwnedWriteHalf,
    value: &T,
    limit: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<(), IpcError> {
    let cancelled = async {
        match cancel {
            Some(cancel) => cancel.cancelled().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        written = tokio::time::timeout(limit, write_line(writer, value)) => match written {
            Ok(result) => result,
            Err(_) => Err(IpcError::Transport(std::io::Error::new(
                ErrorKind::TimedOut,
                "client stopped reading",
            ))),
        },
        _ = cancelled => Err(IpcError::Transport(std::io::Error::new(
            ErrorKind::Interrupted,
            "daemon is shutting down",
        ))),
    }
}

async fn next_event(listener: &mut Option<Listener>) -> Option<ListenerEvent> {
    match listener {
        Some(listener) => listener.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn forward_event(
    event: Option<ListenerEvent>,
    listener: &mut Option<Listener>,
    writer: &mut OwnedWriteHalf,
    limit: Duration,
    cancel: Option<&CancellationToken>,
) -> Result<(), IpcError> {
    match event {
        Some(ListenerEvent::Action(action)) => {
            write_bounded(writer, &Message::Action { action }, limit, cancel).await
        }
        Some(ListenerEvent::Detached(reason)) => {
            *listener = None;
            write_bounded(writer, &Message::Detached { reason }, limit, cancel).await
        }
        None => {
            *listener = None;
            Ok(())
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    hub: Arc<ActionHub>,
    control: ControlHandle,
    cancel: CancellationToken,
) -> Result<(), IpcError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut listener: Option<Listener> = None;

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Flush what the hub queued, including the shutdown notice
                while let Some(event) = listener.as_mut().and_then(|l| l.events.try_recv().ok()) {
                    let flushed =
                        forward_event(Some(event), &mut listener, &mut writer, FLUSH_TIMEOUT, None).await;
                    if flushed.is_err() {
                        break;
                    }
                }
                break Ok(());
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let handled =
                        handle_line(&line, &hub, &control, &mut listener, &mut writer, &cancel).await;
                    if let Err(e) = handled {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(IpcError::Transport(e)),
            },
            event = next_event(&mut listener) => {
                let forwarded =
                    forward_event(event, &mut listener, &mut writer, WRITE_TIMEOUT, Some(&cancel)).await;
                if let Err(e) = forwarded {
                    break Err(e);
                }
            }
        }
    };

    if let Some(listener) = listener.take() {
        hub.detach(listener.id);
    }
    result
}

async fn handle_line(
    line: &str,
    hub: &ActionHub,
    control: &ControlHandle,
    listener: &mut Option<Listener>,
    writer: &mut OwnedWriteHalf,
    cancel: &CancellationToken,
) -> Result<(), IpcError> {
    let request: Request = match decode(line) {
        Ok(request) => request,
        Err(e) => {
            debug!("Rejecting request: {}", e);
            return write_bounded(writer, &Message::error(e), WRITE_TIMEOUT, Some(cancel)).await;
        }
    };
    debug!("Request: {:?}", request);

    let response = match request {
        Request::Attach => {
            if let Some(previous) = listener.take() {
                hub.detach(previous.id);
            }
            *listener = Some(hub.attach());
            Message::Attached
        }
        Request::Detach => {
            if let Some(previous) = listener.take() {
                hub.detach(previous.id);
            }
            Message::Detached {
                reason: DetachReason::Requested,
            }
        }
        Request::Ping => Message::Pong,
        Request::GetCatalog => match control.get_catalog().await {
            Ok(catalog) => Message::Catalog {
                catalog: catalog.as_ref().clone(),
            },
            Err(e) => Message::error(e),
        },
        Request::Launch { id } => match control.launch(id).await {
            Ok(()) => Message::Ok,
            Err(e) => Message::error(e),
        },
        Request::Forget { id } => match control.forget(id).await {
            Ok(_) => Message::Ok,
            Err(e) => Message::error(e),
        },
        Request::RefreshLibrary => match control.refresh_library().await {
            Ok(()) => Message::Ok,
            Err(e) => Message::error(e),
        },
        Request::ReloadBindings => match control.reload_bindings().await {
            Ok(_) => Message::Ok,
            Err(e) => Message::error(e),
        },
    };

    write_bounded(writer, &response, WRITE_TIMEOUT, Some(cancel)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::testing::scratch_dir;

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let dir = scratch_dir("server-stale");
        let path = dir.join("stale.sock");
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let server = IpcServer::bind(&path).await.unwrap();
        assert_eq!(server.path(), path.as_path());
        UnixStream::connect(&path).await.unwrap();

        drop(server);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn regular_file_at_socket_path_is_left_alone() {
        let dir = scratch_dir("server-regular-file");
        let path = dir.join("notes.sock");
        std::fs::write(&path, "keep me").unwrap();

        assert!(matches!(
            IpcServer::bind(&path).await,
            Err(IpcError::NotASocket(_))
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn write_to_a_client_that_never_reads_gives_up() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let (_reader, mut writer) = ours.into_split();
        let big = "x".repeat(64 * 1024);

        let started = std::time::Instant::now();
        let mut result = Ok(());
        for _ in 0..1024 {
            result = write_bounded(&mut writer, &big, Duration::from_millis(100), None).await;
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(IpcError::Transport(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_blocked_write() {
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let (_reader, mut writer) = ours.into_split();
        let big = "x".repeat(64 * 1024);
        let cancel = CancellationToken::new();

        // Fill the buffer until a write would block
        while write_bounded(&mut writer, &big, Duration::from_millis(50), None)
            .await
            .is_ok()
        {}

        cancel.cancel();
        let result = write_bounded(&mut writer, &big, Duration::from_secs(60), Some(&cancel)).await;
        assert!(matches!(result, Err(IpcError::Transport(e)) if e.kind() == ErrorKind::Interrupted));
    }
}
