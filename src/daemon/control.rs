//! Control worker - serializes everything the UI can ask the daemon to do
//!
//! Connections never touch the catalog store or the binding table directly;
//! they send a [`ControlAction`] and wait for the response on a oneshot.

use crate::library::launcher::{self, LaunchError};
use crate::library::{Catalog, CatalogStore, IdentityKey};
use crate::mapping::BindingTable;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

macro_rules! handle_action {
    ($action:expr, $response_tx:expr) => {
        if $response_tx.send($action.await).is_err() {
            error!("Failed to send control response");
        }
    };
}

#[derive(Debug)]
pub enum ControlAction {
    GetCatalog {
        response_tx: oneshot::Sender<Arc<Catalog>>,
    },
    Launch {
        id: IdentityKey,
        response_tx: oneshot::Sender<Result<(), LaunchError>>,
    },
    Forget {
        id: IdentityKey,
        response_tx: oneshot::Sender<Result<bool, String>>,
    },
    RefreshLibrary {
        response_tx: oneshot::Sender<()>,
    },
    ReloadBindings {
        response_tx: oneshot::Sender<usize>,
    },
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Daemon control worker is not running")]
    WorkerGone,

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Recent list not saved: {0}")]
    Persist(String),
}

/// Cloneable sender side of the control worker.
#[derive(Clone, Debug)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlAction>,
}

impl ControlHandle {
    async fn request<T>(
        &self,
        action: impl FnOnce(oneshot::Sender<T>) -> ControlAction,
    ) -> Result<T, ControlError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(action(response_tx))
            .await
            .map_err(|_| ControlError::WorkerGone)?;
        response_rx.await.map_err(|_| ControlError::WorkerGone)
    }

    pub async fn get_catalog(&self) -> Result<Arc<Catalog>, ControlError> {
        self.request(|response_tx| ControlAction::GetCatalog { response_tx })
            .await
    }

    pub async fn launch(&self, id: IdentityKey) -> Result<(), ControlError> {
        self.request(|response_tx| ControlAction::Launch { id, response_tx })
            .await??;
        Ok(())
    }

    /// Removes a game from the recent list; true when it was listed.
    pub async fn forget(&self, id: IdentityKey) -> Result<bool, ControlError> {
        self.request(|response_tx| ControlAction::Forget { id, response_tx })
            .await?
            .map_err(ControlError::Persist)
    }

    /// Queues a library rescan; returns once it is scheduled, not when it finished.
    pub async fn refresh_library(&self) -> Result<(), ControlError> {
        self.request(|response_tx| ControlAction::RefreshLibrary { response_tx })
            .await
    }

    /// Re-reads the binding file and returns how many bindings are now active.
    pub async fn reload_bindings(&self) -> Result<usize, ControlError> {
        self.request(|response_tx| ControlAction::ReloadBindings { response_tx })
            .await
    }
}

pub struct ControlWorker {
    pub store: Arc<CatalogStore>,
    pub refresh: Arc<Notify>,
    pub bindings_path: PathBuf,
    pub bindings_tx: watch::Sender<Arc<BindingTable>>,
}

impl ControlWorker {
    pub fn spawn(self, cancel: CancellationToken) -> (ControlHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ControlAction>(32);

        let handle = tokio::spawn(async move {
            loop {
                let action = tokio::select! {
                    _ = cancel.cancelled() => break,
                    action = rx.recv() => match action {
                        Some(action) => action,
                        None => break,
                    },
                };

                match action {
                    ControlAction::GetCatalog { response_tx } => {
                        handle_action!(async { self.store.snapshot() }, response_tx);
                    }
                    ControlAction::Launch { id, response_tx } => {
                        handle_action!(self.launch(id), response_tx);
                    }
                    ControlAction::Forget { id, response_tx } => {
                        handle_action!(
                            async { self.store.forget(&id).await.map_err(|e| e.to_string()) },
                            response_tx
                        );
                    }
                    ControlAction::RefreshLibrary { response_tx } => {
                        handle_action!(async { self.refresh.notify_one() }, response_tx);
                    }
                    ControlAction::ReloadBindings { response_tx } => {
                        handle_action!(self.reload_bindings(), response_tx);
                    }
                }
            }
            debug!("Control worker stopped");
        });

        (ControlHandle { tx }, handle)
    }

    async fn launch(&self, id: IdentityKey) -> Result<(), LaunchError> {
        let snapshot = self.store.snapshot();
        let record = snapshot
            .find(&id)
            .ok_or_else(|| LaunchError::UnknownGame(id.clone()))?;

        info!("Launching {} ({})", record.name, id);
        launcher::launch(&record.launch)?;
        // A failed save is logged by the store; the game is running either way
        let _ = self.store.record_launch(&id).await;
        Ok(())
    }

    async fn reload_bindings(&self) -> usize {
        let table = BindingTable::load(&self.bindings_path).await;
        let count = table.len();
        self.bindings_tx.send_replace(Arc::new(table));
        info!("Reloaded bindings, {} active", count);
        count
    }
}
