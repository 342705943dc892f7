//! Daemon IPC
//!
//! The daemon and the UI talk over a local Unix socket using newline-delimited
//! JSON ([`protocol`]). Routed controller actions reach the attached UI through
//! the [`hub`], which never blocks the polling thread.

pub mod client;
pub mod hub;
pub mod protocol;
pub mod server;

pub use client::IpcClient;
pub use hub::{ActionHub, ActionSink, Delivery, DetachReason};
pub use protocol::{Message, Request};
pub use server::IpcServer;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub const SOCKET_NAME: &str = "controllerlaunch.sock";

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("A daemon is already listening on {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("{} exists and is not a socket", .0.display())]
    NotASocket(PathBuf),
}

/// The `[ipc]` config section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcSettings {
    /// Overrides the socket location
    pub socket_path: Option<String>,
    /// Actions buffered for a slow UI before new ones are dropped
    pub listener_queue: usize,
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            listener_queue: 64,
        }
    }
}

impl IpcSettings {
    pub fn socket_path(&self) -> PathBuf {
        match &self.socket_path {
            Some(path) if !path.trim().is_empty() => crate::library::expand_home(path.trim()),
            _ => default_socket_path(),
        }
    }
}

/// `$XDG_RUNTIME_DIR/controllerlaunch.sock`, or the temp dir when there is no runtime dir.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(SOCKET_NAME)
}
