//! Starts games detached from the daemon

use crate::library::{IdentityKey, LaunchCommand};
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Unknown game: {0}")]
    UnknownGame(IdentityKey),

    #[error("Failed to start {program}: {error}")]
    Spawn {
        program: String,
        #[source]
        error: std::io::Error,
    },
}

/// Spawns `command` in its own process group with no stdio attached and
/// returns its pid. The child is reaped in the background.
///
/// Must be called from within a tokio runtime.
pub fn launch(command: &LaunchCommand) -> Result<Option<u32>, LaunchError> {
    let mut std_command = std::process::Command::new(&command.program);
    std_command
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);

    let mut child = Command::from(std_command)
        .spawn()
        .map_err(|error| LaunchError::Spawn {
            program: command.program.clone(),
            error,
        })?;

    let pid = child.id();
    info!("Started {} {:?} (pid {:?})", command.program, command.args, pid);

    let program = command.program.clone();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!("{} exited with {}", program, status),
            Err(e) => warn!("Failed to wait for {}: {}", program, e),
        }
    });

    Ok(pid)
}
