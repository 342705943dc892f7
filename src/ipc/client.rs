//! Client side of the control socket, as used by the UI

use crate::ipc::protocol::{decode, write_line, Message, Request};
use crate::ipc::IpcError;
use std::collections::VecDeque;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

pub struct IpcClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    // Unsolicited messages that arrived while waiting for a response
    pending: VecDeque<Message>,
}

impl IpcClient {
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
            pending: VecDeque::new(),
        })
    }

    pub async fn send(&mut self, request: &Request) -> Result<(), IpcError> {
        write_line(&mut self.writer, request).await
    }

    async fn read_message(&mut self) -> Result<Option<Message>, IpcError> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return decode(&line).map(Some),
                None => return Ok(None),
            }
        }
    }

    /// Sends `request` and returns its response. Actions arriving in between
    /// are kept for [`IpcClient::next_message`].
    pub async fn request(&mut self, request: &Request) -> Result<Message, IpcError> {
        self.send(request).await?;
        loop {
            match self.read_message().await? {
                Some(message) if message.is_unsolicited() => self.pending.push_back(message),
                Some(message) => return Ok(message),
                None => {
                    return Err(IpcError::Protocol(
                        "daemon closed the connection".to_string(),
                    ))
                }
            }
        }
    }

    /// Next message from the daemon; `None` once the daemon hung up.
    pub async fn next_message(&mut self) -> Result<Option<Message>, IpcError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }
        self.read_message().await
    }
}
