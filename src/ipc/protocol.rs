//! Wire format: one JSON object per line, tagged by `type`
//!
//! ```text
//! UI → daemon   {"type":"attach"}
//! daemon → UI   {"type":"attached"}
//! daemon → UI   {"type":"action","action":"NavigateDown"}
//! UI → daemon   {"type":"launch","id":"steam:123"}
//! daemon → UI   {"type":"ok"}
//! ```

use crate::ipc::{DetachReason, IpcError};
use crate::library::{Catalog, IdentityKey};
use crate::mapping::Action;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// UI to daemon
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Attach,
    Detach,
    GetCatalog,
    Launch { id: IdentityKey },
    /// Drop a game from the recently played list
    Forget { id: IdentityKey },
    RefreshLibrary,
    ReloadBindings,
    Ping,
}

/// Daemon to UI: responses, plus unsolicited `action` and `detached` messages for the attached UI
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Attached,
    Detached { reason: DetachReason },
    Action { action: Action },
    Catalog { catalog: Catalog },
    Ok,
    Pong,
    Error { message: String },
}

impl Message {
    pub fn error(message: impl ToString) -> Self {
        Message::Error {
            message: message.to_string(),
        }
    }

    /// Messages the daemon sends without being asked. A `detached` with reason
    /// `requested` is the answer to a `detach` request.
    pub fn is_unsolicited(&self) -> bool {
        matches!(
            self,
            Message::Action { .. }
                | Message::Detached {
                    reason: DetachReason::Replaced | DetachReason::Shutdown
                }
        )
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<String, IpcError> {
    let mut line = serde_json::to_string(value).map_err(|e| IpcError::Protocol(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, IpcError> {
    serde_json::from_str(line.trim()).map_err(|e| IpcError::Protocol(format!("{}: {}", e, line.trim())))
}

pub async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    writer.write_all(encode(value)?.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_use_snake_case_type_tags() {
        assert_eq!(encode(&Request::GetCatalog).unwrap(), "{\"type\":\"get_catalog\"}\n");
        assert_eq!(
            decode::<Request>(r#"{"type":"launch","id":"steam:123"}"#).unwrap(),
            Request::Launch {
                id: IdentityKey::steam("123")
            }
        );
    }

    #[test]
    fn actions_and_detach_reasons_are_readable() {
        let line = encode(&Message::Action {
            action: Action::ToggleVisibility,
        })
        .unwrap();
        assert_eq!(line, "{\"type\":\"action\",\"action\":\"ToggleVisibility\"}\n");

        let detached: Message = decode(r#"{"type":"detached","reason":"replaced"}"#).unwrap();
        assert_eq!(
            detached,
            Message::Detached {
                reason: DetachReason::Replaced
            }
        );
        assert!(detached.is_unsolicited());
        assert!(!Message::Detached {
            reason: DetachReason::Requested
        }
        .is_unsolicited());
    }

    #[test]
    fn unknown_requests_are_protocol_errors() {
        assert!(matches!(
            decode::<Request>(r#"{"type":"format_disk"}"#),
            Err(IpcError::Protocol(_))
        ));
    }
}
