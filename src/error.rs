use crate::comms::{ToMinionMessage, ToOverlordMessage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Error broadcasting: {0}")]
    BroadcastSend(#[from] tokio::sync::broadcast::error::SendError<ToMinionMessage>),

    #[error("Error receiving broadcast: {0}")]
    BroadcastReceive(#[from] tokio::sync::broadcast::error::RecvError),

    #[error("Event id {0} does not match its canonical serialization hash {1}")]
    EventIdMismatch(String, String),

    #[error("Error: {0}")]
    General(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] http::Error),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Error sending mpsc: {0}")]
    MpscSend(#[from] Box<tokio::sync::mpsc::error::SendError<ToOverlordMessage>>),

    #[error("Invalid public key: {0}")]
    InvalidPubkey(String),

    #[error("Invalid relay URL: {0}")]
    InvalidRelayUrl(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    #[error("Nostr: {0}")]
    Nostr(#[from] nostr_types::Error),

    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad integer: {0}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("Relay was added by the system and cannot be removed without force")]
    RelayIsProtected,

    #[error("SerdeJson Error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("SQL: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Timeout: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Unknown mode: {0}")]
    UnknownMode(String),

    #[error("URL has no hostname")]
    UrlHasNoHostname,

    #[error("Websocket: {0}")]
    Websocket(#[from] tungstenite::Error),
}

impl From<String> for Error {
    fn from(s: String) -> Error {
        Error::General(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Error {
        Error::General(s.to_string())
    }
}

impl From<tokio::sync::mpsc::error::SendError<ToOverlordMessage>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<ToOverlordMessage>) -> Error {
        Error::MpscSend(Box::new(e))
    }
}
