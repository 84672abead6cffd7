mod client;
mod config;
mod protocol;
mod su;
pub mod wire;

pub use client::*;
pub use config::*;
pub use protocol::*;
pub use su::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SumsError {
    #[error("broken connection: {0}")]
    BrokenConnection(String),
    #[error("bad json: {0}")]
    BadJson(String),
    #[error("can't receive request: {0}")]
    CantReceive(String),
    #[error("can't send response: {0}")]
    CantSend(String),
    #[error("bad client info: {0}")]
    BadClientInfo(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("bad request type: {0}")]
    BadRequestType(String),
    #[error("session closed: {0}")]
    SessionClosed(String),
    #[error("session already opened: {0}")]
    SessionOpened(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("no space: {0}")]
    NoSpace(String),
    #[error("probe timeout: {0}")]
    ProbeTimeout(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SumsError {
    /// Wire status reported to the client for this error.
    pub fn status(&self) -> SumsStatus {
        match self {
            SumsError::BrokenConnection(_) => SumsStatus::BrokenConnection,
            SumsError::BadJson(_) => SumsStatus::BadJson,
            SumsError::CantReceive(_) => SumsStatus::CantReceiveRequest,
            SumsError::CantSend(_) => SumsStatus::CantSendResponse,
            SumsError::BadClientInfo(_) => SumsStatus::BadClientInfo,
            SumsError::BadRequest(_) => SumsStatus::BadRequest,
            SumsError::BadRequestType(_) => SumsStatus::BadRequestType,
            SumsError::SessionClosed(_) => SumsStatus::SessionClosed,
            SumsError::SessionOpened(_) => SumsStatus::SessionOpened,
            SumsError::DbError(_)
            | SumsError::IoError(_)
            | SumsError::NoSpace(_)
            | SumsError::ProbeTimeout(_)
            | SumsError::InvalidConfig(_)
            | SumsError::Unsupported(_)
            | SumsError::Internal(_) => SumsStatus::CantGenerateResponse,
        }
    }

    /// Transport faults end the connection instead of a single response.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            SumsError::BrokenConnection(_) | SumsError::CantReceive(_) | SumsError::CantSend(_)
        )
    }

    /// Message safe to hand to a client. Backing-store detail stays in the server log.
    pub fn client_message(&self) -> String {
        match self {
            SumsError::DbError(_) => "database failure while generating response".to_string(),
            other => other.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SumsError::ProbeTimeout(_))
    }
}

pub type SumsResult<T> = std::result::Result<T, SumsError>;

impl From<std::io::Error> for SumsError {
    fn from(err: std::io::Error) -> Self {
        SumsError::IoError(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SumsStatus {
    Ok,
    BrokenConnection,
    BadJson,
    CantReceiveRequest,
    CantSendResponse,
    BadClientInfo,
    BadRequest,
    BadRequestType,
    SessionClosed,
    SessionOpened,
    CantGenerateResponse,
    TapeRead,
}

impl SumsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SumsStatus::Ok => "ok",
            SumsStatus::BrokenConnection => "broken-connection",
            SumsStatus::BadJson => "bad-json",
            SumsStatus::CantReceiveRequest => "cant-receive-request",
            SumsStatus::CantSendResponse => "cant-send-response",
            SumsStatus::BadClientInfo => "bad-clientinfo",
            SumsStatus::BadRequest => "bad-request",
            SumsStatus::BadRequestType => "bad-request-type",
            SumsStatus::SessionClosed => "session-closed",
            SumsStatus::SessionOpened => "session-opened",
            SumsStatus::CantGenerateResponse => "cant-generate-response",
            SumsStatus::TapeRead => "taperead",
        }
    }
}

impl std::fmt::Display for SumsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
