use thiserror::Error;
use crate::ids::ConnId;

#[derive(Debug, Error)]
pub enum LspError {
    #[error("no acknowledgement for the connect request within the epoch limit")]
    ConnectTimeout,

    /// The connection exceeded its idle epoch limit, or it went away while the caller was
    ///  waiting for it
    #[error("connection {0} was lost")]
    ConnectionLost(ConnId),

    /// The local side closed the connection (or the server) before the call
    #[error("connection is closed")]
    ConnectionClosed,

    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LspResult<T> = Result<T, LspError>;
