use crate::server::ConnectionId;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFile(#[from] config::ConfigError),

    /// protocol errors, always fatal to the connection
    #[error("invalid frame header mark")]
    BadMark,

    #[error("expected 4 byte frame header, got {0} bytes")]
    BadHeaderByteCount(usize),

    #[error("received {got} body bytes, only {expected} outstanding")]
    BadDataByteCount { got: usize, expected: usize },

    #[error("payload of {0} bytes exceeds the 65535 byte frame limit")]
    PayloadTooLarge(usize),

    /// peer closed the socket at a frame boundary
    #[error("socket closed by peer")]
    SocketClosed,

    /// cooperative cancellation, not a fault
    #[error("operation terminated by cancellation")]
    Terminated,

    /// send-side errors
    #[error("short write: sent {sent} of {expected} bytes")]
    ShortWrite { sent: usize, expected: usize },

    #[error("operation would block")]
    WouldBlock,

    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),
}

impl AppError {
    /// Protocol violations tear the connection down and are never retried.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            AppError::BadMark
                | AppError::BadHeaderByteCount(_)
                | AppError::BadDataByteCount { .. }
        )
    }

    /// The OS error code behind a setup failure, when there is one.
    pub fn os_error(&self) -> Option<i32> {
        match self {
            AppError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}
