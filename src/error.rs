/// Errors surfaced by the sync engine and its adapters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    /// Canvas or pixel absent on the remote store or in the local grid.
    #[error("not found: {0}")]
    NotFound(String),

    /// A remote call failed or timed out.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// The raster could not be parsed.
    #[error("could not decode image: {0}")]
    DecodeFailure(String),

    /// Selection missing or degenerate for an operator that needs one.
    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("invalid color `{0}`, expected #RRGGBB")]
    InvalidColor(String),

    #[error("coordinate ({x}, {y}) outside {width}x{height} canvas")]
    OutOfBounds { x: u32, y: u32, width: u32, height: u32 },

    /// Destructive operation attempted without explicit confirmation.
    #[error("{0} can not be undone and needs explicit confirmation")]
    Unconfirmed(&'static str),

    #[error("session is closed")]
    SessionClosed,

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl SyncError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkFailure(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            SyncError::NotFound(e.to_string())
        } else {
            SyncError::NetworkFailure(e.to_string())
        }
    }
}

impl From<image::ImageError> for SyncError {
    fn from(e: image::ImageError) -> Self {
        SyncError::DecodeFailure(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Snapshot(e.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for SyncError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        SyncError::Snapshot(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
