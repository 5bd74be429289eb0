use thiserror::Error;

use crate::codec::CodecError;
use crate::schema::SchemaValidationError;

pub type Result<T> = std::result::Result<T, Error>;

/// Fatal conditions. Continuing past any of these risks replica divergence, so they are
/// propagated to the caller's boundary and never swallowed inside the core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed change: {0}")]
    MalformedChange(String),
    #[error("unknown anchor: {0}")]
    UnknownAnchor(String),
    #[error("cursor has pending content and cannot be read synchronously")]
    CursorPending,
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("incompatible schema: {0}")]
    IncompatibleSchema(String),
    #[error("inconsistent state: {0}")]
    InconsistentState(String),
    #[error("unsupported format version {version} for {format}")]
    UnsupportedVersion { format: &'static str, version: u32 },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// Content rejected by early schema validation. Nothing was applied.
    #[error("content is out of schema: {0}")]
    OutOfSchema(#[from] SchemaValidationError),
}

impl Error {
    /// Stable diagnostic code. Codes are never reused or renumbered.
    pub fn code(&self) -> &'static str {
        match self {
            Error::MalformedChange(_) => "ST0001",
            Error::UnknownAnchor(_) => "ST0002",
            Error::CursorPending => "ST0003",
            Error::Codec(_) => "ST0004",
            Error::IncompatibleSchema(_) => "ST0005",
            Error::InconsistentState(_) => "ST0006",
            Error::UnsupportedVersion { .. } => "ST0007",
            Error::Json(_) => "ST0008",
            Error::OutOfSchema(_) => "ST0009",
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedChange(message.into())
    }
}
