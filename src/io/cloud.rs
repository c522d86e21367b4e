//! Error type shared by the storage and ingest collaborators.
//!
//! Blob stores and ingest clients report failures as a categorized
//! [`CloudIOError`] so fakes and real backends fail the same way.

use std::error::Error;
use std::fmt;

/// Generic error type for collaborator operations.
#[derive(Debug, Clone)]
pub struct CloudIOError {
    pub message: String,
    pub kind: ErrorKind,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authentication,
    Authorization,
    NotFound,
    AlreadyExists,
    InvalidInput,
    Network,
    Timeout,
    ServiceUnavailable,
    InternalError,
    Other,
}

impl fmt::Display for CloudIOError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl Error for CloudIOError {}

impl CloudIOError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::new(ErrorKind::NotFound, format!("{what} not found"))
    }

    /// Categorize a filesystem or stream error raised while touching `what`.
    pub fn from_io(err: &std::io::Error, what: impl fmt::Display) -> Self {
        use std::io::ErrorKind as Io;
        let kind = match err.kind() {
            Io::NotFound => ErrorKind::NotFound,
            Io::PermissionDenied => ErrorKind::Authorization,
            Io::AlreadyExists => ErrorKind::AlreadyExists,
            Io::InvalidInput | Io::InvalidData => ErrorKind::InvalidInput,
            Io::TimedOut => ErrorKind::Timeout,
            Io::ConnectionRefused | Io::ConnectionReset | Io::ConnectionAborted => ErrorKind::Network,
            _ => ErrorKind::Other,
        };
        Self::new(kind, what.to_string()).with_source(err.to_string())
    }
}

pub type CloudResult<T> = Result<T, CloudIOError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_category() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let cloud = CloudIOError::from_io(&err, "blob a.csv");
        assert_eq!(cloud.kind, ErrorKind::NotFound);
        assert_eq!(cloud.to_string(), "NotFound: blob a.csv (gone)");
    }
}
