use std::fmt;

use crate::events::BuildLog;

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// The kinds of failure a build submission can end with.
///
/// Everything detected locally before a request goes out is a
/// [BuildError::Config]. The daemon answering with a non-success status ends
/// up as [BuildError::NotFound] or [BuildError::Daemon], while a build that was
/// accepted but failed is a [BuildError::Build] that still owns the complete
/// replayable log.
#[derive(thiserror::Error)]
pub enum BuildError {
    /// Invalid input, no network call has been issued
    #[error("invalid build configuration: {0}")]
    Config(String),
    /// The daemon answered with a not-found status
    #[error("not found: {message}")]
    NotFound { message: String },
    /// Any other non-success status, `body` is the response body verbatim
    #[error("daemon returned status {status}: {body}")]
    Daemon { status: u16, body: String },
    /// The event stream reported a failure, or never reported success
    #[error("build failed: {message}")]
    Build { message: String, log: BuildLog },
    /// Local I/O, archiving or transport failure
    #[error("{0:?}")]
    Internal(stacked_errors::Error),
}

impl BuildError {
    pub fn config(msg: impl fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_build_failure(&self) -> bool {
        matches!(self, Self::Build { .. })
    }

    /// Returns the attached build log if this is a [BuildError::Build]
    pub fn into_log(self) -> Option<BuildLog> {
        match self {
            Self::Build { log, .. } => Some(log),
            _ => None,
        }
    }
}

impl From<stacked_errors::Error> for BuildError {
    fn from(e: stacked_errors::Error) -> Self {
        Self::Internal(e)
    }
}

// the log is a live stream, print only the message for it
impl fmt::Debug for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => f.debug_tuple("Config").field(msg).finish(),
            Self::NotFound { message } => f
                .debug_struct("NotFound")
                .field("message", message)
                .finish(),
            Self::Daemon { status, body } => f
                .debug_struct("Daemon")
                .field("status", status)
                .field("body", body)
                .finish(),
            Self::Build { message, .. } => f
                .debug_struct("Build")
                .field("message", message)
                .finish_non_exhaustive(),
            Self::Internal(e) => f.debug_tuple("Internal").field(e).finish(),
        }
    }
}
