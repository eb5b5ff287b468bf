//! Error types for the multiviewer library.

use std::fmt;
use std::time::Duration;

/// Errors that can occur across the multiviewer stack.
///
/// Variants map to specific failure modes:
///
/// - **Sources**: [`SourceUnavailable`](Self::SourceUnavailable): a feed
///   could not be opened or stopped producing. Absorbed by the live loop,
///   which paints a placeholder tile instead.
/// - **Sinks**: [`SinkStart`](Self::SinkStart),
///   [`StartupTimeout`](Self::StartupTimeout) (fatal to session start),
///   [`SinkWrite`](Self::SinkWrite), [`SinkCrashed`](Self::SinkCrashed)
///   (fatal to a running session).
/// - **Sessions**: [`TargetAlreadyActive`](Self::TargetAlreadyActive),
///   [`SessionNotFound`](Self::SessionNotFound).
/// - **Registry**: [`Registry`](Self::Registry),
///   [`ChannelNotFound`](Self::ChannelNotFound).
/// - **Control surface**: [`Json`](Self::Json),
///   [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum MosaicError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame source could not be opened or its stream ended.
    #[error("source unavailable: {url}: {reason}")]
    SourceUnavailable { url: String, reason: String },

    /// An output sink could not be started. No session is created.
    #[error("sink failed to start: {0}")]
    SinkStart(String),

    /// The encoder did not produce its SDP or playlist in time.
    #[error("sink not ready after {0:?}")]
    StartupTimeout(Duration),

    /// Writing a composite frame to the sink failed.
    #[error("sink write failed: {0}")]
    SinkWrite(String),

    /// The sink's encoder process exited while the session was running.
    #[error("sink process exited unexpectedly: {0}")]
    SinkCrashed(String),

    /// Another Starting/Running/Stopping session already owns this target.
    #[error("target already has an active session: {0}")]
    TargetAlreadyActive(String),

    /// No session with the given ID exists in the [`SessionManager`](crate::SessionManager).
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A requested channel name is not present in the registry.
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    /// The channel registry file is malformed.
    #[error("registry error: {kind}")]
    Registry { kind: RegistryErrorKind },

    /// An output target description is unusable (bad address, bad name).
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// A `key=value` option could not be parsed.
    #[error("invalid option '{0}', expected key=value")]
    InvalidOption(String),

    /// Malformed JSON in a control request body.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// [`ControlServer::start`](crate::ControlServer::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

impl MosaicError {
    /// Whether this error means a sink never became ready.
    pub fn is_start_failure(&self) -> bool {
        matches!(self, Self::SinkStart(_) | Self::StartupTimeout(_))
    }

    pub(crate) fn source_unavailable(url: &str, reason: impl fmt::Display) -> Self {
        Self::SourceUnavailable {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Specific kind of channel registry failure.
#[derive(Debug)]
pub enum RegistryErrorKind {
    /// The file had no header row.
    Empty,
    /// A required column is absent from the header row.
    MissingColumn(&'static str),
    /// A data row is missing a required field or carries an unusable value.
    MalformedRow { line: usize },
    /// Two rows use the same channel name.
    DuplicateChannel {
        name: String,
        first_line: usize,
        line: usize,
    },
}

impl fmt::Display for RegistryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "registry is empty"),
            Self::MissingColumn(column) => write!(f, "missing required column '{column}'"),
            Self::MalformedRow { line } => write!(f, "malformed row at line {line}"),
            Self::DuplicateChannel {
                name,
                first_line,
                line,
            } => write!(
                f,
                "duplicate channel '{name}' at line {line} (first defined at line {first_line})"
            ),
        }
    }
}

/// Convenience alias for `Result<T, MosaicError>`.
pub type Result<T> = std::result::Result<T, MosaicError>;
