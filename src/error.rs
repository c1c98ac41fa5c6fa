use thiserror::Error;

/// Exit status reported when the finished object could not be written locally.
pub const EXIT_DISTCC_FAILED: i32 = 100;

/// Frame-level failures raised by the wire codec and message channels.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown message kind: {0:#06x}")]
    UnknownMessageKind(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("serialisation error: {0}")]
    Serialisation(String),

    #[error("deserialisation error: {0}")]
    Deserialisation(String),

    #[error("frame header says {header} but payload is {payload}")]
    KindMismatch {
        header: &'static str,
        payload: &'static str,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a single remote build attempt.
///
/// Preprocessor failures are deliberately absent: a non-zero preprocessor exit
/// is a legitimate compile result, not an error.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("worker {host}:{port} unreachable: {source}")]
    WorkerUnreachable {
        host: String,
        port: u16,
        #[source]
        source: ProtocolError,
    },

    #[error("transport failure during {stage}: {source}")]
    TransportFailure {
        stage: &'static str,
        #[source]
        source: ProtocolError,
    },

    #[error("environment archive unavailable: {0}")]
    EnvironmentUnavailable(String),

    #[error("failed to write output {path}: {source}")]
    OutputWriteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    pub fn transport(stage: &'static str, source: ProtocolError) -> Self {
        Self::TransportFailure { stage, source }
    }

    /// Stable label for log fields and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::ProtocolViolation(_) => "protocol_violation",
            BuildError::WorkerUnreachable { .. } => "worker_unreachable",
            BuildError::TransportFailure { .. } => "transport_failure",
            BuildError::EnvironmentUnavailable(_) => "environment_unavailable",
            BuildError::OutputWriteFailed { .. } => "output_write_failed",
        }
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
