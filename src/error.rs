use thiserror::Error;

/// Errors surfaced by shape arithmetic, planning and solver search.
///
/// Inapplicable solvers and workspace requests above the device allocation
/// ceiling are not errors; they are reported through
/// [`WorkspaceEstimate`](crate::workspace::WorkspaceEstimate) and the skip
/// list of a [`Selection`](crate::search::Selection).
#[derive(Error, Debug)]
pub enum ConvError {
    #[error("invalid convolution parameters: {0}")]
    Validation(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("channels do not match for the filter: input has {input}, filter expects {filter} ({mode})")]
    ChannelMismatch {
        mode: &'static str,
        input: usize,
        filter: usize,
    },
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("search failed for solver {solver}: {reason}")]
    SearchFailed { solver: String, reason: String },
    #[error("no applicable solver for problem {0}")]
    NoApplicableSolver(String),
    #[error("device synchronization timed out after {waited_ms} ms (limit {limit_ms} ms)")]
    DeviceTimeout { waited_ms: u64, limit_ms: u64 },
    #[error("device error: {0}")]
    Device(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ConvError {
    /// A fatal error ends the whole request instead of only dropping the
    /// solver that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConvError::DeviceTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, ConvError>;
