use nix::errno::Errno;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Video error: {0}")]
    VideoError(String),

    /// A device ioctl (or open/poll) failed with a POSIX error code
    #[error("Device operation {op} failed: {errno}")]
    Device { op: &'static str, errno: Errno },

    /// The encode engine rejected an operation
    #[error("Encoder operation {op} failed (code: {code:#x})")]
    Encoder { op: &'static str, code: i32 },

    /// Unexpected internal state, e.g. a buffer index nobody owns
    #[error("Contract violation: {0}")]
    Contract(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AppError {
    /// Wrap an errno returned by a device ioctl
    pub fn device(op: &'static str, errno: Errno) -> Self {
        AppError::Device { op, errno }
    }

    /// POSIX error code carried by this error, if any
    pub fn errno(&self) -> Option<Errno> {
        match self {
            AppError::Device { errno, .. } => Some(*errno),
            AppError::Io(e) => e.raw_os_error().map(Errno::from_raw),
            _ => None,
        }
    }

    /// Interrupted or would-block waits that are simply retried
    pub fn is_transient(&self) -> bool {
        matches!(self.errno(), Some(Errno::EINTR) | Some(Errno::EAGAIN))
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
