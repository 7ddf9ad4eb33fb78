use thiserror::Error;

/// Errors surfaced by the monitor.
///
/// Parse failures are deliberately absent: dissectors return `Option` and the
/// capture loop drops anything it cannot make sense of.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("device setup failed: {0}")]
    Setup(String),

    #[error("forwarding error: {0}")]
    Forwarding(String),

    #[error("analysis error: {0}")]
    Analysis(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
