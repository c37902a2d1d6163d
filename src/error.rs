use crate::exec::ExecutionError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Usage(String),

    #[error(transparent)]
    Exec(#[from] ExecutionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {secs}s waiting for lock on '{key}'")]
    LockTimeout { key: String, secs: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;
