use thiserror::Error;

/// Errors surfaced by the filesystem drivers.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("corrupt filesystem: {0}")]
    CorruptFilesystem(String),

    #[error("volume is read-only")]
    ReadOnly,

    #[error("no space left on volume")]
    NoSpace,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FsResult<T> = Result<T, FsError>;
