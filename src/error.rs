use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("device I/O failed")]
    IoError,
    #[error("no valid boot sector copy")]
    InvalidBootSector,
    #[error("volume geometry is invalid")]
    InvalidGeometry,
    #[error("cluster chain hit a bad cluster")]
    BadCluster,
    #[error("record failed checksum validation")]
    Corrupted,
    #[error("no free cluster left")]
    NoSpace,
    #[error("content table is full")]
    TableFull,
    #[error("no free journal slot")]
    JournalFull,
    #[error("lock acquisition timed out")]
    LockTimeout,
    #[error("entry not found")]
    NotFound,
    #[error("entry already exists")]
    AlreadyExists,
    #[error("invalid content handle")]
    InvalidHandle,
    #[error("not a directory")]
    NotDirectory,
    #[error("not a file")]
    NotFile,
    #[error("invalid 8.3 file name")]
    InvalidFileName,
    #[error("invalid path")]
    InvalidPath,
    #[error("volume is mounted read-only")]
    ReadOnly,
    #[error("open mode does not permit this operation")]
    AccessDenied,
    #[error("offset out of bounds")]
    OutOfBounds,
    #[error("file too large")]
    FileTooLarge,
    #[error("directory nesting exceeds volume bound")]
    DepthExceeded,
}

pub type Result<T> = core::result::Result<T, FsError>;
