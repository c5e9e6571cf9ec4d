use thiserror::Error;

use crate::storage::page::PageNo;

#[derive(Error, Debug)]
pub enum TurError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a TurDB database: {0}")]
    BadFormat(String),

    #[error("corrupt page: page_no={0}")]
    CorruptPage(PageNo),

    #[error("database is locked by another handle")]
    DatabaseLocked,

    #[error("database handle is closed")]
    Closed,

    #[error("transaction has already committed or rolled back")]
    TxDone,

    #[error("write attempted on a read-only database")]
    ReadOnly,

    #[error("not found")]
    NotFound,

    #[error("write conflict: row is being modified by a concurrent transaction")]
    WriteConflict,

    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("WAL error: {0}")]
    Wal(String),

    #[error("data corruption: {0}")]
    Corruption(String),
}

pub type Result<T> = std::result::Result<T, TurError>;
