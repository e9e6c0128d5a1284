use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    /// `put` against an already-published result id. Results are write-once.
    #[error("Result '{0}' already exists; cached results are write-once")]
    DuplicateResult(String),

    #[error("Unknown session or result: {0}")]
    UnknownSessionOrResult(String),

    /// Projection named a column absent from the result's column union.
    #[error("Unknown column: '{0}'")]
    UnknownColumn(String),

    /// Durable read/write failure. Surfaced verbatim: an apparent success
    /// hiding one of these would mean the cached result may not exist.
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Storage encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
