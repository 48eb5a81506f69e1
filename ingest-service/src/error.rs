use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Shutdown was requested; not a failure.
    #[error("cancelled")]
    Cancelled,
    #[error("ledger source error: {0}")]
    Source(String),
    #[error("history archive error: {0}")]
    Archive(String),
    #[error("bootstrap deadline exceeded")]
    DeadlineExceeded,
    #[error(transparent)]
    Entry(#[from] entry_store::EntryStoreError),
    #[error(transparent)]
    Events(#[from] event_store::IngestError),
}

impl IngestError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestError::Cancelled)
    }
}
