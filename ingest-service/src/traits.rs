use async_trait::async_trait;
use core_types::ledger::{EntryChange, LedgerCloseMeta, LedgerSeq};
use tokio_util::sync::CancellationToken;

use crate::error::IngestError;

/// The stream of closed ledgers. In production this fronts the captive
/// ledger-source subprocess; tests inject an in-memory fake. A source crash
/// surfaces as a retriable [`IngestError::Source`].
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Prepares the source to serve the unbounded range `[from, ∞)`.
    async fn prepare_range(
        &self,
        cancel: &CancellationToken,
        from: LedgerSeq,
    ) -> Result<(), IngestError>;

    /// Returns the close record for `seq`, waiting for the ledger to close
    /// if it has not yet.
    async fn get_ledger(
        &self,
        cancel: &CancellationToken,
        seq: LedgerSeq,
    ) -> Result<LedgerCloseMeta, IngestError>;

    async fn close(&self);
}

#[derive(Clone, Copy, Debug)]
pub struct ArchiveRoot {
    /// The most recent checkpoint ledger the archive has published.
    pub current_ledger: LedgerSeq,
}

/// Lazy sequence of entry changes with explicit close discipline.
#[async_trait]
pub trait EntryChangeReader: Send {
    /// The next change, or `None` once the sequence is exhausted.
    async fn next(&mut self) -> Result<Option<EntryChange>, IngestError>;

    /// Releases the underlying resources. Must be called on the success
    /// path; dropping without closing releases them less gracefully.
    async fn close(&mut self) -> Result<(), IngestError>;
}

/// A history archive holding periodic full snapshots of ledger state.
#[async_trait]
pub trait HistoryArchive: Send + Sync {
    async fn get_root(&self) -> Result<ArchiveRoot, IngestError>;

    /// Opens a reader over every entry in the checkpoint at `checkpoint`.
    async fn checkpoint_changes(
        &self,
        checkpoint: LedgerSeq,
    ) -> Result<Box<dyn EntryChangeReader>, IngestError>;
}
