// Copyright (c) James Kassemi, SC, US. All rights reserved.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use core_types::ledger::{EntryChange, LedgerCloseMeta, LedgerSeq};
use core_types::retry::RetryPolicy;
use entry_store::{EntryStore, Updater};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::IngestError;
use crate::reader::CloseMetaChangeReader;
use crate::traits::{HistoryArchive, LedgerBackend};

const BASELINE_PROGRESS_LOG_PERIOD: u64 = 10_000;

pub struct IngestServiceConfig {
    pub entry_store: Arc<EntryStore>,
    pub event_store: Arc<event_store::MemoryStore>,
    pub transaction_store: Arc<transaction_store::MemoryStore>,
    pub ledger_backend: Arc<dyn LedgerBackend>,
    pub archive: Arc<dyn HistoryArchive>,
    /// Deadline for checkpoint bootstrap and range preparation. Streaming
    /// pulls wait for ledger close and are not bounded by this.
    pub timeout: Duration,
    pub max_batch_size: usize,
    pub retry: RetryPolicy,
}

/// Owns the background task driving the forward-progress state machine.
///
/// The task bootstraps an empty entry store from the most recent history
/// checkpoint, then applies one ledger at a time to the entry, event, and
/// transaction stores. A ledger becomes visible in the in-memory stores
/// only after its entry-store transaction commits.
pub struct IngestService {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IngestService {
    pub fn start(config: IngestServiceConfig) -> Self {
        let cancel = CancellationToken::new();
        let worker = Worker {
            entry_store: config.entry_store,
            event_store: config.event_store,
            transaction_store: config.transaction_store,
            backend: config.ledger_backend,
            archive: config.archive,
            timeout: config.timeout,
            max_batch_size: config.max_batch_size,
            retry: config.retry,
        };
        let token = cancel.clone();
        let handle = tokio::spawn(async move { worker.run_with_retries(token).await });
        Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signals cancellation and waits for the driver task to exit. Any
    /// in-flight transaction is rolled back. Idempotent.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("ingestion task join failed: {err}");
            }
        }
    }
}

struct Worker {
    entry_store: Arc<EntryStore>,
    event_store: Arc<event_store::MemoryStore>,
    transaction_store: Arc<transaction_store::MemoryStore>,
    backend: Arc<dyn LedgerBackend>,
    archive: Arc<dyn HistoryArchive>,
    timeout: Duration,
    max_batch_size: usize,
    retry: RetryPolicy,
}

impl Worker {
    async fn run_with_retries(self, cancel: CancellationToken) {
        let retry = self.retry.clone();
        let result = retry
            .retry_async(&cancel, |attempt| {
                if attempt > 0 {
                    warn!("restarting ingestion (attempt {attempt})");
                }
                self.run(&cancel)
            })
            .await;
        match result {
            Ok(never) => match never {},
            Err(err) if err.is_cancelled() || cancel.is_cancelled() => {
                info!("ingestion stopped");
            }
            Err(err) => {
                error!("could not run ingestion: {err}");
                std::process::exit(1);
            }
        }
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<Infallible, IngestError> {
        let baseline_cancel = cancel.child_token();
        let (start_seq, baseline) = self.prepare_baseline(&baseline_cancel).await?;

        let prepared = match timeout(
            self.timeout,
            self.backend.prepare_range(cancel, start_seq),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(IngestError::DeadlineExceeded),
        };

        // The baseline task must be joined before streaming, and on every
        // exit path so its write transaction is settled.
        if let Some(handle) = baseline {
            if prepared.is_err() {
                baseline_cancel.cancel();
            }
            let joined = match handle.await {
                Ok(result) => result,
                Err(err) => Err(IngestError::Archive(format!("baseline task failed: {err}"))),
            };
            prepared?;
            joined?;
        } else {
            prepared?;
        }

        let mut seq = start_seq;
        loop {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            self.apply_ledger(cancel, seq).await?;
            seq += 1;
        }
    }

    /// Decides where streaming starts. An empty entry store kicks off a
    /// parallel checkpoint prefill whose handle the caller must join.
    #[allow(clippy::type_complexity)]
    async fn prepare_baseline(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(LedgerSeq, Option<JoinHandle<Result<(), IngestError>>>), IngestError> {
        match self.entry_store.get_latest_sequence()? {
            Some(seq) => Ok((seq + 1, None)),
            None => {
                let root = self.archive.get_root().await?;
                let checkpoint = root.current_ledger;
                info!(
                    "found an empty entry store, seeding baseline from checkpoint {checkpoint}; \
                     this can take a while"
                );
                let store = Arc::clone(&self.entry_store);
                let archive = Arc::clone(&self.archive);
                let deadline = self.timeout;
                let max_batch_size = self.max_batch_size;
                let cancel = cancel.clone();
                let handle = tokio::spawn(async move {
                    fill_entries_from_checkpoint(
                        store,
                        archive,
                        checkpoint,
                        max_batch_size,
                        deadline,
                        cancel,
                    )
                    .await
                });
                Ok((checkpoint + 1, Some(handle)))
            }
        }
    }

    async fn apply_ledger(
        &self,
        cancel: &CancellationToken,
        seq: LedgerSeq,
    ) -> Result<(), IngestError> {
        let meta = tokio::select! {
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            result = self.backend.get_ledger(cancel, seq) => result?,
        };
        debug!("applying ledger {seq}");

        // Stage both in-memory buckets before touching the database so a
        // parse failure leaves every store at the previous ledger.
        let events = event_store::MemoryStore::prepare(&meta)?;
        let transactions = transaction_store::MemoryStore::prepare(&meta);

        let mut updater = self.entry_store.begin_update(seq, self.max_batch_size)?;
        apply_entry_changes(&mut updater, &meta)?;
        updater.commit()?;

        // The staged buckets become visible only after the commit.
        self.event_store.append(events);
        self.transaction_store.append(transactions);
        info!("applied ledger {seq}");
        Ok(())
    }
}

fn apply_entry_changes(updater: &mut Updater, meta: &LedgerCloseMeta) -> Result<(), IngestError> {
    let mut reader = CloseMetaChangeReader::new(meta);
    while let Some(change) = reader.next() {
        apply_change(updater, change)?;
    }
    reader.close();
    Ok(())
}

fn apply_change(updater: &mut Updater, change: &EntryChange) -> Result<(), IngestError> {
    match change {
        EntryChange::Created(entry) | EntryChange::Updated(entry) => {
            updater.upsert(&entry.key(), entry)?;
        }
        EntryChange::Removed(key) => updater.delete(key)?,
    }
    Ok(())
}

async fn fill_entries_from_checkpoint(
    store: Arc<EntryStore>,
    archive: Arc<dyn HistoryArchive>,
    checkpoint: LedgerSeq,
    max_batch_size: usize,
    deadline: Duration,
    cancel: CancellationToken,
) -> Result<(), IngestError> {
    let fill = async {
        let mut reader = archive.checkpoint_changes(checkpoint).await?;
        let mut updater = store.begin_update(checkpoint, max_batch_size)?;
        let mut applied = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            let Some(change) = reader.next().await? else {
                break;
            };
            apply_change(&mut updater, &change)?;
            applied += 1;
            if applied % BASELINE_PROGRESS_LOG_PERIOD == 0 {
                info!("checkpoint baseline: {applied} entries applied");
            }
        }
        reader.close().await?;
        info!("committing checkpoint baseline at ledger {checkpoint} ({applied} entries)");
        updater.commit()?;
        Ok(())
    };
    match timeout(deadline, fill).await {
        Ok(result) => result,
        Err(_) => Err(IngestError::DeadlineExceeded),
    }
}
