// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! In-memory index of recently applied transactions, keyed by hash and
//! bounded by the same ledger retention window as the event store.

use std::collections::HashMap;

use core_types::ledger::{LedgerCloseMeta, LedgerSeq, TxHash};
use ledger_window::{LedgerBucket, LedgerBucketWindow};
use parking_lot::RwLock;

#[derive(Clone, Debug)]
struct StoredTransaction {
    hash: TxHash,
    successful: bool,
    result_meta: Vec<u8>,
    /// 1-based position within the ledger.
    application_order: u32,
}

/// A hash lookup result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionInfo {
    pub result_meta: Vec<u8>,
    pub successful: bool,
    pub application_order: u32,
    pub ledger: LedgerSeq,
    pub ledger_close_time: i64,
}

/// The parsed, not-yet-visible transactions of one ledger.
pub struct TransactionBucket {
    bucket: LedgerBucket<Vec<StoredTransaction>>,
}

impl TransactionBucket {
    pub fn ledger_seq(&self) -> LedgerSeq {
        self.bucket.ledger_seq
    }
}

struct Inner {
    transactions_by_ledger: LedgerBucketWindow<Vec<StoredTransaction>>,
    // position of each live transaction: (ledger, index into the bucket)
    by_hash: HashMap<TxHash, (LedgerSeq, usize)>,
}

/// In-memory store of applied transactions for the trailing retention
/// window. Only applied transactions appear; anything never submitted to a
/// ledger is unknown here.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new(retention_window: u32) -> Self {
        Self {
            inner: RwLock::new(Inner {
                transactions_by_ledger: LedgerBucketWindow::new(retention_window),
                by_hash: HashMap::new(),
            }),
        }
    }

    /// Parses a close record into a staged bucket; both successful and
    /// failed applied transactions are kept. No locks are taken.
    pub fn prepare(ledger_close_meta: &LedgerCloseMeta) -> TransactionBucket {
        let transactions = ledger_close_meta
            .transactions
            .iter()
            .enumerate()
            .map(|(position, tx)| StoredTransaction {
                hash: tx.hash,
                successful: tx.successful,
                result_meta: tx.result_meta.clone(),
                application_order: position as u32 + 1,
            })
            .collect();
        TransactionBucket {
            bucket: LedgerBucket {
                ledger_seq: ledger_close_meta.ledger_seq(),
                ledger_close_timestamp: ledger_close_meta.close_time(),
                content: transactions,
            },
        }
    }

    /// Makes a staged bucket visible. Evicting a full window drops the
    /// evicted ledger's hashes from the index.
    ///
    /// # Panics
    ///
    /// Panics if the bucket's ledger is not contiguous with the newest one.
    pub fn append(&self, staged: TransactionBucket) {
        let ledger_seq = staged.bucket.ledger_seq;
        let mut inner = self.inner.write();
        let evicted = inner.transactions_by_ledger.append(staged.bucket);
        if let Some(evicted) = evicted {
            for tx in &evicted.content {
                inner.by_hash.remove(&tx.hash);
            }
        }
        let window = &inner.transactions_by_ledger;
        let newest = window.get(window.len() - 1);
        let indexed: Vec<(TxHash, usize)> = newest
            .content
            .iter()
            .enumerate()
            .map(|(i, tx)| (tx.hash, i))
            .collect();
        for (hash, i) in indexed {
            inner.by_hash.insert(hash, (ledger_seq, i));
        }
    }

    /// Parses and appends in one step.
    pub fn ingest(&self, ledger_close_meta: &LedgerCloseMeta) {
        self.append(Self::prepare(ledger_close_meta));
    }

    /// Looks up an applied transaction by hash.
    pub fn get_transaction(&self, hash: &TxHash) -> Option<TransactionInfo> {
        let inner = self.inner.read();
        let (ledger, index) = *inner.by_hash.get(hash)?;
        let window = &inner.transactions_by_ledger;
        let earliest = window.get(0).ledger_seq;
        let bucket = window.get(ledger - earliest);
        let tx = &bucket.content[index];
        Some(TransactionInfo {
            result_meta: tx.result_meta.clone(),
            successful: tx.successful,
            application_order: tx.application_order,
            ledger: bucket.ledger_seq,
            ledger_close_time: bucket.ledger_close_timestamp,
        })
    }

    /// The newest ledger in the store, or zero when empty.
    pub fn latest_ledger(&self) -> LedgerSeq {
        let inner = self.inner.read();
        let window = &inner.transactions_by_ledger;
        if window.is_empty() {
            0
        } else {
            window.get(window.len() - 1).ledger_seq
        }
    }
}
