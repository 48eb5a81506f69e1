// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Fixed-capacity ring of per-ledger buckets with O(1) append and eviction.

pub type LedgerSeq = u32;

/// The per-ledger payload of a window slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerBucket<T> {
    pub ledger_seq: LedgerSeq,
    /// Unix timestamp at which the ledger closed.
    pub ledger_close_timestamp: i64,
    pub content: T,
}

/// A bounded ring of buckets covering a contiguous, strictly increasing
/// range of ledger sequences. Appending when full evicts the oldest bucket.
pub struct LedgerBucketWindow<T> {
    slots: Vec<Option<LedgerBucket<T>>>,
    head: usize,
    len: usize,
}

impl<T> LedgerBucketWindow<T> {
    /// Creates a window retaining at most `capacity` ledgers.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0, "retention window must be at least 1 ledger");
        let mut slots = Vec::with_capacity(capacity as usize);
        slots.resize_with(capacity as usize, || None);
        Self {
            slots,
            head: 0,
            len: 0,
        }
    }

    /// Appends the bucket for the next ledger, returning the evicted bucket
    /// when the window was full.
    ///
    /// # Panics
    ///
    /// Panics if the window is non-empty and `bucket.ledger_seq` is not
    /// exactly one past the newest ledger in the window. The first bucket
    /// may carry any sequence.
    pub fn append(&mut self, bucket: LedgerBucket<T>) -> Option<LedgerBucket<T>> {
        if self.len > 0 {
            let expected = self.get(self.len as u32 - 1).ledger_seq + 1;
            if bucket.ledger_seq != expected {
                panic!(
                    "ledger not contiguous: expected sequence {expected}, got {}",
                    bucket.ledger_seq
                );
            }
        }
        if self.len == self.slots.len() {
            let evicted = self.slots[self.head].replace(bucket);
            self.head = (self.head + 1) % self.slots.len();
            evicted
        } else {
            let slot = (self.head + self.len) % self.slots.len();
            self.slots[slot] = Some(bucket);
            self.len += 1;
            None
        }
    }

    /// Returns the bucket at 0-based position `i` from the oldest ledger.
    ///
    /// # Panics
    ///
    /// Panics if `i >= len()`.
    pub fn get(&self, i: u32) -> &LedgerBucket<T> {
        let i = i as usize;
        assert!(i < self.len, "window index {i} out of range 0..{}", self.len);
        let slot = (self.head + i) % self.slots.len();
        self.slots[slot].as_ref().expect("occupied window slot")
    }

    pub fn len(&self) -> u32 {
        self.len as u32
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
