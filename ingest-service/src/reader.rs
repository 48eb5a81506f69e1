use core_types::ledger::{EntryChange, LedgerCloseMeta};

/// Lazy walk over the entry changes of one close record, in transaction
/// application order. All applied transactions contribute changes; a failed
/// transaction still charges fees.
pub struct CloseMetaChangeReader<'a> {
    meta: &'a LedgerCloseMeta,
    tx_index: usize,
    change_index: usize,
}

impl<'a> CloseMetaChangeReader<'a> {
    pub fn new(meta: &'a LedgerCloseMeta) -> Self {
        Self {
            meta,
            tx_index: 0,
            change_index: 0,
        }
    }

    pub fn next(&mut self) -> Option<&'a EntryChange> {
        loop {
            let tx = self.meta.transactions.get(self.tx_index)?;
            match tx.entry_changes.get(self.change_index) {
                Some(change) => {
                    self.change_index += 1;
                    return Some(change);
                }
                None => {
                    self.tx_index += 1;
                    self.change_index = 0;
                }
            }
        }
    }

    pub fn close(self) {}
}
