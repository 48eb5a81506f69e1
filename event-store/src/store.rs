use core_types::event::ContractEvent;
use core_types::ledger::{LedgerCloseMeta, LedgerSeq};
use ledger_window::{LedgerBucket, LedgerBucketWindow};
use parking_lot::RwLock;
use thiserror::Error;

use crate::cursor::Cursor;

/// A `[start, end)` interval of the event stream.
#[derive(Clone, Copy, Debug)]
pub struct Range {
    /// Inclusive start of the range.
    pub start: Cursor,
    /// Whether `start` may be clamped up to the earliest available ledger.
    pub clamp_start: bool,
    /// Exclusive end of the range.
    pub end: Cursor,
    /// Whether `end` may be clamped down to just past the latest ledger.
    pub clamp_end: bool,
}

/// Range-validation failures, rendered with the literal messages the RPC
/// surface returns to callers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("event store is empty")]
    Empty,
    #[error("start is before oldest ledger")]
    StartBeforeOldest,
    #[error("start is after newest ledger")]
    StartAfterNewest,
    #[error("end is after latest ledger")]
    EndAfterLatest,
    #[error("start is not before end")]
    StartNotBeforeEnd,
}

/// Failure while parsing a close record into events. The store is left
/// untouched when this is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("event in transaction {tx_index} has {count} topics, expected 1 to 4")]
    BadTopicCount { tx_index: u32, count: usize },
}

#[derive(Clone, Debug)]
struct EventEntry {
    event: ContractEvent,
    tx_index: u32,
    op_index: u32,
    event_index: u32,
}

impl EventEntry {
    fn cursor(&self, ledger_seq: LedgerSeq) -> Cursor {
        Cursor {
            ledger: ledger_seq,
            tx: self.tx_index,
            op: self.op_index,
            event: self.event_index,
        }
    }
}

/// The parsed, not-yet-visible events of one ledger. Produced by
/// [`MemoryStore::prepare`], made visible by [`MemoryStore::append`].
pub struct EventBucket {
    bucket: LedgerBucket<Vec<EventEntry>>,
}

impl EventBucket {
    pub fn ledger_seq(&self) -> LedgerSeq {
        self.bucket.ledger_seq
    }
}

/// In-memory store of contract events for the trailing retention window.
///
/// Events in the range `[latest - retention + 1, latest]` are queryable;
/// appending a new ledger evicts the oldest one once the window is full.
pub struct MemoryStore {
    events_by_ledger: RwLock<LedgerBucketWindow<Vec<EventEntry>>>,
}

impl MemoryStore {
    /// Creates a store retaining `retention_window` ledgers of events.
    pub fn new(retention_window: u32) -> Self {
        Self {
            events_by_ledger: RwLock::new(LedgerBucketWindow::new(retention_window)),
        }
    }

    /// Parses a close record into a staged bucket. Events come only from
    /// successful transactions; failed ones contribute nothing. No locks
    /// are taken and the store is not modified.
    pub fn prepare(ledger_close_meta: &LedgerCloseMeta) -> Result<EventBucket, IngestError> {
        let mut events = Vec::new();
        for (position, tx) in ledger_close_meta.transactions.iter().enumerate() {
            if !tx.successful {
                continue;
            }
            let tx_index = position as u32 + 1;
            for (op_index, op) in tx.operations.iter().enumerate() {
                for (event_index, event) in op.events.iter().enumerate() {
                    let topics = event.topics.len();
                    if !(1..=4).contains(&topics) {
                        return Err(IngestError::BadTopicCount {
                            tx_index,
                            count: topics,
                        });
                    }
                    events.push(EventEntry {
                        event: event.clone(),
                        tx_index,
                        op_index: op_index as u32,
                        event_index: event_index as u32,
                    });
                }
            }
        }
        Ok(EventBucket {
            bucket: LedgerBucket {
                ledger_seq: ledger_close_meta.ledger_seq(),
                ledger_close_timestamp: ledger_close_meta.close_time(),
                content: events,
            },
        })
    }

    /// Makes a staged bucket visible, evicting the oldest ledger if the
    /// window is full.
    ///
    /// # Panics
    ///
    /// Panics if the bucket's ledger is not contiguous with the newest one
    /// in the window; the ingestion driver feeds ledgers in order.
    pub fn append(&self, staged: EventBucket) {
        let mut window = self.events_by_ledger.write();
        window.append(staged.bucket);
    }

    /// Parses and appends in one step.
    pub fn ingest(&self, ledger_close_meta: &LedgerCloseMeta) -> Result<(), IngestError> {
        let staged = Self::prepare(ledger_close_meta)?;
        self.append(staged);
        Ok(())
    }

    /// The newest ledger with events in the store, or zero when empty.
    pub fn latest_ledger(&self) -> LedgerSeq {
        let window = self.events_by_ledger.read();
        if window.is_empty() {
            0
        } else {
            window.get(window.len() - 1).ledger_seq
        }
    }

    /// Applies `visitor` to every event in `range` in ascending cursor
    /// order, stopping early when the visitor returns `false`. Returns the
    /// latest ledger in the store.
    ///
    /// The read lock is held for the whole scan, so visitors must be cheap
    /// and must not block.
    pub fn scan<F>(&self, range: Range, mut visitor: F) -> Result<LedgerSeq, RangeError>
    where
        F: FnMut(&ContractEvent, Cursor, i64) -> bool,
    {
        let window = self.events_by_ledger.read();
        let range = validate_range(&window, range)?;

        let first_ledger_in_window = window.get(0).ledger_seq;
        let last_ledger_in_window = first_ledger_in_window + (window.len() - 1);
        for i in (range.start.ledger - first_ledger_in_window)..window.len() {
            let bucket = window.get(i);
            let events = &bucket.content;
            let start = if bucket.ledger_seq == range.start.ledger {
                seek(events, range.start)
            } else {
                0
            };
            for entry in &events[start..] {
                let cursor = entry.cursor(bucket.ledger_seq);
                if range.end <= cursor {
                    return Ok(last_ledger_in_window);
                }
                if !visitor(&entry.event, cursor, bucket.ledger_close_timestamp) {
                    return Ok(last_ledger_in_window);
                }
            }
        }
        Ok(last_ledger_in_window)
    }
}

/// Checks the range against the window bounds, clamping where the caller
/// allowed it. Must run under the read lock.
fn validate_range(
    window: &LedgerBucketWindow<Vec<EventEntry>>,
    mut range: Range,
) -> Result<Range, RangeError> {
    if window.is_empty() {
        return Err(RangeError::Empty);
    }
    let min = Cursor {
        ledger: window.get(0).ledger_seq,
        ..Cursor::default()
    };
    if range.start < min {
        if range.clamp_start {
            range.start = min;
        } else {
            return Err(RangeError::StartBeforeOldest);
        }
    }
    let max = Cursor {
        ledger: min.ledger + window.len(),
        ..Cursor::default()
    };
    if range.start >= max {
        return Err(RangeError::StartAfterNewest);
    }
    if range.end > max {
        if range.clamp_end {
            range.end = max;
        } else {
            return Err(RangeError::EndAfterLatest);
        }
    }
    if range.start >= range.end {
        return Err(RangeError::StartNotBeforeEnd);
    }
    Ok(range)
}

/// Index of the first event at or past `cursor`; events are cursor-sorted.
fn seek(events: &[EventEntry], cursor: Cursor) -> usize {
    events.partition_point(|entry| entry.cursor(cursor.ledger) < cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::event::{ContractEvent, EventType};
    use core_types::ledger::{LedgerCloseMeta, LedgerHeader, OperationMeta, TransactionMeta};
    use core_types::value::{ContractId, Val};

    fn event(tag: u64) -> ContractEvent {
        ContractEvent {
            contract_id: Some(ContractId([0u8; 32])),
            event_type: EventType::Contract,
            topics: vec![Val::symbol("COUNTER")],
            value: Val::U64(tag),
        }
    }

    fn tx(successful: bool, ops: Vec<Vec<ContractEvent>>) -> TransactionMeta {
        TransactionMeta {
            hash: [0u8; 32],
            successful,
            result_meta: Vec::new(),
            operations: ops
                .into_iter()
                .map(|events| OperationMeta { events })
                .collect(),
            entry_changes: Vec::new(),
        }
    }

    fn close_meta(seq: LedgerSeq, close_time: i64, txs: Vec<TransactionMeta>) -> LedgerCloseMeta {
        LedgerCloseMeta {
            header: LedgerHeader {
                ledger_seq: seq,
                close_time,
            },
            transactions: txs,
        }
    }

    fn collect(store: &MemoryStore, range: Range) -> Result<(Vec<Cursor>, LedgerSeq), RangeError> {
        let mut cursors = Vec::new();
        let latest = store.scan(range, |_, cursor, _| {
            cursors.push(cursor);
            true
        })?;
        Ok((cursors, latest))
    }

    fn full_range(start_ledger: LedgerSeq, clamp_start: bool) -> Range {
        Range {
            start: Cursor {
                ledger: start_ledger,
                ..Cursor::default()
            },
            clamp_start,
            end: Cursor::MAX,
            clamp_end: true,
        }
    }

    #[test]
    fn empty_store_scan_fails() {
        let store = MemoryStore::new(100);
        assert_eq!(
            collect(&store, full_range(1, true)).unwrap_err(),
            RangeError::Empty
        );
        assert_eq!(RangeError::Empty.to_string(), "event store is empty");
        assert_eq!(store.latest_ledger(), 0);
    }

    #[test]
    fn two_events_in_two_transactions_scan_in_order() {
        let store = MemoryStore::new(100);
        store
            .ingest(&close_meta(
                5,
                1_600_000_000,
                vec![tx(true, vec![vec![event(1)]]), tx(true, vec![vec![event(2)]])],
            ))
            .unwrap();

        let range = Range {
            start: Cursor {
                ledger: 1,
                ..Cursor::default()
            },
            clamp_start: true,
            end: Cursor {
                ledger: 6,
                ..Cursor::default()
            },
            clamp_end: false,
        };
        let (cursors, latest) = collect(&store, range).unwrap();
        assert_eq!(latest, 5);
        assert_eq!(
            cursors
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<String>>(),
            vec![
                "5-000000000100000000000000000000".to_string(),
                "5-000000000200000000000000000000".to_string(),
            ]
        );
        assert_eq!(store.latest_ledger(), 5);
    }

    #[test]
    fn retention_window_evicts_and_rejects_stale_starts() {
        let store = MemoryStore::new(3);
        for seq in 1..=5 {
            store
                .ingest(&close_meta(
                    seq,
                    1_600_000_000 + seq as i64,
                    vec![tx(true, vec![vec![event(seq as u64)]])],
                ))
                .unwrap();
        }

        // earliest=3, latest=5 after eviction
        let (cursors, latest) = collect(&store, full_range(3, false)).unwrap();
        assert_eq!(latest, 5);
        assert_eq!(
            cursors.iter().map(|c| c.ledger).collect::<Vec<u32>>(),
            vec![3, 4, 5]
        );

        assert_eq!(
            collect(&store, full_range(2, false)).unwrap_err(),
            RangeError::StartBeforeOldest
        );
        assert_eq!(
            RangeError::StartBeforeOldest.to_string(),
            "start is before oldest ledger"
        );

        // clamping recovers the same events
        let (clamped, _) = collect(&store, full_range(2, true)).unwrap();
        assert_eq!(clamped, cursors);
    }

    #[test]
    fn range_validation_bounds() {
        let store = MemoryStore::new(10);
        store
            .ingest(&close_meta(2, 0, vec![tx(true, vec![vec![event(0)]])]))
            .unwrap();

        assert_eq!(
            collect(&store, full_range(3, false)).unwrap_err(),
            RangeError::StartAfterNewest
        );

        let past_end = Range {
            start: Cursor {
                ledger: 2,
                ..Cursor::default()
            },
            clamp_start: false,
            end: Cursor {
                ledger: 4,
                ..Cursor::default()
            },
            clamp_end: false,
        };
        assert_eq!(
            collect(&store, past_end).unwrap_err(),
            RangeError::EndAfterLatest
        );

        let inverted = Range {
            start: Cursor {
                ledger: 2,
                tx: 5,
                ..Cursor::default()
            },
            clamp_start: false,
            end: Cursor {
                ledger: 2,
                tx: 1,
                ..Cursor::default()
            },
            clamp_end: false,
        };
        assert_eq!(
            collect(&store, inverted).unwrap_err(),
            RangeError::StartNotBeforeEnd
        );

        // end exactly one past the latest ledger is the full valid range
        let exact = Range {
            start: Cursor {
                ledger: 2,
                ..Cursor::default()
            },
            clamp_start: false,
            end: Cursor {
                ledger: 3,
                ..Cursor::default()
            },
            clamp_end: false,
        };
        let (cursors, _) = collect(&store, exact).unwrap();
        assert_eq!(cursors.len(), 1);
    }

    #[test]
    fn scan_results_are_strictly_ordered_and_bounded() {
        let store = MemoryStore::new(10);
        for seq in 1..=4 {
            store
                .ingest(&close_meta(
                    seq,
                    seq as i64,
                    vec![
                        tx(true, vec![vec![event(1), event(2)], vec![event(3)]]),
                        tx(false, vec![vec![event(99)]]),
                        tx(true, vec![vec![event(4)]]),
                    ],
                ))
                .unwrap();
        }

        let range = Range {
            start: Cursor {
                ledger: 2,
                tx: 1,
                op: 1,
                event: 0,
            },
            clamp_start: false,
            end: Cursor {
                ledger: 4,
                tx: 1,
                op: 0,
                event: 0,
            },
            clamp_end: false,
        };
        let (cursors, _) = collect(&store, range).unwrap();
        assert!(!cursors.is_empty());
        for pair in cursors.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert!(cursors.first().unwrap() >= &range.start);
        assert!(cursors.last().unwrap() < &range.end);
        // failed transactions contributed nothing
        assert!(cursors.iter().all(|c| c.tx != 2));
    }

    #[test]
    fn cursor_at_last_event_of_a_ledger_continues_into_the_next() {
        let store = MemoryStore::new(10);
        store
            .ingest(&close_meta(7, 0, vec![tx(true, vec![vec![event(1)]])]))
            .unwrap();
        store
            .ingest(&close_meta(8, 0, vec![tx(true, vec![vec![event(2)]])]))
            .unwrap();

        // resume exactly after the single event of ledger 7
        let start = Cursor {
            ledger: 7,
            tx: 1,
            op: 0,
            event: 0,
        }
        .next_event();
        let range = Range {
            start,
            clamp_start: false,
            end: Cursor::MAX,
            clamp_end: true,
        };
        let (cursors, _) = collect(&store, range).unwrap();
        assert_eq!(cursors.iter().map(|c| c.ledger).collect::<Vec<u32>>(), vec![8]);
    }

    #[test]
    fn visitor_false_stops_the_scan() {
        let store = MemoryStore::new(10);
        store
            .ingest(&close_meta(
                1,
                0,
                vec![
                    tx(true, vec![vec![event(1)]]),
                    tx(true, vec![vec![event(2)]]),
                    tx(true, vec![vec![event(3)]]),
                ],
            ))
            .unwrap();

        let mut seen = 0;
        store
            .scan(full_range(1, false), |_, _, _| {
                seen += 1;
                seen < 2
            })
            .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn bad_topic_count_leaves_store_unchanged() {
        let store = MemoryStore::new(10);
        let bad = close_meta(
            1,
            0,
            vec![tx(
                true,
                vec![vec![ContractEvent {
                    contract_id: None,
                    event_type: EventType::Contract,
                    topics: Vec::new(),
                    value: Val::U64(0),
                }]],
            )],
        );
        assert!(matches!(
            store.ingest(&bad).unwrap_err(),
            IngestError::BadTopicCount { tx_index: 1, count: 0 }
        ));
        assert_eq!(store.latest_ledger(), 0);
        assert_eq!(
            collect(&store, full_range(1, true)).unwrap_err(),
            RangeError::Empty
        );
    }
}
