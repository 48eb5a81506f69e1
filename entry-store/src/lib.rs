// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Durable ledger-entry store backed by a single-file SQLite database.
//!
//! The database runs in WAL mode with `synchronous=NORMAL` and automatic
//! checkpointing disabled; every committed write transaction is followed by
//! an explicit `wal_checkpoint(TRUNCATE)`. Writes go through one dedicated
//! connection; each read checks a read-only connection out of a small pool,
//! so concurrent reads run in parallel and isolation comes from WAL
//! snapshots rather than a process-level lock.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use core_types::codec::{self, CodecError, EncodingBuffer};
use core_types::ledger::{LedgerEntry, LedgerKey, LedgerSeq};
use log::warn;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;

const LATEST_LEDGER_SEQUENCE_KEY: &str = "LatestLedgerSequence";

/// Forward-only migration list, applied in order at open time. Applied ids
/// are recorded in the `migrations` table and never re-run.
const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_ledger_entries",
    "CREATE TABLE ledger_entries (
         key   BLOB PRIMARY KEY,
         entry BLOB NOT NULL
     );
     CREATE TABLE metadata (
         key   TEXT PRIMARY KEY,
         value TEXT NOT NULL
     );",
)];

pub type Result<T> = std::result::Result<T, EntryStoreError>;

#[derive(Debug, Error)]
pub enum EntryStoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("entry codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("entry store is empty")]
    Empty,
    #[error("corrupt latest-sequence metadata: {0:?}")]
    CorruptMetadata(String),
}

/// Idle read-only connections kept for reuse; reads beyond this many in
/// flight open (and afterwards discard) extra connections.
const READER_POOL_LIMIT: usize = 8;

/// Pool of read-only connections. Checking out never blocks on another
/// reader: when the idle list is empty a fresh connection is opened, and
/// SQLite's WAL mode lets all of them read concurrently.
struct ReaderPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl ReaderPool {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            idle: Mutex::new(Vec::new()),
        }
    }

    fn checkout(&self) -> Result<PooledReader<'_>> {
        let idle = self.idle.lock().unwrap().pop();
        let conn = match idle {
            Some(conn) => conn,
            None => open_reader(&self.path)?,
        };
        Ok(PooledReader {
            pool: self,
            conn: Some(conn),
        })
    }
}

/// A checked-out read-only connection, returned to the pool on drop.
struct PooledReader<'a> {
    pool: &'a ReaderPool,
    conn: Option<Connection>,
}

impl Deref for PooledReader<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("live pooled connection")
    }
}

impl Drop for PooledReader<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut idle = self.pool.idle.lock().unwrap();
            if idle.len() < READER_POOL_LIMIT {
                idle.push(conn);
            }
        }
    }
}

fn open_reader(path: &Path) -> Result<Connection> {
    Ok(Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?)
}

/// Durable key/value store of live ledger entries plus the latest applied
/// ledger sequence, updated together in one transaction.
pub struct EntryStore {
    writer: Arc<Mutex<Connection>>,
    readers: ReaderPool,
}

impl EntryStore {
    /// Opens (creating if necessary) the store at `path` and applies any
    /// pending migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let writer = Connection::open(path)?;
        configure_connection(&writer)?;
        run_migrations(&writer)?;
        let readers = ReaderPool::new(path.to_path_buf());
        // Prime one reader so an unreadable database fails here, not on
        // the first query.
        drop(readers.checkout()?);
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            readers,
        })
    }

    /// The sequence of the most recently committed ledger, or `None` when
    /// the store has never been written.
    pub fn get_latest_sequence(&self) -> Result<Option<LedgerSeq>> {
        let reader = self.readers.checkout()?;
        let tx = reader.unchecked_transaction()?;
        read_latest_sequence(&tx)
    }

    /// Looks up one entry by key. The entry (or its absence) and the
    /// returned latest sequence come from the same database snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`EntryStoreError::Empty`] when the store has never been
    /// written.
    ///
    /// # Panics
    ///
    /// Panics if more than one row exists for the key; the schema makes the
    /// key a primary key, so a duplicate means the database is corrupt.
    pub fn get_entry(&self, key: &LedgerKey) -> Result<(Option<LedgerEntry>, LedgerSeq)> {
        let encoded_key = EncodingBuffer::new().encode_key(key);
        let reader = self.readers.checkout()?;
        let tx = reader.unchecked_transaction()?;
        let seq = read_latest_sequence(&tx)?.ok_or(EntryStoreError::Empty)?;
        let mut stmt = tx.prepare_cached("SELECT entry FROM ledger_entries WHERE key = ?1")?;
        let rows = stmt
            .query_map([&encoded_key], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;
        match rows.as_slice() {
            [] => Ok((None, seq)),
            [entry] => Ok((Some(codec::decode_entry(entry)?), seq)),
            _ => panic!(
                "{} rows for ledger entry key {} (primary key violated)",
                rows.len(),
                hex::encode(&encoded_key)
            ),
        }
    }

    /// Opens a write transaction targeting `target_ledger_seq`. Buffered
    /// operations flush to the database once `max_batch_size` distinct keys
    /// accumulate. Dropping the updater without committing rolls back.
    pub fn begin_update(&self, target_ledger_seq: LedgerSeq, max_batch_size: usize) -> Result<Updater> {
        {
            let conn = self.writer.lock().unwrap();
            conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(Updater {
            conn: Arc::clone(&self.writer),
            target_ledger_seq,
            max_batch_size: max_batch_size.max(1),
            batch: HashMap::new(),
            buffer: EncodingBuffer::new(),
            finished: false,
        })
    }
}

/// A buffered write transaction. The last operation on a key within the
/// transaction wins; a delete is buffered as a missing entry for the key.
pub struct Updater {
    conn: Arc<Mutex<Connection>>,
    target_ledger_seq: LedgerSeq,
    max_batch_size: usize,
    batch: HashMap<Vec<u8>, Option<Vec<u8>>>,
    buffer: EncodingBuffer,
    finished: bool,
}

impl Updater {
    /// Buffers a create-or-overwrite of `key`.
    pub fn upsert(&mut self, key: &LedgerKey, entry: &LedgerEntry) -> Result<()> {
        let encoded_key = self.buffer.encode_key(key);
        let encoded_entry = self.buffer.encode_entry(entry);
        self.batch.insert(encoded_key, Some(encoded_entry));
        self.maybe_flush()
    }

    /// Buffers a delete of `key`.
    pub fn delete(&mut self, key: &LedgerKey) -> Result<()> {
        let encoded_key = self.buffer.encode_key(key);
        self.batch.insert(encoded_key, None);
        self.maybe_flush()
    }

    /// Flushes remaining buffered operations, records the target ledger
    /// sequence, and commits. The post-commit WAL checkpoint is an
    /// optimization: its failure is logged but the commit stands.
    pub fn commit(mut self) -> Result<()> {
        self.flush()?;
        let conn = self.conn.lock().unwrap();
        {
            let mut stmt =
                conn.prepare_cached("INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)")?;
            stmt.execute(params![
                LATEST_LEDGER_SEQUENCE_KEY,
                self.target_ledger_seq.to_string()
            ])?;
        }
        conn.execute_batch("COMMIT")?;
        self.finished = true;
        if let Err(err) = truncate_wal(&conn) {
            warn!("post-commit wal checkpoint failed: {err}");
        }
        Ok(())
    }

    /// Discards the transaction and every buffered operation.
    pub fn rollback(mut self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("ROLLBACK")?;
        self.finished = true;
        self.batch.clear();
        Ok(())
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.batch.len() >= self.max_batch_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Issues one multi-row upsert and one multi-row delete covering the
    /// buffered keys, then clears the buffer.
    fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let mut upserts: Vec<(&Vec<u8>, &Vec<u8>)> = Vec::new();
        let mut deletes: Vec<&Vec<u8>> = Vec::new();
        for (key, entry) in &self.batch {
            match entry {
                Some(entry) => upserts.push((key, entry)),
                None => deletes.push(key),
            }
        }

        let conn = self.conn.lock().unwrap();
        if !upserts.is_empty() {
            let placeholders = vec!["(?, ?)"; upserts.len()].join(", ");
            let sql =
                format!("INSERT OR REPLACE INTO ledger_entries (key, entry) VALUES {placeholders}");
            let mut stmt = conn.prepare_cached(&sql)?;
            stmt.execute(rusqlite::params_from_iter(
                upserts.iter().flat_map(|(key, entry)| [*key, *entry]),
            ))?;
        }
        if !deletes.is_empty() {
            let placeholders = vec!["?"; deletes.len()].join(", ");
            let sql = format!("DELETE FROM ledger_entries WHERE key IN ({placeholders})");
            let mut stmt = conn.prepare_cached(&sql)?;
            stmt.execute(rusqlite::params_from_iter(deletes.iter()))?;
        }
        drop(conn);
        self.batch.clear();
        Ok(())
    }
}

impl Drop for Updater {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Ok(conn) = self.conn.lock() {
            if let Err(err) = conn.execute_batch("ROLLBACK") {
                warn!("could not roll back abandoned entry-store transaction: {err}");
            }
        }
    }
}

fn configure_connection(conn: &Connection) -> Result<()> {
    // The mode-setting pragmas return a result row; read it so the
    // statement completes.
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    let _autocheckpoint: i64 =
        conn.query_row("PRAGMA wal_autocheckpoint=0", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA synchronous=NORMAL")?;
    Ok(())
}

fn truncate_wal(conn: &Connection) -> rusqlite::Result<()> {
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
             id         TEXT PRIMARY KEY,
             applied_at TEXT NOT NULL
         )",
    )?;
    for (id, sql) in MIGRATIONS {
        let applied: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM migrations WHERE id = ?1)",
            [id],
            |row| row.get(0),
        )?;
        if applied {
            continue;
        }
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO migrations (id, applied_at) VALUES (?1, datetime('now'))",
            [id],
        )?;
        tx.commit()?;
    }
    Ok(())
}

fn read_latest_sequence(conn: &Connection) -> Result<Option<LedgerSeq>> {
    let mut stmt = conn.prepare_cached("SELECT value FROM metadata WHERE key = ?1")?;
    let value: Option<String> = stmt
        .query_row([LATEST_LEDGER_SEQUENCE_KEY], |row| row.get(0))
        .optional()?;
    match value {
        None => Ok(None),
        Some(raw) => raw
            .parse::<LedgerSeq>()
            .map(Some)
            .map_err(|_| EntryStoreError::CorruptMetadata(raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::ledger::LedgerEntryData;
    use core_types::value::{ContractId, Val};
    use tempfile::tempdir;

    fn entry(contract: u8, key: &str, val: i64) -> LedgerEntry {
        LedgerEntry {
            last_modified_ledger: 1,
            data: LedgerEntryData::ContractData {
                contract_id: ContractId([contract; 32]),
                key: Val::symbol(key),
                val: Val::I64(val),
            },
        }
    }

    #[test]
    fn fresh_store_is_empty() {
        let dir = tempdir().unwrap();
        let store = EntryStore::open(dir.path().join("entries.sqlite")).unwrap();
        assert_eq!(store.get_latest_sequence().unwrap(), None);
        let key = entry(1, "missing", 0).key();
        assert!(matches!(
            store.get_entry(&key).unwrap_err(),
            EntryStoreError::Empty
        ));
    }

    #[test]
    fn commit_advances_the_latest_sequence() {
        let dir = tempdir().unwrap();
        let store = EntryStore::open(dir.path().join("entries.sqlite")).unwrap();

        let first = entry(1, "a", 10);
        let mut updater = store.begin_update(12, 150).unwrap();
        updater.upsert(&first.key(), &first).unwrap();
        updater.commit().unwrap();
        assert_eq!(store.get_latest_sequence().unwrap(), Some(12));

        let second = entry(1, "b", 20);
        let mut updater = store.begin_update(13, 150).unwrap();
        updater.upsert(&second.key(), &second).unwrap();
        updater.commit().unwrap();
        assert_eq!(store.get_latest_sequence().unwrap(), Some(13));

        let (found, seq) = store.get_entry(&first.key()).unwrap();
        assert_eq!(found, Some(first));
        assert_eq!(seq, 13);
    }

    #[test]
    fn last_operation_on_a_key_wins() {
        let dir = tempdir().unwrap();
        let store = EntryStore::open(dir.path().join("entries.sqlite")).unwrap();

        let old = entry(2, "counter", 1);
        let new = entry(2, "counter", 2);
        assert_eq!(old.key(), new.key());

        let mut updater = store.begin_update(5, 150).unwrap();
        updater.upsert(&old.key(), &old).unwrap();
        updater.upsert(&new.key(), &new).unwrap();
        updater.commit().unwrap();

        let (found, seq) = store.get_entry(&new.key()).unwrap();
        assert_eq!(found, Some(new));
        assert_eq!(seq, 5);
    }

    #[test]
    fn upsert_then_delete_leaves_the_key_absent() {
        let dir = tempdir().unwrap();
        let store = EntryStore::open(dir.path().join("entries.sqlite")).unwrap();

        let target = entry(3, "ephemeral", 7);
        let mut updater = store.begin_update(10, 150).unwrap();
        updater.upsert(&target.key(), &target).unwrap();
        updater.delete(&target.key()).unwrap();
        updater.commit().unwrap();

        let (found, seq) = store.get_entry(&target.key()).unwrap();
        assert_eq!(found, None);
        assert_eq!(seq, 10);
        assert_eq!(store.get_latest_sequence().unwrap(), Some(10));
    }

    #[test]
    fn distinct_keys_reach_their_final_state() {
        let dir = tempdir().unwrap();
        let store = EntryStore::open(dir.path().join("entries.sqlite")).unwrap();

        // Small batch size so the buffer flushes mid-transaction.
        let mut updater = store.begin_update(30, 2).unwrap();
        let mut entries = Vec::new();
        for i in 0..7 {
            let e = entry(4, &format!("key-{i}"), i as i64);
            updater.upsert(&e.key(), &e).unwrap();
            entries.push(e);
        }
        updater.delete(&entries[0].key()).unwrap();
        updater.commit().unwrap();

        let (gone, _) = store.get_entry(&entries[0].key()).unwrap();
        assert_eq!(gone, None);
        for e in &entries[1..] {
            let (found, seq) = store.get_entry(&e.key()).unwrap();
            assert_eq!(found.as_ref(), Some(e));
            assert_eq!(seq, 30);
        }
    }

    #[test]
    fn rollback_restores_the_pre_transaction_state() {
        let dir = tempdir().unwrap();
        let store = EntryStore::open(dir.path().join("entries.sqlite")).unwrap();

        let keep = entry(5, "keep", 1);
        let mut updater = store.begin_update(20, 150).unwrap();
        updater.upsert(&keep.key(), &keep).unwrap();
        updater.commit().unwrap();

        let doomed = entry(5, "doomed", 2);
        let replacement = entry(5, "keep", 99);
        let mut updater = store.begin_update(21, 1).unwrap();
        updater.upsert(&doomed.key(), &doomed).unwrap();
        updater.upsert(&replacement.key(), &replacement).unwrap();
        updater.rollback().unwrap();

        assert_eq!(store.get_latest_sequence().unwrap(), Some(20));
        let (found, seq) = store.get_entry(&keep.key()).unwrap();
        assert_eq!(found, Some(keep));
        assert_eq!(seq, 20);
        let (gone, _) = store.get_entry(&doomed.key()).unwrap();
        assert_eq!(gone, None);
    }

    #[test]
    fn dropping_an_updater_rolls_back() {
        let dir = tempdir().unwrap();
        let store = EntryStore::open(dir.path().join("entries.sqlite")).unwrap();

        let seeded = entry(6, "seed", 1);
        let mut updater = store.begin_update(7, 150).unwrap();
        updater.upsert(&seeded.key(), &seeded).unwrap();
        updater.commit().unwrap();

        {
            let leaked = entry(6, "leaked", 2);
            let mut updater = store.begin_update(8, 1).unwrap();
            updater.upsert(&leaked.key(), &leaked).unwrap();
            // dropped without commit
        }

        assert_eq!(store.get_latest_sequence().unwrap(), Some(7));
        // The writer connection is usable again after the implicit rollback.
        let next = entry(6, "next", 3);
        let mut updater = store.begin_update(8, 150).unwrap();
        updater.upsert(&next.key(), &next).unwrap();
        updater.commit().unwrap();
        assert_eq!(store.get_latest_sequence().unwrap(), Some(8));
    }

    #[test]
    fn reads_see_the_committed_snapshot_while_a_write_is_in_flight() {
        let dir = tempdir().unwrap();
        let store = EntryStore::open(dir.path().join("entries.sqlite")).unwrap();

        let committed = entry(8, "committed", 1);
        let mut updater = store.begin_update(50, 150).unwrap();
        updater.upsert(&committed.key(), &committed).unwrap();
        updater.commit().unwrap();

        // Batch size 1 forces the pending upsert into the open transaction.
        let pending = entry(8, "pending", 2);
        let mut updater = store.begin_update(51, 1).unwrap();
        updater.upsert(&pending.key(), &pending).unwrap();

        assert_eq!(store.get_latest_sequence().unwrap(), Some(50));
        let (found, seq) = store.get_entry(&committed.key()).unwrap();
        assert_eq!(found, Some(committed));
        assert_eq!(seq, 50);
        let (invisible, _) = store.get_entry(&pending.key()).unwrap();
        assert_eq!(invisible, None);

        updater.commit().unwrap();
        let (visible, seq) = store.get_entry(&pending.key()).unwrap();
        assert_eq!(visible, Some(pending));
        assert_eq!(seq, 51);
    }

    #[test]
    fn readers_run_concurrently() {
        let dir = tempdir().unwrap();
        let store = Arc::new(EntryStore::open(dir.path().join("entries.sqlite")).unwrap());

        let mut entries = Vec::new();
        let mut updater = store.begin_update(60, 150).unwrap();
        for i in 0..4 {
            let e = entry(9, &format!("shared-{i}"), i as i64);
            updater.upsert(&e.key(), &e).unwrap();
            entries.push(e);
        }
        updater.commit().unwrap();

        let entries = Arc::new(entries);
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                let entries = Arc::clone(&entries);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let wanted = &entries[(t + i) % entries.len()];
                        let (found, seq) = store.get_entry(&wanted.key()).unwrap();
                        assert_eq!(found.as_ref(), Some(wanted));
                        assert_eq!(seq, 60);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn reopen_preserves_state_and_skips_applied_migrations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entries.sqlite");

        let persisted = entry(7, "durable", 5);
        {
            let store = EntryStore::open(&path).unwrap();
            let mut updater = store.begin_update(100, 150).unwrap();
            updater.upsert(&persisted.key(), &persisted).unwrap();
            updater.commit().unwrap();
        }

        let store = EntryStore::open(&path).unwrap();
        assert_eq!(store.get_latest_sequence().unwrap(), Some(100));
        let (found, _) = store.get_entry(&persisted.key()).unwrap();
        assert_eq!(found, Some(persisted));
    }
}
