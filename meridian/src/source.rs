// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Client for the captive ledger source's metadata stream.
//!
//! The source publishes length-prefixed JSON frames, one close record per
//! closed ledger, on a Unix socket. The client buffers frames ahead of the
//! driver and hands them out strictly by sequence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use core_types::ledger::{LedgerCloseMeta, LedgerSeq};
use ingest_service::{IngestError, LedgerBackend};
use log::{info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Frames larger than this indicate a corrupt stream, not a real ledger.
const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

#[derive(Default)]
struct SourceState {
    buffered: HashMap<LedgerSeq, LedgerCloseMeta>,
    disconnected: bool,
    reader: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<SourceState>,
    notify: Notify,
}

pub struct SocketLedgerSource {
    path: PathBuf,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl SocketLedgerSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            shared: Arc::new(Shared::default()),
            cancel: CancellationToken::new(),
        }
    }
}

async fn read_frames(
    mut stream: UnixStream,
    shared: &Shared,
    cancel: CancellationToken,
    from: LedgerSeq,
) -> Result<(), String> {
    loop {
        let mut len_bytes = [0u8; 4];
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = stream.read_exact(&mut len_bytes) => {
                read.map_err(|err| format!("frame header: {err}"))?;
            }
        }
        let len = u32::from_be_bytes(len_bytes);
        if len > MAX_FRAME_BYTES {
            return Err(format!("oversized frame ({len} bytes)"));
        }
        let mut frame = vec![0u8; len as usize];
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = stream.read_exact(&mut frame) => {
                read.map_err(|err| format!("frame body: {err}"))?;
            }
        }
        let meta: LedgerCloseMeta =
            serde_json::from_slice(&frame).map_err(|err| format!("frame decode: {err}"))?;
        let seq = meta.ledger_seq();
        if seq < from {
            continue;
        }
        shared.state.lock().unwrap().buffered.insert(seq, meta);
        shared.notify.notify_waiters();
    }
}

#[async_trait]
impl LedgerBackend for SocketLedgerSource {
    /// Connects to the metadata socket and starts buffering frames for
    /// `[from, ∞)`. A previous reader, if any, is torn down first.
    async fn prepare_range(
        &self,
        cancel: &CancellationToken,
        from: LedgerSeq,
    ) -> Result<(), IngestError> {
        let previous = {
            let mut state = self.shared.state.lock().unwrap();
            state.buffered.clear();
            state.disconnected = false;
            state.reader.take()
        };
        if let Some(previous) = previous {
            previous.abort();
            let _ = previous.await;
        }

        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            connected = UnixStream::connect(&self.path) => {
                connected.map_err(|err| {
                    IngestError::Source(format!("connect {}: {err}", self.path.display()))
                })?
            }
        };
        info!(
            "ledger source connected on {}, streaming from {from}",
            self.path.display()
        );

        let shared = Arc::clone(&self.shared);
        let reader_cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            if let Err(err) = read_frames(stream, &shared, reader_cancel, from).await {
                warn!("ledger source stream failed: {err}");
            }
            shared.state.lock().unwrap().disconnected = true;
            shared.notify.notify_waiters();
        });
        self.shared.state.lock().unwrap().reader = Some(handle);
        Ok(())
    }

    async fn get_ledger(
        &self,
        cancel: &CancellationToken,
        seq: LedgerSeq,
    ) -> Result<LedgerCloseMeta, IngestError> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock().unwrap();
                // Ledgers before the requested one are never asked for again.
                state.buffered.retain(|&buffered, _| buffered >= seq);
                if let Some(meta) = state.buffered.remove(&seq) {
                    return Ok(meta);
                }
                if state.disconnected {
                    return Err(IngestError::Source(
                        "ledger source disconnected".to_string(),
                    ));
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                _ = notified => {}
            }
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        let reader = self.shared.state.lock().unwrap().reader.take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::ledger::LedgerHeader;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    fn meta(seq: LedgerSeq) -> LedgerCloseMeta {
        LedgerCloseMeta {
            header: LedgerHeader {
                ledger_seq: seq,
                close_time: seq as i64,
            },
            transactions: Vec::new(),
        }
    }

    async fn write_frame(stream: &mut UnixStream, meta: &LedgerCloseMeta) {
        let body = serde_json::to_vec(meta).unwrap();
        stream
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        stream.write_all(&body).await.unwrap();
    }

    #[tokio::test]
    async fn streams_frames_in_sequence_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("source.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let publisher = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Frames below the prepared range are skipped.
            write_frame(&mut stream, &meta(9)).await;
            write_frame(&mut stream, &meta(10)).await;
            write_frame(&mut stream, &meta(11)).await;
            stream
        });

        let source = SocketLedgerSource::new(&path);
        let cancel = CancellationToken::new();
        source.prepare_range(&cancel, 10).await.unwrap();

        assert_eq!(source.get_ledger(&cancel, 10).await.unwrap().ledger_seq(), 10);
        assert_eq!(source.get_ledger(&cancel, 11).await.unwrap().ledger_seq(), 11);

        // Dropping the publisher closes the socket; the next pull reports a
        // source failure for the retry policy to absorb.
        drop(publisher.await.unwrap());
        let err = source.get_ledger(&cancel, 12).await.unwrap_err();
        assert!(matches!(err, IngestError::Source(_)));

        source.close().await;
    }

    #[tokio::test]
    async fn connect_failure_is_a_source_error() {
        let dir = tempdir().unwrap();
        let source = SocketLedgerSource::new(dir.path().join("missing.sock"));
        let cancel = CancellationToken::new();
        let err = source.prepare_range(&cancel, 1).await.unwrap_err();
        assert!(matches!(err, IngestError::Source(_)));
    }
}
