// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! HTTP client for the history archive.
//!
//! `GET {base}/root.json` reports the most recent checkpoint; `GET
//! {base}/checkpoint/{seq}` streams that checkpoint's entries as
//! newline-delimited JSON change records, decoded lazily as the ingestion
//! driver consumes them.

use async_trait::async_trait;
use core_types::ledger::{EntryChange, LedgerSeq};
use futures::stream::BoxStream;
use futures::StreamExt;
use ingest_service::{ArchiveRoot, EntryChangeReader, HistoryArchive, IngestError};
use serde::Deserialize;

pub struct HttpHistoryArchive {
    base_url: String,
    client: reqwest::Client,
}

impl HttpHistoryArchive {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RootResponse {
    current_ledger: LedgerSeq,
}

fn archive_err(err: impl std::fmt::Display) -> IngestError {
    IngestError::Archive(err.to_string())
}

#[async_trait]
impl HistoryArchive for HttpHistoryArchive {
    async fn get_root(&self) -> Result<ArchiveRoot, IngestError> {
        let url = format!("{}/root.json", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(archive_err)?
            .error_for_status()
            .map_err(archive_err)?;
        let root: RootResponse = response.json().await.map_err(archive_err)?;
        Ok(ArchiveRoot {
            current_ledger: root.current_ledger,
        })
    }

    async fn checkpoint_changes(
        &self,
        checkpoint: LedgerSeq,
    ) -> Result<Box<dyn EntryChangeReader>, IngestError> {
        let url = format!("{}/checkpoint/{checkpoint}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(archive_err)?
            .error_for_status()
            .map_err(archive_err)?;
        Ok(Box::new(HttpChangeReader {
            stream: Some(response.bytes_stream().boxed()),
            buffer: Vec::new(),
        }))
    }
}

struct HttpChangeReader {
    stream: Option<BoxStream<'static, reqwest::Result<hyper::body::Bytes>>>,
    buffer: Vec<u8>,
}

impl HttpChangeReader {
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let newline = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
        line.pop();
        Some(line)
    }

    fn decode(line: &[u8]) -> Result<Option<EntryChange>, IngestError> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(line)
            .map(Some)
            .map_err(|err| IngestError::Archive(format!("checkpoint record: {err}")))
    }
}

#[async_trait]
impl EntryChangeReader for HttpChangeReader {
    async fn next(&mut self) -> Result<Option<EntryChange>, IngestError> {
        loop {
            while let Some(line) = self.take_line() {
                if let Some(change) = Self::decode(&line)? {
                    return Ok(Some(change));
                }
            }
            let Some(stream) = self.stream.as_mut() else {
                // Stream exhausted; a trailing unterminated record still counts.
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let line = std::mem::take(&mut self.buffer);
                return Self::decode(&line);
            };
            match stream.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => return Err(archive_err(err)),
                None => {
                    self.stream = None;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), IngestError> {
        self.stream = None;
        self.buffer.clear();
        Ok(())
    }
}
