// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Ingestion driver: bootstraps the entry store from a history-archive
//! checkpoint, then applies per-ledger deltas to the entry, event, and
//! transaction stores with retry and graceful shutdown.

mod error;
mod reader;
mod service;
mod traits;

pub use error::IngestError;
pub use reader::CloseMetaChangeReader;
pub use service::{IngestService, IngestServiceConfig};
pub use traits::{ArchiveRoot, EntryChangeReader, HistoryArchive, LedgerBackend};
