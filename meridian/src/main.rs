// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! meridian: a JSON-RPC service indexing a Soroban ledger stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use core_types::config::AppConfig;
use core_types::retry::RetryPolicy;
use entry_store::EntryStore;
use event_store::EventQuery;
use ingest_service::{IngestService, IngestServiceConfig, LedgerBackend};
use log::{error, info, warn};

mod archive;
mod rpc;
mod source;

use archive::HttpHistoryArchive;
use rpc::{RpcServer, RpcState};
use source::SocketLedgerSource;

#[tokio::main]
async fn main() {
    env_logger::init();
    let config = AppConfig::load().unwrap_or_else(|err| {
        warn!("failed to load config, using defaults: {err}");
        AppConfig::default()
    });

    let rpc_addr: SocketAddr = match config.rpc_listen_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!("invalid rpc_listen_addr {:?}: {err}", config.rpc_listen_addr);
            std::process::exit(1);
        }
    };

    let entry_store = match EntryStore::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!("could not open entry store at {:?}: {err}", config.db_path);
            std::process::exit(1);
        }
    };
    let event_store = Arc::new(event_store::MemoryStore::new(config.event_retention_window));
    let transaction_store = Arc::new(transaction_store::MemoryStore::new(
        config.transaction_retention_window,
    ));

    let backend = Arc::new(SocketLedgerSource::new(&config.ledger_source_socket));
    let archive = Arc::new(HttpHistoryArchive::new(config.history_archive_url.clone()));

    let ingest = IngestService::start(IngestServiceConfig {
        entry_store: Arc::clone(&entry_store),
        event_store: Arc::clone(&event_store),
        transaction_store: Arc::clone(&transaction_store),
        ledger_backend: backend.clone(),
        archive,
        timeout: Duration::from_secs(config.ingestion_timeout_secs),
        max_batch_size: config.max_ledger_entry_batch_size,
        retry: RetryPolicy::default(),
    });

    let state = Arc::new(RpcState {
        events: EventQuery::new(
            Arc::clone(&event_store),
            config.max_events_limit,
            config.default_events_limit,
        ),
        entry_store,
        transaction_store,
    });
    let server = match RpcServer::start(rpc_addr, state).await {
        Ok(server) => server,
        Err(err) => {
            error!("could not bind rpc listener on {rpc_addr}: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("signal wait failed: {err}");
    }
    info!("shutting down");
    ingest.close().await;
    backend.close().await;
    server.shutdown().await;
}
