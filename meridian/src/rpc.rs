// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! JSON-RPC 2.0 listener fronting the stores.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use core_types::codec::{self, EncodingBuffer};
use core_types::ledger::TxHash;
use entry_store::{EntryStore, EntryStoreError};
use event_store::{EventQuery, GetEventsRequest};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

/// Shared handler state: the queryable stores.
pub struct RpcState {
    pub events: EventQuery,
    pub entry_store: Arc<EntryStore>,
    pub transaction_store: Arc<transaction_store::MemoryStore>,
}

pub struct RpcServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RpcServer {
    pub async fn start(addr: SocketAddr, state: Arc<RpcState>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("JSON-RPC listening on {addr}");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_http(listener, state, shutdown_rx));
        Ok(Self {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn run_http(listener: TcpListener, state: Arc<RpcState>, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let state = Arc::clone(&state);
                                async move {
                                    Ok::<_, hyper::Error>(handle_request(state, req).await)
                                }
                            });
                            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                                warn!("rpc connection error: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        error!("rpc accept error: {err}");
                    }
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize, Debug)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

fn rpc_error(code: i64, message: impl Into<String>) -> RpcErrorBody {
    RpcErrorBody {
        code,
        message: message.into(),
    }
}

async fn handle_request(state: Arc<RpcState>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    if req.method() != Method::POST {
        return Response::builder()
            .status(405)
            .body(Full::new(Bytes::from_static(b"POST only")))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"POST only"))));
    }
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => {
            warn!("rpc body read failed: {err}");
            return json_response(envelope(Value::Null, Err(rpc_error(PARSE_ERROR, "bad body"))));
        }
    };
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return json_response(envelope(
                Value::Null,
                Err(rpc_error(PARSE_ERROR, format!("parse error: {err}"))),
            ));
        }
    };
    let id = request.id.clone();
    let result = dispatch(&state, &request.method, request.params);
    json_response(envelope(id, result))
}

fn envelope(id: Value, result: Result<Value, RpcErrorBody>) -> Value {
    match result {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(err) => json!({ "jsonrpc": "2.0", "id": id, "error": err }),
    }
}

fn json_response(body: Value) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"{}"))))
}

fn dispatch(state: &RpcState, method: &str, params: Value) -> Result<Value, RpcErrorBody> {
    match method {
        "getHealth" => Ok(json!({ "status": "healthy" })),
        "getLatestLedger" => get_latest_ledger(state),
        "getEvents" => get_events(state, params),
        "getLedgerEntry" => get_ledger_entry(state, params),
        "getTransaction" => get_transaction(state, params),
        other => Err(rpc_error(-32601, format!("unknown method {other:?}"))),
    }
}

fn get_latest_ledger(state: &RpcState) -> Result<Value, RpcErrorBody> {
    match state.entry_store.get_latest_sequence() {
        Ok(Some(sequence)) => Ok(json!({ "sequence": sequence })),
        Ok(None) => Err(rpc_error(INTERNAL_ERROR, EntryStoreError::Empty.to_string())),
        Err(err) => Err(internal(err)),
    }
}

fn get_events(state: &RpcState, params: Value) -> Result<Value, RpcErrorBody> {
    let request: GetEventsRequest = serde_json::from_value(params)
        .map_err(|err| rpc_error(INVALID_PARAMS, format!("invalid params: {err}")))?;
    match state.events.get_events(&request) {
        Ok(events) => Ok(json!(events)),
        Err(err) => Err(rpc_error(err.code, err.message)),
    }
}

#[derive(Deserialize)]
struct GetLedgerEntryParams {
    key: String,
}

fn get_ledger_entry(state: &RpcState, params: Value) -> Result<Value, RpcErrorBody> {
    let params: GetLedgerEntryParams = serde_json::from_value(params)
        .map_err(|err| rpc_error(INVALID_PARAMS, format!("invalid params: {err}")))?;
    let raw = BASE64
        .decode(params.key.as_bytes())
        .map_err(|_| rpc_error(INVALID_REQUEST, "cannot unmarshal key value"))?;
    let key =
        codec::decode_key(&raw).map_err(|_| rpc_error(INVALID_REQUEST, "cannot unmarshal key value"))?;
    match state.entry_store.get_entry(&key) {
        Ok((Some(entry), latest_ledger)) => {
            let encoded = BASE64.encode(EncodingBuffer::new().encode_entry(&entry));
            Ok(json!({
                "xdr": encoded,
                "lastModifiedLedgerSeq": entry.last_modified_ledger,
                "latestLedger": latest_ledger,
            }))
        }
        Ok((None, latest_ledger)) => Ok(json!({
            "xdr": Value::Null,
            "latestLedger": latest_ledger,
        })),
        Err(err @ EntryStoreError::Empty) => Err(rpc_error(INTERNAL_ERROR, err.to_string())),
        Err(err) => Err(internal(err)),
    }
}

#[derive(Deserialize)]
struct GetTransactionParams {
    hash: String,
}

fn get_transaction(state: &RpcState, params: Value) -> Result<Value, RpcErrorBody> {
    let params: GetTransactionParams = serde_json::from_value(params)
        .map_err(|err| rpc_error(INVALID_PARAMS, format!("invalid params: {err}")))?;
    let mut hash: TxHash = [0u8; 32];
    if params.hash.len() != 64 || hex::decode_to_slice(&params.hash, &mut hash).is_err() {
        return Err(rpc_error(INVALID_REQUEST, "invalid transaction hash"));
    }
    let latest_ledger = state.transaction_store.latest_ledger();
    match state.transaction_store.get_transaction(&hash) {
        Some(info) => Ok(json!({
            "status": if info.successful { "SUCCESS" } else { "FAILED" },
            "latestLedger": latest_ledger,
            "ledger": info.ledger,
            "createdAt": info.ledger_close_time,
            "applicationOrder": info.application_order,
            "resultMetaXdr": BASE64.encode(info.result_meta),
        })),
        None => Ok(json!({
            "status": "NOT_FOUND",
            "latestLedger": latest_ledger,
        })),
    }
}

fn internal(err: impl std::fmt::Display) -> RpcErrorBody {
    error!("rpc internal error: {err}");
    rpc_error(INTERNAL_ERROR, "internal error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::ledger::{LedgerEntry, LedgerEntryData, LedgerKey};
    use tempfile::tempdir;

    fn state() -> (Arc<RpcState>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let entry_store = Arc::new(EntryStore::open(dir.path().join("rpc.sqlite")).unwrap());
        let events = Arc::new(event_store::MemoryStore::new(100));
        let transaction_store = Arc::new(transaction_store::MemoryStore::new(100));
        (
            Arc::new(RpcState {
                events: EventQuery::new(events, 10000, 100),
                entry_store,
                transaction_store,
            }),
            dir,
        )
    }

    #[test]
    fn get_events_maps_store_errors_to_invalid_request() {
        let (state, _dir) = state();
        let err = dispatch(&state, "getEvents", json!({ "startLedger": 1 })).unwrap_err();
        assert_eq!(err.code, INVALID_REQUEST);
        assert_eq!(err.message, "event store is empty");
    }

    #[test]
    fn get_ledger_entry_round_trips_through_the_codec() {
        let (state, _dir) = state();
        let entry = LedgerEntry {
            last_modified_ledger: 3,
            data: LedgerEntryData::ContractCode {
                hash: [7u8; 32],
                code: vec![1, 2, 3],
            },
        };
        let mut updater = state.entry_store.begin_update(3, 150).unwrap();
        updater.upsert(&entry.key(), &entry).unwrap();
        updater.commit().unwrap();

        let key = BASE64.encode(EncodingBuffer::new().encode_key(&entry.key()));
        let result = dispatch(&state, "getLedgerEntry", json!({ "key": key })).unwrap();
        assert_eq!(result["latestLedger"], 3);
        assert_eq!(result["lastModifiedLedgerSeq"], 3);
        let decoded =
            codec::decode_entry(&BASE64.decode(result["xdr"].as_str().unwrap()).unwrap()).unwrap();
        assert_eq!(decoded, entry);

        // A present store with an absent key is a structured null result.
        let missing = BASE64.encode(EncodingBuffer::new().encode_key(&LedgerKey::ContractCode {
            hash: [8u8; 32],
        }));
        let result = dispatch(&state, "getLedgerEntry", json!({ "key": missing })).unwrap();
        assert!(result["xdr"].is_null());
        assert_eq!(result["latestLedger"], 3);
    }

    #[test]
    fn get_transaction_not_found_is_a_structured_result() {
        let (state, _dir) = state();
        let result =
            dispatch(&state, "getTransaction", json!({ "hash": "ab".repeat(32) })).unwrap();
        assert_eq!(result["status"], "NOT_FOUND");

        let err = dispatch(&state, "getTransaction", json!({ "hash": "xyz" })).unwrap_err();
        assert_eq!(err.code, INVALID_REQUEST);
    }

    #[test]
    fn unknown_method_is_rejected() {
        let (state, _dir) = state();
        let err = dispatch(&state, "simulateTransaction", Value::Null).unwrap_err();
        assert_eq!(err.code, -32601);
    }
}
