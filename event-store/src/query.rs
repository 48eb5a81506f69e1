use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat};
use core_types::codec::EncodingBuffer;
use core_types::event::ContractEvent;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cursor::Cursor;
use crate::filter::{EventFilter, FilterError, MAX_FILTERS};
use crate::store::{MemoryStore, Range};

/// JSON-RPC error codes surfaced by the query layer.
pub const INVALID_REQUEST: i64 = -32600;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PaginationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    /// Zero means "use the server default".
    pub limit: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetEventsRequest {
    pub start_ledger: i64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<EventFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<PaginationOptions>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("startLedger must be positive")]
    NonPositiveStartLedger,
    #[error("limit must not exceed {max}")]
    LimitTooHigh { max: usize },
    #[error("maximum 5 filters per request")]
    TooManyFilters,
    #[error("filter {index} invalid: {source}")]
    BadFilter { index: usize, source: FilterError },
}

impl GetEventsRequest {
    pub fn valid(&self, max_limit: usize) -> Result<(), RequestError> {
        if self.start_ledger <= 0 {
            return Err(RequestError::NonPositiveStartLedger);
        }
        if let Some(pagination) = &self.pagination {
            if pagination.limit > max_limit {
                return Err(RequestError::LimitTooHigh { max: max_limit });
            }
        }
        if self.filters.len() > MAX_FILTERS {
            return Err(RequestError::TooManyFilters);
        }
        for (i, filter) in self.filters.iter().enumerate() {
            filter.valid().map_err(|source| RequestError::BadFilter {
                index: i + 1,
                source,
            })?;
        }
        Ok(())
    }
}

/// One event of a getEvents response. `id` doubles as the paging token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInfo {
    #[serde(rename = "type")]
    pub event_type: String,
    pub ledger: u32,
    pub ledger_closed_at: String,
    pub contract_id: String,
    pub id: String,
    pub paging_token: String,
    pub topic: Vec<String>,
    pub value: EventInfoValue,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInfoValue {
    pub xdr: String,
}

/// Error carried back to the JSON-RPC layer, rendered `[{code}] {message}`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct QueryError {
    pub code: i64,
    pub message: String,
}

impl QueryError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: message.into(),
        }
    }
}

/// The getEvents core: validates requests, scans the store, applies
/// filters, and assembles the response page.
pub struct EventQuery {
    store: Arc<MemoryStore>,
    max_limit: usize,
    default_limit: usize,
}

impl EventQuery {
    pub fn new(store: Arc<MemoryStore>, max_limit: usize, default_limit: usize) -> Self {
        Self {
            store,
            max_limit,
            default_limit,
        }
    }

    pub fn get_events(&self, request: &GetEventsRequest) -> Result<Vec<EventInfo>, QueryError> {
        request
            .valid(self.max_limit)
            .map_err(|err| QueryError::invalid_request(err.to_string()))?;

        let mut start = Cursor {
            ledger: u32::try_from(request.start_ledger).unwrap_or(u32::MAX),
            ..Cursor::default()
        };
        let mut limit = self.default_limit;
        if let Some(pagination) = &request.pagination {
            if let Some(cursor) = &pagination.cursor {
                let parsed: Cursor = cursor
                    .parse()
                    .map_err(|_| QueryError::invalid_request("invalid cursor"))?;
                // Paging resumes with the item right after the cursor.
                start = parsed.next_event();
            }
            if pagination.limit > 0 {
                limit = pagination.limit;
            }
        }

        struct Found {
            event: ContractEvent,
            cursor: Cursor,
            close_timestamp: i64,
        }
        let mut found: Vec<Found> = Vec::new();
        self.store
            .scan(
                Range {
                    start,
                    clamp_start: false,
                    end: Cursor::MAX,
                    clamp_end: true,
                },
                |event, cursor, close_timestamp| {
                    if matches_filters(event, &request.filters) {
                        found.push(Found {
                            event: event.clone(),
                            cursor,
                            close_timestamp,
                        });
                    }
                    found.len() < limit
                },
            )
            .map_err(|err| QueryError::invalid_request(err.to_string()))?;

        let mut buffer = EncodingBuffer::new();
        let mut results = Vec::with_capacity(found.len());
        for item in found {
            results.push(event_info(&mut buffer, &item.event, item.cursor, item.close_timestamp)?);
        }
        Ok(results)
    }
}

fn matches_filters(event: &ContractEvent, filters: &[EventFilter]) -> bool {
    filters.is_empty() || filters.iter().any(|filter| filter.matches(event))
}

fn event_info(
    buffer: &mut EncodingBuffer,
    event: &ContractEvent,
    cursor: Cursor,
    close_timestamp: i64,
) -> Result<EventInfo, QueryError> {
    let ledger_closed_at = DateTime::from_timestamp(close_timestamp, 0)
        .ok_or_else(|| QueryError::internal("ledger close time out of range"))?
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    let id = cursor.to_string();
    Ok(EventInfo {
        event_type: event.event_type.as_str().to_string(),
        ledger: cursor.ledger,
        ledger_closed_at,
        contract_id: event
            .contract_id
            .map(|id| id.to_hex())
            .unwrap_or_default(),
        paging_token: id.clone(),
        id,
        topic: event
            .topics
            .iter()
            .map(|val| BASE64.encode(buffer.encode_val(val)))
            .collect(),
        value: EventInfoValue {
            xdr: BASE64.encode(buffer.encode_val(&event.value)),
        },
    })
}
