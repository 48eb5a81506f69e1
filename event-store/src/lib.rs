// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! In-memory contract-event index with retention-window eviction,
//! cursor-based range scans, and the getEvents query core.

pub mod cursor;
pub mod filter;
pub mod query;
pub mod store;

pub use cursor::{Cursor, CursorParseError};
pub use filter::{EventFilter, SegmentFilter, TopicFilter};
pub use query::{EventInfo, EventQuery, GetEventsRequest, PaginationOptions, QueryError};
pub use store::{EventBucket, IngestError, MemoryStore, Range, RangeError};
