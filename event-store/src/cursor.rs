use std::fmt;
use std::str::FromStr;

use core_types::ledger::LedgerSeq;
use thiserror::Error;

/// A totally ordered position within the event stream.
///
/// The string form is `{ledger}-{tx:010}{op:010}{event:010}`; because the
/// three trailing fields are zero-padded, string comparison of cursors from
/// the same ledger-width era agrees with tuple comparison.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    pub ledger: LedgerSeq,
    pub tx: u32,
    pub op: u32,
    pub event: u32,
}

impl Cursor {
    /// The greatest representable cursor; used as an open upper bound.
    pub const MAX: Cursor = Cursor {
        ledger: u32::MAX,
        tx: u32::MAX,
        op: u32::MAX,
        event: u32::MAX,
    };

    /// The position immediately after this one in the event slot. Paging
    /// resumes from here so the cursor itself is excluded.
    pub fn next_event(mut self) -> Cursor {
        self.event = self.event.saturating_add(1);
        self
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:010}{:010}{:010}",
            self.ledger, self.tx, self.op, self.event
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid cursor")]
pub struct CursorParseError;

impl FromStr for Cursor {
    type Err = CursorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ledger, rest) = s.split_once('-').ok_or(CursorParseError)?;
        if rest.len() != 30 || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CursorParseError);
        }
        let field = |range: std::ops::Range<usize>| -> Result<u32, CursorParseError> {
            rest[range].parse::<u32>().map_err(|_| CursorParseError)
        };
        Ok(Cursor {
            ledger: ledger.parse::<u32>().map_err(|_| CursorParseError)?,
            tx: field(0..10)?,
            op: field(10..20)?,
            event: field(20..30)?,
        })
    }
}
