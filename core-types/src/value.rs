use std::fmt;

use serde::{Deserialize, Serialize};

/// A typed host value as it appears in event topics, event data, and
/// contract-data ledger entries.
///
/// The ordering is total (derived lexicographically over the variant tag and
/// payload) so values can be compared and used as map keys.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Val {
    Bool(bool),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    Symbol(String),
    Str(String),
    Bytes(Vec<u8>),
    Vec(Vec<Val>),
}

impl Val {
    pub fn symbol(s: impl Into<String>) -> Self {
        Val::Symbol(s.into())
    }
}

/// 32-byte contract identifier, rendered as lowercase hex on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContractId(pub [u8; 32]);

impl ContractId {
    pub fn from_hex(s: &str) -> Result<Self, ContractIdError> {
        if s.len() != 64 {
            return Err(ContractIdError::BadLength(s.len()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ContractIdError::BadHex)?;
        Ok(ContractId(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContractId({})", self.to_hex())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ContractIdError {
    #[error("contract id must be 64 hex characters, got {0}")]
    BadLength(usize),
    #[error("contract id is not valid hex")]
    BadHex,
}
