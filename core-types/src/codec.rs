//! Deterministic binary codec for ledger keys, entries, and values.
//!
//! Encoded keys are used as primary keys in the durable store, so the
//! encoding is a contract: the same input always produces byte-identical
//! output. The buffer reuses one scratch allocation across calls on the
//! ingestion hot path; every call clears it first, so results never depend
//! on prior calls.

use thiserror::Error;

use crate::ledger::{LedgerEntry, LedgerEntryData, LedgerKey, TrustlineAsset};
use crate::value::{ContractId, Val};

const VAL_BOOL: u8 = 0;
const VAL_U32: u8 = 1;
const VAL_I32: u8 = 2;
const VAL_U64: u8 = 3;
const VAL_I64: u8 = 4;
const VAL_SYMBOL: u8 = 5;
const VAL_STR: u8 = 6;
const VAL_BYTES: u8 = 7;
const VAL_VEC: u8 = 8;

const KEY_ACCOUNT: u8 = 0;
const KEY_TRUSTLINE: u8 = 1;
const KEY_CONTRACT_DATA: u8 = 2;
const KEY_CONTRACT_CODE: u8 = 3;

pub type Result<T> = std::result::Result<T, CodecError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid {kind} tag {tag}")]
    InvalidTag { kind: &'static str, tag: u8 },
    #[error("invalid utf-8 in encoded string")]
    InvalidUtf8,
    #[error("trailing bytes after decoded record")]
    TrailingBytes,
}

/// Reusable scratch buffer for encoding keys, entries, and values.
#[derive(Default)]
pub struct EncodingBuffer {
    scratch: Vec<u8>,
}

impl EncodingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a ledger key into an owned byte string suitable as a
    /// primary key.
    pub fn encode_key(&mut self, key: &LedgerKey) -> Vec<u8> {
        self.scratch.clear();
        put_key(&mut self.scratch, key);
        self.scratch.clone()
    }

    pub fn encode_entry(&mut self, entry: &LedgerEntry) -> Vec<u8> {
        self.scratch.clear();
        put_entry(&mut self.scratch, entry);
        self.scratch.clone()
    }

    pub fn encode_val(&mut self, val: &Val) -> Vec<u8> {
        self.scratch.clear();
        put_val(&mut self.scratch, val);
        self.scratch.clone()
    }
}

/// Decodes an entry previously produced by [`EncodingBuffer::encode_entry`].
pub fn decode_entry(bytes: &[u8]) -> Result<LedgerEntry> {
    let mut r = Reader::new(bytes);
    let entry = r.entry()?;
    r.finish()?;
    Ok(entry)
}

pub fn decode_key(bytes: &[u8]) -> Result<LedgerKey> {
    let mut r = Reader::new(bytes);
    let key = r.key()?;
    r.finish()?;
    Ok(key)
}

pub fn decode_val(bytes: &[u8]) -> Result<Val> {
    let mut r = Reader::new(bytes);
    let val = r.val()?;
    r.finish()?;
    Ok(val)
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

fn put_val(buf: &mut Vec<u8>, val: &Val) {
    match val {
        Val::Bool(b) => {
            buf.push(VAL_BOOL);
            buf.push(u8::from(*b));
        }
        Val::U32(v) => {
            buf.push(VAL_U32);
            put_u32(buf, *v);
        }
        Val::I32(v) => {
            buf.push(VAL_I32);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Val::U64(v) => {
            buf.push(VAL_U64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Val::I64(v) => {
            buf.push(VAL_I64);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Val::Symbol(s) => {
            buf.push(VAL_SYMBOL);
            put_bytes(buf, s.as_bytes());
        }
        Val::Str(s) => {
            buf.push(VAL_STR);
            put_bytes(buf, s.as_bytes());
        }
        Val::Bytes(b) => {
            buf.push(VAL_BYTES);
            put_bytes(buf, b);
        }
        Val::Vec(items) => {
            buf.push(VAL_VEC);
            put_u32(buf, items.len() as u32);
            for item in items {
                put_val(buf, item);
            }
        }
    }
}

fn put_asset(buf: &mut Vec<u8>, asset: &TrustlineAsset) {
    put_bytes(buf, asset.code.as_bytes());
    buf.extend_from_slice(&asset.issuer);
}

fn put_key(buf: &mut Vec<u8>, key: &LedgerKey) {
    match key {
        LedgerKey::Account { account_id } => {
            buf.push(KEY_ACCOUNT);
            buf.extend_from_slice(account_id);
        }
        LedgerKey::Trustline { account_id, asset } => {
            buf.push(KEY_TRUSTLINE);
            buf.extend_from_slice(account_id);
            put_asset(buf, asset);
        }
        LedgerKey::ContractData { contract_id, key } => {
            buf.push(KEY_CONTRACT_DATA);
            buf.extend_from_slice(&contract_id.0);
            put_val(buf, key);
        }
        LedgerKey::ContractCode { hash } => {
            buf.push(KEY_CONTRACT_CODE);
            buf.extend_from_slice(hash);
        }
    }
}

fn put_entry(buf: &mut Vec<u8>, entry: &LedgerEntry) {
    put_u32(buf, entry.last_modified_ledger);
    match &entry.data {
        LedgerEntryData::Account {
            account_id,
            balance,
            seq_num,
        } => {
            buf.push(KEY_ACCOUNT);
            buf.extend_from_slice(account_id);
            buf.extend_from_slice(&balance.to_le_bytes());
            buf.extend_from_slice(&seq_num.to_le_bytes());
        }
        LedgerEntryData::Trustline {
            account_id,
            asset,
            balance,
            limit,
        } => {
            buf.push(KEY_TRUSTLINE);
            buf.extend_from_slice(account_id);
            put_asset(buf, asset);
            buf.extend_from_slice(&balance.to_le_bytes());
            buf.extend_from_slice(&limit.to_le_bytes());
        }
        LedgerEntryData::ContractData {
            contract_id,
            key,
            val,
        } => {
            buf.push(KEY_CONTRACT_DATA);
            buf.extend_from_slice(&contract_id.0);
            put_val(buf, key);
            put_val(buf, val);
        }
        LedgerEntryData::ContractCode { hash, code } => {
            buf.push(KEY_CONTRACT_CODE);
            buf.extend_from_slice(hash);
            put_bytes(buf, code);
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn finish(self) -> Result<()> {
        if self.pos == self.bytes.len() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes)
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(CodecError::UnexpectedEof)?;
        if end > self.bytes.len() {
            return Err(CodecError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn array32(&mut self) -> Result<[u8; 32]> {
        Ok(self.take(32)?.try_into().unwrap())
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String> {
        String::from_utf8(self.bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }

    fn val(&mut self) -> Result<Val> {
        let tag = self.u8()?;
        match tag {
            VAL_BOOL => Ok(Val::Bool(self.u8()? != 0)),
            VAL_U32 => Ok(Val::U32(self.u32()?)),
            VAL_I32 => Ok(Val::I32(i32::from_le_bytes(
                self.take(4)?.try_into().unwrap(),
            ))),
            VAL_U64 => Ok(Val::U64(self.u64()?)),
            VAL_I64 => Ok(Val::I64(self.i64()?)),
            VAL_SYMBOL => Ok(Val::Symbol(self.string()?)),
            VAL_STR => Ok(Val::Str(self.string()?)),
            VAL_BYTES => Ok(Val::Bytes(self.bytes()?)),
            VAL_VEC => {
                let len = self.u32()? as usize;
                let mut items = Vec::with_capacity(len.min(64));
                for _ in 0..len {
                    items.push(self.val()?);
                }
                Ok(Val::Vec(items))
            }
            tag => Err(CodecError::InvalidTag { kind: "value", tag }),
        }
    }

    fn asset(&mut self) -> Result<TrustlineAsset> {
        Ok(TrustlineAsset {
            code: self.string()?,
            issuer: self.array32()?,
        })
    }

    fn key(&mut self) -> Result<LedgerKey> {
        let tag = self.u8()?;
        match tag {
            KEY_ACCOUNT => Ok(LedgerKey::Account {
                account_id: self.array32()?,
            }),
            KEY_TRUSTLINE => Ok(LedgerKey::Trustline {
                account_id: self.array32()?,
                asset: self.asset()?,
            }),
            KEY_CONTRACT_DATA => Ok(LedgerKey::ContractData {
                contract_id: ContractId(self.array32()?),
                key: self.val()?,
            }),
            KEY_CONTRACT_CODE => Ok(LedgerKey::ContractCode {
                hash: self.array32()?,
            }),
            tag => Err(CodecError::InvalidTag { kind: "key", tag }),
        }
    }

    fn entry(&mut self) -> Result<LedgerEntry> {
        let last_modified_ledger = self.u32()?;
        let tag = self.u8()?;
        let data = match tag {
            KEY_ACCOUNT => LedgerEntryData::Account {
                account_id: self.array32()?,
                balance: self.i64()?,
                seq_num: self.u64()?,
            },
            KEY_TRUSTLINE => LedgerEntryData::Trustline {
                account_id: self.array32()?,
                asset: self.asset()?,
                balance: self.i64()?,
                limit: self.i64()?,
            },
            KEY_CONTRACT_DATA => LedgerEntryData::ContractData {
                contract_id: ContractId(self.array32()?),
                key: self.val()?,
                val: self.val()?,
            },
            KEY_CONTRACT_CODE => LedgerEntryData::ContractCode {
                hash: self.array32()?,
                code: self.bytes()?,
            },
            tag => Err(CodecError::InvalidTag { kind: "entry", tag })?,
        };
        Ok(LedgerEntry {
            last_modified_ledger,
            data,
        })
    }
}
