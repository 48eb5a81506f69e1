use serde::{Deserialize, Serialize};

use crate::event::ContractEvent;
use crate::value::{ContractId, Val};

/// Sequence number of a closed ledger.
pub type LedgerSeq = u32;

/// 32-byte transaction hash.
pub type TxHash = [u8; 32];

/// A trustline asset: short code plus issuing account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustlineAsset {
    pub code: String,
    pub issuer: [u8; 32],
}

/// Identifies exactly one live ledger entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerKey {
    Account {
        account_id: [u8; 32],
    },
    Trustline {
        account_id: [u8; 32],
        asset: TrustlineAsset,
    },
    ContractData {
        contract_id: ContractId,
        key: Val,
    },
    ContractCode {
        hash: [u8; 32],
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEntryData {
    Account {
        account_id: [u8; 32],
        balance: i64,
        seq_num: u64,
    },
    Trustline {
        account_id: [u8; 32],
        asset: TrustlineAsset,
        balance: i64,
        limit: i64,
    },
    ContractData {
        contract_id: ContractId,
        key: Val,
        val: Val,
    },
    ContractCode {
        hash: [u8; 32],
        code: Vec<u8>,
    },
}

/// One live ledger entry. The store holds at most one entry per key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub last_modified_ledger: LedgerSeq,
    pub data: LedgerEntryData,
}

impl LedgerEntry {
    /// The key under which this entry lives.
    pub fn key(&self) -> LedgerKey {
        match &self.data {
            LedgerEntryData::Account { account_id, .. } => LedgerKey::Account {
                account_id: *account_id,
            },
            LedgerEntryData::Trustline {
                account_id, asset, ..
            } => LedgerKey::Trustline {
                account_id: *account_id,
                asset: asset.clone(),
            },
            LedgerEntryData::ContractData {
                contract_id, key, ..
            } => LedgerKey::ContractData {
                contract_id: *contract_id,
                key: key.clone(),
            },
            LedgerEntryData::ContractCode { hash, .. } => LedgerKey::ContractCode { hash: *hash },
        }
    }
}

/// A single ledger-entry delta produced while applying a ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryChange {
    Created(LedgerEntry),
    Updated(LedgerEntry),
    Removed(LedgerKey),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHeader {
    pub ledger_seq: LedgerSeq,
    /// Unix timestamp of ledger close.
    pub close_time: i64,
}

/// Events emitted by one operation of a transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMeta {
    pub events: Vec<ContractEvent>,
}

/// One applied transaction as it appears in the close record, in
/// application order. `result_meta` is the opaque encoded result the source
/// produced; the stores never look inside it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMeta {
    pub hash: TxHash,
    pub successful: bool,
    pub result_meta: Vec<u8>,
    pub operations: Vec<OperationMeta>,
    pub entry_changes: Vec<EntryChange>,
}

/// The structured record emitted when a ledger closes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCloseMeta {
    pub header: LedgerHeader,
    pub transactions: Vec<TransactionMeta>,
}

impl LedgerCloseMeta {
    pub fn ledger_seq(&self) -> LedgerSeq {
        self.header.ledger_seq
    }

    pub fn close_time(&self) -> i64 {
        self.header.close_time
    }
}
