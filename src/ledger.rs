use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contract::ContractId;
use crate::money::AmountMinor;
use crate::wallet::{EntityRef, WalletError};

pub type LedgerEntryId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    TopUp,
    Hold,
    Release,
    Capture,
    Refund,
}

/// One immutable line of wallet history. Entries are only ever appended;
/// corrections happen through new compensating entries.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub wallet: EntityRef,
    pub kind: LedgerKind,
    pub amount_minor: AmountMinor,
    pub related_contract_id: Option<ContractId>,
    pub balance_after_minor: AmountMinor,
    pub created_at: DateTime<Utc>,
}

/// What a caller supplies; the log assigns `id` and `created_at`.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub wallet: EntityRef,
    pub kind: LedgerKind,
    pub amount_minor: AmountMinor,
    pub related_contract_id: Option<ContractId>,
    pub balance_after_minor: AmountMinor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

#[derive(Debug, Error)]
#[error("append-only log lock poisoned")]
pub struct LogPoisoned;

impl From<LogPoisoned> for WalletError {
    fn from(err: LogPoisoned) -> Self {
        WalletError::Internal(err.to_string())
    }
}

#[derive(Debug, Default, Clone)]
pub struct LedgerFilter {
    pub wallet: Option<EntityRef>,
    /// Empty means any kind.
    pub kinds: Vec<LedgerKind>,
    pub contract_id: Option<ContractId>,
}

impl LedgerFilter {
    fn matches(&self, entry: &LedgerEntry) -> bool {
        if let Some(wallet) = &self.wallet {
            if entry.wallet != *wallet {
                return false;
            }
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&entry.kind) {
            return false;
        }
        if let Some(contract_id) = self.contract_id {
            if entry.related_contract_id != Some(contract_id) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Default)]
pub struct LedgerLog {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl LedgerLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, draft: NewLedgerEntry) -> Result<LedgerEntry, LogPoisoned> {
        let mut entries = self.entries.lock().map_err(|_| LogPoisoned)?;
        let entry = seal(&entries, draft);
        entries.push(entry.clone());
        Ok(entry)
    }

    /// Appends both entries of a transfer under one lock, so no reader can
    /// observe one leg without the other.
    pub fn append_pair(
        &self,
        first: NewLedgerEntry,
        second: NewLedgerEntry,
    ) -> Result<(LedgerEntry, LedgerEntry), LogPoisoned> {
        let mut entries = self.entries.lock().map_err(|_| LogPoisoned)?;
        let first = seal(&entries, first);
        entries.push(first.clone());
        let second = seal(&entries, second);
        entries.push(second.clone());
        Ok((first, second))
    }

    pub fn entry(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, LogPoisoned> {
        let entries = self.entries.lock().map_err(|_| LogPoisoned)?;
        // ids are assigned densely from 1, so the entry sits at id - 1
        Ok(id
            .checked_sub(1)
            .and_then(|idx| entries.get(idx as usize))
            .cloned())
    }

    pub fn list(&self, filter: &LedgerFilter, order: Order) -> Result<Vec<LedgerEntry>, LogPoisoned> {
        let entries = self.entries.lock().map_err(|_| LogPoisoned)?;
        let mut out: Vec<LedgerEntry> = entries.iter().filter(|e| filter.matches(e)).cloned().collect();
        if order == Order::Descending {
            out.reverse();
        }
        Ok(out)
    }

    pub fn len(&self) -> Result<usize, LogPoisoned> {
        Ok(self.entries.lock().map_err(|_| LogPoisoned)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, LogPoisoned> {
        Ok(self.len()? == 0)
    }
}

fn seal(entries: &[LedgerEntry], draft: NewLedgerEntry) -> LedgerEntry {
    LedgerEntry {
        id: entries.len() as LedgerEntryId + 1,
        wallet: draft.wallet,
        kind: draft.kind,
        amount_minor: draft.amount_minor,
        related_contract_id: draft.related_contract_id,
        balance_after_minor: draft.balance_after_minor,
        created_at: Utc::now(),
    }
}
