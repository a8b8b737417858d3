use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::LedgerEntryId;
use crate::money::{AmountMinor, Currency};

pub type EntityId = String;
pub type IdempotencyKey = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    User,
    Organization,
}

/// Identifies a wallet owner. Derived `Ord` gives the fixed global order used
/// when two wallets must be locked together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
}

impl EntityRef {
    pub fn user(entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_type: EntityType::User,
            entity_id: entity_id.into(),
        }
    }

    pub fn organization(entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_type: EntityType::Organization,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.entity_type {
            EntityType::User => "user",
            EntityType::Organization => "org",
        };
        write!(f, "{tag}:{}", self.entity_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletEventKind {
    ToppedUp,
    Held,
    Released,
    CapturedOut,
    CapturedIn,
    Refunded,
}

#[derive(Debug)]
pub struct WalletEvent {
    amount_minor: AmountMinor,
    kind: WalletEventKind,
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Invalid amount {amount_minor}: {reason}")]
    InvalidAmount {
        amount_minor: AmountMinor,
        reason: &'static str,
    },
    #[error("Insufficient funds: {requested_minor} requested, {available_minor} available")]
    InsufficientFunds {
        requested_minor: AmountMinor,
        available_minor: AmountMinor,
    },
    #[error("Wallet currency is {held}, operation is in {requested}")]
    CurrencyMismatch { held: Currency, requested: Currency },
    #[error("No wallet exists for {0}")]
    NotFound(EntityRef),
    #[error("Held funds are {held_minor}, cannot settle {requested_minor}")]
    InvalidState {
        held_minor: AmountMinor,
        requested_minor: AmountMinor,
    },
    #[error("Wallet {0} is busy, gave up waiting for it")]
    Conflict(EntityRef),
    #[error("Wallet storage is unavailable: {0}")]
    Internal(String),
}

/// Point-in-time view of a wallet, safe to hand out past the wallet lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub available_minor: AmountMinor,
    pub held_minor: AmountMinor,
    pub currency: Currency,
}

impl Balance {
    pub fn total_minor(&self) -> AmountMinor {
        self.available_minor + self.held_minor
    }
}

#[derive(Debug)]
pub struct Wallet {
    currency: Currency,
    available_minor: AmountMinor,
    held_minor: AmountMinor,
    applied_keys: HashMap<IdempotencyKey, LedgerEntryId>,
}

impl Wallet {
    pub fn new(currency: Currency) -> Self {
        Self {
            currency,
            available_minor: 0,
            held_minor: 0,
            applied_keys: HashMap::new(),
        }
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn available_minor(&self) -> AmountMinor {
        self.available_minor
    }

    pub fn held_minor(&self) -> AmountMinor {
        self.held_minor
    }

    // Credits are checked against the total, so the sum never overflows.
    pub fn total_minor(&self) -> AmountMinor {
        self.available_minor + self.held_minor
    }

    pub fn balance(&self) -> Balance {
        Balance {
            available_minor: self.available_minor,
            held_minor: self.held_minor,
            currency: self.currency,
        }
    }

    pub fn ensure_currency(&self, requested: Currency) -> Result<(), WalletError> {
        if self.currency == requested {
            Ok(())
        } else {
            Err(WalletError::CurrencyMismatch {
                held: self.currency,
                requested,
            })
        }
    }

    pub fn recorded_entry(&self, key: &str) -> Option<LedgerEntryId> {
        self.applied_keys.get(key).copied()
    }

    pub fn record_key(&mut self, key: IdempotencyKey, entry_id: LedgerEntryId) {
        self.applied_keys.insert(key, entry_id);
    }

    pub fn apply(&mut self, event: &WalletEvent) {
        match event.kind {
            WalletEventKind::ToppedUp => {
                self.available_minor += event.amount_minor;
            }
            WalletEventKind::Refunded => {
                self.available_minor -= event.amount_minor;
            }
            WalletEventKind::Held => {
                self.available_minor -= event.amount_minor;
                self.held_minor += event.amount_minor;
            }
            WalletEventKind::Released => {
                self.held_minor -= event.amount_minor;
                self.available_minor += event.amount_minor;
            }
            WalletEventKind::CapturedOut => {
                self.held_minor -= event.amount_minor;
            }
            WalletEventKind::CapturedIn => {
                self.available_minor += event.amount_minor;
            }
        }
    }

    /// Undoes a previously applied event, for backing out the finished half
    /// of a transfer whose other half failed.
    pub fn revert(&mut self, event: &WalletEvent) {
        match event.kind {
            WalletEventKind::ToppedUp => {
                self.available_minor -= event.amount_minor;
            }
            WalletEventKind::Refunded => {
                self.available_minor += event.amount_minor;
            }
            WalletEventKind::Held => {
                self.held_minor -= event.amount_minor;
                self.available_minor += event.amount_minor;
            }
            WalletEventKind::Released => {
                self.available_minor -= event.amount_minor;
                self.held_minor += event.amount_minor;
            }
            WalletEventKind::CapturedOut => {
                self.held_minor += event.amount_minor;
            }
            WalletEventKind::CapturedIn => {
                self.available_minor -= event.amount_minor;
            }
        }
    }

    pub fn handle_top_up(&self, amount_minor: AmountMinor) -> Result<WalletEvent, WalletError> {
        self.credit_event(amount_minor, WalletEventKind::ToppedUp)
    }

    pub fn handle_capture_in(&self, amount_minor: AmountMinor) -> Result<WalletEvent, WalletError> {
        self.credit_event(amount_minor, WalletEventKind::CapturedIn)
    }

    pub fn handle_refund(&self, amount_minor: AmountMinor) -> Result<WalletEvent, WalletError> {
        require_positive(amount_minor)?;
        if self.available_minor < amount_minor {
            return Err(WalletError::InsufficientFunds {
                requested_minor: amount_minor,
                available_minor: self.available_minor,
            });
        }
        Ok(WalletEvent {
            amount_minor,
            kind: WalletEventKind::Refunded,
        })
    }

    pub fn handle_hold(&self, amount_minor: AmountMinor) -> Result<WalletEvent, WalletError> {
        require_positive(amount_minor)?;
        if self.available_minor < amount_minor {
            return Err(WalletError::InsufficientFunds {
                requested_minor: amount_minor,
                available_minor: self.available_minor,
            });
        }
        Ok(WalletEvent {
            amount_minor,
            kind: WalletEventKind::Held,
        })
    }

    pub fn handle_release(&self, amount_minor: AmountMinor) -> Result<WalletEvent, WalletError> {
        self.settle_event(amount_minor, WalletEventKind::Released)
    }

    pub fn handle_capture_out(&self, amount_minor: AmountMinor) -> Result<WalletEvent, WalletError> {
        self.settle_event(amount_minor, WalletEventKind::CapturedOut)
    }

    fn credit_event(
        &self,
        amount_minor: AmountMinor,
        kind: WalletEventKind,
    ) -> Result<WalletEvent, WalletError> {
        require_positive(amount_minor)?;
        if self.total_minor().checked_add(amount_minor).is_none() {
            return Err(WalletError::InvalidAmount {
                amount_minor,
                reason: "credit would overflow the balance",
            });
        }
        Ok(WalletEvent { amount_minor, kind })
    }

    // Settlements come out of the held pot and may not dig into available funds.
    fn settle_event(
        &self,
        amount_minor: AmountMinor,
        kind: WalletEventKind,
    ) -> Result<WalletEvent, WalletError> {
        require_positive(amount_minor)?;
        if self.held_minor < amount_minor {
            return Err(WalletError::InvalidState {
                held_minor: self.held_minor,
                requested_minor: amount_minor,
            });
        }
        Ok(WalletEvent { amount_minor, kind })
    }
}

pub(crate) fn require_positive(amount_minor: AmountMinor) -> Result<(), WalletError> {
    if amount_minor > 0 {
        Ok(())
    } else {
        Err(WalletError::InvalidAmount {
            amount_minor,
            reason: "amounts must be positive",
        })
    }
}
