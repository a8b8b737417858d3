use std::time::Duration;

use crate::contract::ContractId;
use crate::ledger::LedgerEntry;
use crate::money::{AmountMinor, Currency};
use crate::wallet::{Balance, EntityRef, WalletError};

pub mod in_memory_store;

/// Knobs for how long a caller is willing to wait on a busy wallet before
/// the operation fails with [`WalletError::Conflict`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub lock_attempts: u32,
    pub lock_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_attempts: 8,
            lock_backoff: Duration::from_micros(250),
        }
    }
}

/// Wallet primitives. Every mutation lands one ledger entry (two for
/// `capture`) and one audit event, or fails without touching anything.
pub trait WalletStore: Send + Sync {
    fn balance(&self, entity: &EntityRef) -> Result<Balance, WalletError>;

    /// Snapshot of every wallet, ordered by entity.
    fn balances(&self) -> Result<Vec<(EntityRef, Balance)>, WalletError>;

    /// Credits available funds. Replaying an idempotency key returns the
    /// original entry and moves nothing.
    fn top_up(
        &self,
        actor_id: &str,
        entity: &EntityRef,
        currency: Currency,
        amount_minor: AmountMinor,
        idempotency_key: &str,
    ) -> Result<LedgerEntry, WalletError>;

    /// Debits available funds, idempotent the same way `top_up` is.
    fn refund(
        &self,
        actor_id: &str,
        entity: &EntityRef,
        amount_minor: AmountMinor,
        idempotency_key: &str,
    ) -> Result<LedgerEntry, WalletError>;

    fn hold(
        &self,
        actor_id: &str,
        entity: &EntityRef,
        currency: Currency,
        amount_minor: AmountMinor,
        contract_id: ContractId,
    ) -> Result<LedgerEntry, WalletError>;

    fn release(
        &self,
        actor_id: &str,
        entity: &EntityRef,
        amount_minor: AmountMinor,
        contract_id: ContractId,
    ) -> Result<LedgerEntry, WalletError>;

    /// Moves held funds from `from` into `to`'s available funds, atomically:
    /// both wallets change and both ledger entries land, or neither does.
    fn capture(
        &self,
        actor_id: &str,
        from: &EntityRef,
        to: &EntityRef,
        currency: Currency,
        amount_minor: AmountMinor,
        contract_id: ContractId,
    ) -> Result<(LedgerEntry, LedgerEntry), WalletError>;
}
