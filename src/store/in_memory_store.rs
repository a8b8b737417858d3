use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::thread;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::{
    audit::{AuditAction, AuditEntityKind, AuditLog, NewAuditEvent},
    contract::ContractId,
    ledger::{LedgerEntry, LedgerKind, LedgerLog, NewLedgerEntry},
    money::{AmountMinor, Currency},
    wallet::{Balance, EntityRef, Wallet, WalletError, require_positive},
};

use super::{StoreConfig, WalletStore};

/// Wallets keyed by owner. Each wallet sits behind its own mutex so unrelated
/// owners never contend; the registry lock is held only long enough to find
/// or create a cell.
///
/// Lock order is fixed: registry, then wallets (two at once only during
/// capture, taken in `EntityRef` order), then the ledger, then the audit log.
pub struct InMemoryWalletStore {
    wallets: RwLock<HashMap<EntityRef, Arc<Mutex<Wallet>>>>,
    captures_in_flight: Mutex<HashSet<ContractId>>,
    ledger: Arc<LedgerLog>,
    audit: Arc<AuditLog>,
    config: StoreConfig,
}

impl InMemoryWalletStore {
    pub fn new(ledger: Arc<LedgerLog>, audit: Arc<AuditLog>, config: StoreConfig) -> Self {
        Self {
            wallets: RwLock::new(HashMap::new()),
            captures_in_flight: Mutex::new(HashSet::new()),
            ledger,
            audit,
            config,
        }
    }

    fn existing_cell(&self, entity: &EntityRef) -> Result<Arc<Mutex<Wallet>>, WalletError> {
        let wallets = self.wallets.read().map_err(|_| registry_poisoned())?;
        wallets
            .get(entity)
            .cloned()
            .ok_or_else(|| WalletError::NotFound(entity.clone()))
    }

    fn cell_or_create(
        &self,
        entity: &EntityRef,
        currency: Currency,
    ) -> Result<Arc<Mutex<Wallet>>, WalletError> {
        {
            let wallets = self.wallets.read().map_err(|_| registry_poisoned())?;
            if let Some(cell) = wallets.get(entity) {
                return Ok(cell.clone());
            }
        }
        let mut wallets = self.wallets.write().map_err(|_| registry_poisoned())?;
        Ok(wallets
            .entry(entity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Wallet::new(currency))))
            .clone())
    }

    fn lock_wallet<'a>(
        &self,
        cell: &'a Mutex<Wallet>,
        entity: &EntityRef,
    ) -> Result<MutexGuard<'a, Wallet>, WalletError> {
        let attempts = self.config.lock_attempts.max(1);
        for attempt in 1..=attempts {
            match cell.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(_)) => {
                    return Err(WalletError::Internal(format!(
                        "wallet lock for {entity} poisoned"
                    )));
                }
                Err(TryLockError::WouldBlock) if attempt < attempts => {
                    thread::sleep(self.config.lock_backoff);
                }
                Err(TryLockError::WouldBlock) => {}
            }
        }
        warn!(wallet = %entity, attempts, "wallet stayed busy, giving up");
        Err(WalletError::Conflict(entity.clone()))
    }

    fn replayed_entry(
        &self,
        entity: &EntityRef,
        key: &str,
        entry_id: u64,
    ) -> Result<LedgerEntry, WalletError> {
        let entry = self.ledger.entry(entry_id)?.ok_or_else(|| {
            WalletError::Internal(format!(
                "idempotency key `{key}` points at missing ledger entry {entry_id}"
            ))
        })?;
        debug!(wallet = %entity, key, entry_id, "replayed idempotent request");
        Ok(entry)
    }

    fn audit_balances(
        &self,
        actor_id: &str,
        action: AuditAction,
        entity: &EntityRef,
        before: Balance,
        after: Balance,
    ) -> Result<(), WalletError> {
        self.audit.append(NewAuditEvent {
            actor_id: actor_id.to_string(),
            action,
            entity_kind: AuditEntityKind::Wallet,
            entity_id: entity.to_string(),
            project_ref: None,
            before: balance_value(&before)?,
            after: balance_value(&after)?,
            needs_reconciliation: false,
        })?;
        Ok(())
    }

    fn begin_capture(&self, contract_id: ContractId, from: &EntityRef) -> Result<(), WalletError> {
        let mut in_flight = self
            .captures_in_flight
            .lock()
            .map_err(|_| WalletError::Internal("capture step records poisoned".to_string()))?;
        if !in_flight.insert(contract_id) {
            return Err(WalletError::Conflict(from.clone()));
        }
        Ok(())
    }

    fn end_capture(&self, contract_id: ContractId) {
        if let Ok(mut in_flight) = self.captures_in_flight.lock() {
            in_flight.remove(&contract_id);
        }
    }

    fn capture_exclusive(
        &self,
        actor_id: &str,
        from: &EntityRef,
        to: &EntityRef,
        currency: Currency,
        amount_minor: AmountMinor,
        contract_id: ContractId,
    ) -> Result<(LedgerEntry, LedgerEntry), WalletError> {
        let from_cell = self.existing_cell(from)?;
        let to_cell = self.cell_or_create(to, currency)?;

        // both wallets lock in EntityRef order, whatever the payment direction
        let (mut from_wallet, mut to_wallet) = if from < to {
            let first = self.lock_wallet(&from_cell, from)?;
            let second = self.lock_wallet(&to_cell, to)?;
            (first, second)
        } else {
            let second = self.lock_wallet(&to_cell, to)?;
            let first = self.lock_wallet(&from_cell, from)?;
            (first, second)
        };

        from_wallet.ensure_currency(currency)?;
        to_wallet.ensure_currency(currency)?;

        let before_from = from_wallet.balance();
        let before_to = to_wallet.balance();

        let debit = from_wallet.handle_capture_out(amount_minor)?;
        from_wallet.apply(&debit);

        // the debit is live from here on, every failure path backs it out
        let credit = match to_wallet.handle_capture_in(amount_minor) {
            Ok(credit) => credit,
            Err(err) => {
                from_wallet.revert(&debit);
                error!(
                    contract_id = %contract_id,
                    from = %from,
                    to = %to,
                    %err,
                    "capture credit refused, debit backed out"
                );
                return Err(err);
            }
        };
        to_wallet.apply(&credit);

        let out_draft = NewLedgerEntry {
            wallet: from.clone(),
            kind: LedgerKind::Capture,
            amount_minor,
            related_contract_id: Some(contract_id),
            balance_after_minor: from_wallet.total_minor(),
        };
        let in_draft = NewLedgerEntry {
            wallet: to.clone(),
            kind: LedgerKind::Capture,
            amount_minor,
            related_contract_id: Some(contract_id),
            balance_after_minor: to_wallet.total_minor(),
        };
        let (out_entry, in_entry) = match self.ledger.append_pair(out_draft, in_draft) {
            Ok(pair) => pair,
            Err(err) => {
                to_wallet.revert(&credit);
                from_wallet.revert(&debit);
                error!(
                    contract_id = %contract_id,
                    "ledger refused the capture pair, both halves backed out"
                );
                return Err(err.into());
            }
        };

        self.audit.append(NewAuditEvent {
            actor_id: actor_id.to_string(),
            action: AuditAction::WalletCapture,
            entity_kind: AuditEntityKind::Wallet,
            entity_id: from.to_string(),
            project_ref: None,
            before: json!({ "from": balance_value(&before_from)?, "to": balance_value(&before_to)? }),
            after: json!({
                "from": balance_value(&from_wallet.balance())?,
                "to": balance_value(&to_wallet.balance())?,
            }),
            needs_reconciliation: false,
        })?;

        info!(
            contract_id = %contract_id,
            from = %from,
            to = %to,
            amount_minor,
            "captured held funds"
        );
        Ok((out_entry, in_entry))
    }
}

impl WalletStore for InMemoryWalletStore {
    fn balance(&self, entity: &EntityRef) -> Result<Balance, WalletError> {
        let cell = self.existing_cell(entity)?;
        let wallet = self.lock_wallet(&cell, entity)?;
        Ok(wallet.balance())
    }

    fn balances(&self) -> Result<Vec<(EntityRef, Balance)>, WalletError> {
        let cells: Vec<(EntityRef, Arc<Mutex<Wallet>>)> = {
            let wallets = self.wallets.read().map_err(|_| registry_poisoned())?;
            wallets
                .iter()
                .map(|(entity, cell)| (entity.clone(), cell.clone()))
                .collect()
        };
        let mut out = Vec::with_capacity(cells.len());
        for (entity, cell) in cells {
            let balance = self.lock_wallet(&cell, &entity)?.balance();
            out.push((entity, balance));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn top_up(
        &self,
        actor_id: &str,
        entity: &EntityRef,
        currency: Currency,
        amount_minor: AmountMinor,
        idempotency_key: &str,
    ) -> Result<LedgerEntry, WalletError> {
        // validate before the lazy create, so a bad request leaves no wallet
        require_positive(amount_minor)?;
        let cell = self.cell_or_create(entity, currency)?;
        let mut wallet = self.lock_wallet(&cell, entity)?;
        wallet.ensure_currency(currency)?;
        if let Some(entry_id) = wallet.recorded_entry(idempotency_key) {
            return self.replayed_entry(entity, idempotency_key, entry_id);
        }

        let before = wallet.balance();
        let event = wallet.handle_top_up(amount_minor)?;
        wallet.apply(&event);
        let entry = match self.ledger.append(NewLedgerEntry {
            wallet: entity.clone(),
            kind: LedgerKind::TopUp,
            amount_minor,
            related_contract_id: None,
            balance_after_minor: wallet.total_minor(),
        }) {
            Ok(entry) => entry,
            Err(err) => {
                wallet.revert(&event);
                return Err(err.into());
            }
        };
        wallet.record_key(idempotency_key.to_string(), entry.id);
        self.audit_balances(
            actor_id,
            AuditAction::WalletTopUp,
            entity,
            before,
            wallet.balance(),
        )?;
        info!(wallet = %entity, amount_minor, entry_id = entry.id, "topped up");
        Ok(entry)
    }

    fn refund(
        &self,
        actor_id: &str,
        entity: &EntityRef,
        amount_minor: AmountMinor,
        idempotency_key: &str,
    ) -> Result<LedgerEntry, WalletError> {
        require_positive(amount_minor)?;
        let cell = self.existing_cell(entity)?;
        let mut wallet = self.lock_wallet(&cell, entity)?;
        if let Some(entry_id) = wallet.recorded_entry(idempotency_key) {
            return self.replayed_entry(entity, idempotency_key, entry_id);
        }

        let before = wallet.balance();
        let event = wallet.handle_refund(amount_minor)?;
        wallet.apply(&event);
        let entry = match self.ledger.append(NewLedgerEntry {
            wallet: entity.clone(),
            kind: LedgerKind::Refund,
            amount_minor,
            related_contract_id: None,
            balance_after_minor: wallet.total_minor(),
        }) {
            Ok(entry) => entry,
            Err(err) => {
                wallet.revert(&event);
                return Err(err.into());
            }
        };
        wallet.record_key(idempotency_key.to_string(), entry.id);
        self.audit_balances(
            actor_id,
            AuditAction::WalletRefund,
            entity,
            before,
            wallet.balance(),
        )?;
        info!(wallet = %entity, amount_minor, entry_id = entry.id, "refunded");
        Ok(entry)
    }

    fn hold(
        &self,
        actor_id: &str,
        entity: &EntityRef,
        currency: Currency,
        amount_minor: AmountMinor,
        contract_id: ContractId,
    ) -> Result<LedgerEntry, WalletError> {
        require_positive(amount_minor)?;
        let cell = self.cell_or_create(entity, currency)?;
        let mut wallet = self.lock_wallet(&cell, entity)?;
        wallet.ensure_currency(currency)?;

        let before = wallet.balance();
        let event = wallet.handle_hold(amount_minor)?;
        wallet.apply(&event);
        let entry = match self.ledger.append(NewLedgerEntry {
            wallet: entity.clone(),
            kind: LedgerKind::Hold,
            amount_minor,
            related_contract_id: Some(contract_id),
            balance_after_minor: wallet.total_minor(),
        }) {
            Ok(entry) => entry,
            Err(err) => {
                wallet.revert(&event);
                return Err(err.into());
            }
        };
        self.audit_balances(
            actor_id,
            AuditAction::WalletHold,
            entity,
            before,
            wallet.balance(),
        )?;
        info!(wallet = %entity, contract_id = %contract_id, amount_minor, "held funds");
        Ok(entry)
    }

    fn release(
        &self,
        actor_id: &str,
        entity: &EntityRef,
        amount_minor: AmountMinor,
        contract_id: ContractId,
    ) -> Result<LedgerEntry, WalletError> {
        require_positive(amount_minor)?;
        let cell = self.existing_cell(entity)?;
        let mut wallet = self.lock_wallet(&cell, entity)?;

        let before = wallet.balance();
        let event = wallet.handle_release(amount_minor)?;
        wallet.apply(&event);
        let entry = match self.ledger.append(NewLedgerEntry {
            wallet: entity.clone(),
            kind: LedgerKind::Release,
            amount_minor,
            related_contract_id: Some(contract_id),
            balance_after_minor: wallet.total_minor(),
        }) {
            Ok(entry) => entry,
            Err(err) => {
                wallet.revert(&event);
                return Err(err.into());
            }
        };
        self.audit_balances(
            actor_id,
            AuditAction::WalletRelease,
            entity,
            before,
            wallet.balance(),
        )?;
        info!(wallet = %entity, contract_id = %contract_id, amount_minor, "released hold");
        Ok(entry)
    }

    fn capture(
        &self,
        actor_id: &str,
        from: &EntityRef,
        to: &EntityRef,
        currency: Currency,
        amount_minor: AmountMinor,
        contract_id: ContractId,
    ) -> Result<(LedgerEntry, LedgerEntry), WalletError> {
        require_positive(amount_minor)?;
        if from == to {
            return Err(WalletError::InvalidAmount {
                amount_minor,
                reason: "paying and receiving wallet must differ",
            });
        }
        self.begin_capture(contract_id, from)?;
        let result =
            self.capture_exclusive(actor_id, from, to, currency, amount_minor, contract_id);
        self.end_capture(contract_id);
        result
    }
}

fn registry_poisoned() -> WalletError {
    WalletError::Internal("wallet registry lock poisoned".to_string())
}

fn balance_value(balance: &Balance) -> Result<serde_json::Value, WalletError> {
    serde_json::to_value(balance).map_err(|err| WalletError::Internal(err.to_string()))
}
