use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::thread;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    access::{AccessPolicy, Role},
    audit::{AuditAction, AuditEntityKind, AuditLog, NewAuditEvent},
    contract::{ContractError, ContractEvent, ContractId, ContractStatus, EscrowContract},
    ledger::{LedgerEntry, LedgerFilter, LedgerKind, LedgerLog, Order},
    money::{AmountMinor, Currency},
    store::{StoreConfig, WalletStore},
    wallet::{EntityRef, EntityType, WalletError, require_positive},
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Contract(#[from] ContractError),
}

/// What a replay of one wallet's ledger found. Anomalies are written for an
/// operator, one line per finding.
#[derive(Debug, Clone)]
pub struct ReconciliationReport {
    pub entity: EntityRef,
    pub ledger_total_minor: AmountMinor,
    pub wallet_total_minor: AmountMinor,
    pub entries_checked: usize,
    pub anomalies: Vec<String>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }
}

/// Ties the contract state machine to wallet money movement: a contract only
/// changes state when the matching wallet operation went through.
///
/// Lock order is contract first, wallets second (inside the store), logs
/// last. No path takes a contract lock while holding a wallet lock.
pub struct EscrowEngine {
    store: Arc<dyn WalletStore>,
    ledger: Arc<LedgerLog>,
    audit: Arc<AuditLog>,
    access: Arc<dyn AccessPolicy>,
    contracts: RwLock<HashMap<ContractId, Arc<Mutex<EscrowContract>>>>,
    config: StoreConfig,
}

impl EscrowEngine {
    pub fn new(
        store: Arc<dyn WalletStore>,
        ledger: Arc<LedgerLog>,
        audit: Arc<AuditLog>,
        access: Arc<dyn AccessPolicy>,
        config: StoreConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            audit,
            access,
            contracts: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Places the hold first; the contract exists only if the hold went
    /// through, so an offered contract is always fully funded.
    pub fn create_offer(
        &self,
        actor_id: &str,
        task_ref: &str,
        payer: EntityRef,
        payee_id: &str,
        amount_minor: AmountMinor,
        currency: Currency,
    ) -> Result<EscrowContract, EngineError> {
        require_positive(amount_minor)?;
        if !self.acts_for_payer(&payer, actor_id) {
            return Err(forbidden(actor_id, "offer funds from this wallet").into());
        }
        if payer.entity_type == EntityType::User && payer.entity_id == payee_id {
            return Err(forbidden(actor_id, "escrow funds to themselves").into());
        }

        let contract_id = Uuid::new_v4();
        self.store
            .hold(actor_id, &payer, currency, amount_minor, contract_id)?;
        let contract =
            EscrowContract::offer(contract_id, task_ref, payer, payee_id, amount_minor, currency);

        let mut contracts = match self.contracts.write() {
            Ok(contracts) => contracts,
            Err(_) => {
                // the contract will never exist; give the funds back
                self.return_stranded_hold(actor_id, &contract);
                return Err(ContractError::Internal(
                    "contract registry lock poisoned".to_string(),
                )
                .into());
            }
        };
        contracts.insert(contract_id, Arc::new(Mutex::new(contract.clone())));
        drop(contracts);

        self.audit_transition(
            actor_id,
            AuditAction::ContractOffered,
            &contract,
            None,
            ContractStatus::Offered,
            false,
        )?;
        info!(
            contract_id = %contract_id,
            task_ref,
            amount_minor,
            "contract offered"
        );
        Ok(contract)
    }

    /// Repeated accepts by the payee return the contract unchanged.
    pub fn accept_offer(
        &self,
        actor_id: &str,
        contract_id: ContractId,
    ) -> Result<EscrowContract, EngineError> {
        let cell = self.contract_cell(contract_id)?;
        let mut contract = self.lock_contract(&cell, contract_id)?;
        match contract.handle_accept(actor_id)? {
            Some(event) => {
                contract.apply(&event);
                self.audit_transition(
                    actor_id,
                    AuditAction::ContractAccepted,
                    &contract,
                    Some(event.from),
                    event.to,
                    false,
                )?;
                info!(contract_id = %contract_id, payee_id = actor_id, "contract accepted");
            }
            None => {
                debug!(contract_id = %contract_id, "repeat accept ignored");
            }
        }
        Ok(contract.clone())
    }

    /// Settles the escrow: captures the held funds over to the payee, then
    /// marks the contract completed. If the capture fails the contract stays
    /// accepted and the audit trail carries a reconciliation flag.
    pub fn complete_contract(
        &self,
        actor_id: &str,
        contract_id: ContractId,
    ) -> Result<EscrowContract, EngineError> {
        let cell = self.contract_cell(contract_id)?;
        let mut contract = self.lock_contract(&cell, contract_id)?;
        let acting_for_payer = self.acts_for_payer(contract.payer(), actor_id)
            || self.task_override(contract.task_ref(), actor_id);
        let event = contract.handle_complete(actor_id, acting_for_payer)?;

        let payee_wallet = EntityRef::user(contract.payee_id());
        match self.store.capture(
            actor_id,
            contract.payer(),
            &payee_wallet,
            contract.currency(),
            contract.amount_minor(),
            contract_id,
        ) {
            Ok(_) => {
                contract.apply(&event);
                self.audit_transition(
                    actor_id,
                    AuditAction::ContractCompleted,
                    &contract,
                    Some(event.from),
                    event.to,
                    false,
                )?;
                info!(
                    contract_id = %contract_id,
                    amount_minor = contract.amount_minor(),
                    "contract completed"
                );
                Ok(contract.clone())
            }
            Err(err) => {
                self.audit_transition(
                    actor_id,
                    AuditAction::ContractCaptureFailed,
                    &contract,
                    Some(ContractStatus::Accepted),
                    ContractStatus::Accepted,
                    true,
                )?;
                warn!(contract_id = %contract_id, %err, "capture failed, contract stays accepted");
                Err(err.into())
            }
        }
    }

    /// Either party walks away from an open offer; the hold goes back.
    pub fn reject_offer(
        &self,
        actor_id: &str,
        contract_id: ContractId,
    ) -> Result<EscrowContract, EngineError> {
        let cell = self.contract_cell(contract_id)?;
        let mut contract = self.lock_contract(&cell, contract_id)?;
        let acting_for_payer = self.acts_for_payer(contract.payer(), actor_id);
        let event = contract.handle_reject(actor_id, acting_for_payer)?;
        self.settle_release(actor_id, &mut contract, event, AuditAction::ContractRejected)?;
        Ok(contract.clone())
    }

    /// Calling off an accepted contract by mutual path; the hold goes back.
    pub fn cancel_contract(
        &self,
        actor_id: &str,
        contract_id: ContractId,
    ) -> Result<EscrowContract, EngineError> {
        let cell = self.contract_cell(contract_id)?;
        let mut contract = self.lock_contract(&cell, contract_id)?;
        let acting_for_payer = self.acts_for_payer(contract.payer(), actor_id);
        let event = contract.handle_cancel(actor_id, acting_for_payer)?;
        self.settle_release(actor_id, &mut contract, event, AuditAction::ContractCancelled)?;
        Ok(contract.clone())
    }

    /// Freezes the contract for out-of-band resolution. The hold stays in
    /// place, so neither side can touch the disputed funds.
    pub fn dispute_contract(
        &self,
        actor_id: &str,
        contract_id: ContractId,
    ) -> Result<EscrowContract, EngineError> {
        let cell = self.contract_cell(contract_id)?;
        let mut contract = self.lock_contract(&cell, contract_id)?;
        let acting_for_payer = self.acts_for_payer(contract.payer(), actor_id);
        let event = contract.handle_dispute(actor_id, acting_for_payer)?;
        contract.apply(&event);
        self.audit_transition(
            actor_id,
            AuditAction::ContractDisputed,
            &contract,
            Some(event.from),
            event.to,
            false,
        )?;
        info!(contract_id = %contract_id, "contract disputed, hold frozen");
        Ok(contract.clone())
    }

    pub fn contract(&self, contract_id: ContractId) -> Result<EscrowContract, EngineError> {
        let cell = self.contract_cell(contract_id)?;
        let contract = self.lock_contract(&cell, contract_id)?;
        Ok(contract.clone())
    }

    /// Replays the wallet's ledger and compares the running total against
    /// the recorded balances and the wallet itself.
    pub fn reconcile_wallet(
        &self,
        entity: &EntityRef,
    ) -> Result<ReconciliationReport, EngineError> {
        let balance = self.store.balance(entity)?;
        let entries = self
            .ledger
            .list(
                &LedgerFilter {
                    wallet: Some(entity.clone()),
                    ..Default::default()
                },
                Order::Ascending,
            )
            .map_err(WalletError::from)?;

        let mut running_total: AmountMinor = 0;
        let mut anomalies = Vec::new();
        for entry in &entries {
            let delta = match entry.kind {
                LedgerKind::TopUp => entry.amount_minor,
                LedgerKind::Refund => -entry.amount_minor,
                // holds and releases move funds between pots, the total stands
                LedgerKind::Hold | LedgerKind::Release => 0,
                LedgerKind::Capture => match self.capture_delta(entry, entity) {
                    Some(delta) => delta,
                    None => {
                        anomalies.push(format!(
                            "entry {}: capture references no known contract",
                            entry.id
                        ));
                        0
                    }
                },
            };
            match running_total.checked_add(delta) {
                Some(total) => running_total = total,
                None => anomalies.push(format!("entry {}: running total overflowed", entry.id)),
            }
            if running_total != entry.balance_after_minor {
                anomalies.push(format!(
                    "entry {}: replay says {} but the entry recorded {}",
                    entry.id, running_total, entry.balance_after_minor
                ));
                // resync so one bad entry does not drown out later findings
                running_total = entry.balance_after_minor;
            }
        }

        let wallet_total = balance.total_minor();
        if running_total != wallet_total {
            anomalies.push(format!(
                "ledger replays to {running_total} but the wallet holds {wallet_total}"
            ));
        }
        let report = ReconciliationReport {
            entity: entity.clone(),
            ledger_total_minor: running_total,
            wallet_total_minor: wallet_total,
            entries_checked: entries.len(),
            anomalies,
        };
        if report.is_clean() {
            debug!(wallet = %entity, entries = report.entries_checked, "reconciliation clean");
        } else {
            warn!(
                wallet = %entity,
                anomalies = report.anomalies.len(),
                "reconciliation found anomalies"
            );
        }
        Ok(report)
    }

    fn capture_delta(&self, entry: &LedgerEntry, entity: &EntityRef) -> Option<AmountMinor> {
        let contract_id = entry.related_contract_id?;
        let cell = self.contract_cell(contract_id).ok()?;
        let contract = self.lock_contract(&cell, contract_id).ok()?;
        if contract.payer() == entity {
            Some(-entry.amount_minor)
        } else if EntityRef::user(contract.payee_id()) == *entity {
            Some(entry.amount_minor)
        } else {
            None
        }
    }

    fn acts_for_payer(&self, payer: &EntityRef, actor_id: &str) -> bool {
        match payer.entity_type {
            EntityType::User => payer.entity_id == actor_id,
            EntityType::Organization => self
                .access
                .role_of(&payer.entity_id, actor_id)
                .is_some_and(Role::can_administer),
        }
    }

    fn task_override(&self, task_ref: &str, actor_id: &str) -> bool {
        self.access
            .role_of(task_ref, actor_id)
            .is_some_and(Role::can_administer)
    }

    fn settle_release(
        &self,
        actor_id: &str,
        contract: &mut EscrowContract,
        event: ContractEvent,
        action: AuditAction,
    ) -> Result<(), EngineError> {
        match self.store.release(
            actor_id,
            contract.payer(),
            contract.amount_minor(),
            contract.id(),
        ) {
            Ok(_) => {
                contract.apply(&event);
                self.audit_transition(
                    actor_id,
                    action,
                    contract,
                    Some(event.from),
                    event.to,
                    false,
                )?;
                info!(contract_id = %contract.id(), ?action, "hold returned to payer");
                Ok(())
            }
            Err(err) => {
                self.audit_transition(
                    actor_id,
                    AuditAction::ContractReleaseFailed,
                    contract,
                    Some(event.from),
                    event.from,
                    true,
                )?;
                error!(contract_id = %contract.id(), %err, "hold could not be returned");
                Err(err.into())
            }
        }
    }

    fn return_stranded_hold(&self, actor_id: &str, contract: &EscrowContract) {
        if let Err(err) = self.store.release(
            actor_id,
            contract.payer(),
            contract.amount_minor(),
            contract.id(),
        ) {
            error!(contract_id = %contract.id(), %err, "stranded hold could not be returned");
            let _ = self.audit.append(NewAuditEvent {
                actor_id: actor_id.to_string(),
                action: AuditAction::ContractReleaseFailed,
                entity_kind: AuditEntityKind::Contract,
                entity_id: contract.id().to_string(),
                project_ref: Some(contract.task_ref().to_string()),
                before: Value::Null,
                after: Value::Null,
                needs_reconciliation: true,
            });
        }
    }

    fn audit_transition(
        &self,
        actor_id: &str,
        action: AuditAction,
        contract: &EscrowContract,
        before: Option<ContractStatus>,
        after: ContractStatus,
        needs_reconciliation: bool,
    ) -> Result<(), ContractError> {
        self.audit.append(NewAuditEvent {
            actor_id: actor_id.to_string(),
            action,
            entity_kind: AuditEntityKind::Contract,
            entity_id: contract.id().to_string(),
            project_ref: Some(contract.task_ref().to_string()),
            before: match before {
                Some(status) => json!({ "status": status }),
                None => Value::Null,
            },
            after: json!({ "status": after }),
            needs_reconciliation,
        })?;
        Ok(())
    }

    fn contract_cell(
        &self,
        contract_id: ContractId,
    ) -> Result<Arc<Mutex<EscrowContract>>, ContractError> {
        let contracts = self
            .contracts
            .read()
            .map_err(|_| ContractError::Internal("contract registry lock poisoned".to_string()))?;
        contracts
            .get(&contract_id)
            .cloned()
            .ok_or(ContractError::NotFound(contract_id))
    }

    fn lock_contract<'a>(
        &self,
        cell: &'a Mutex<EscrowContract>,
        contract_id: ContractId,
    ) -> Result<MutexGuard<'a, EscrowContract>, ContractError> {
        let attempts = self.config.lock_attempts.max(1);
        for attempt in 1..=attempts {
            match cell.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(_)) => {
                    return Err(ContractError::Internal(format!(
                        "contract lock for {contract_id} poisoned"
                    )));
                }
                Err(TryLockError::WouldBlock) if attempt < attempts => {
                    thread::sleep(self.config.lock_backoff);
                }
                Err(TryLockError::WouldBlock) => {}
            }
        }
        warn!(contract_id = %contract_id, "contract stayed busy, giving up");
        Err(ContractError::Conflict(contract_id))
    }
}

fn forbidden(actor_id: &str, action: &'static str) -> ContractError {
    ContractError::Forbidden {
        actor_id: actor_id.to_string(),
        action,
    }
}

#[cfg(test)]
mod tests {
    use crate::access::StaticAccessPolicy;
    use crate::audit::AuditFilter;
    use crate::ledger::NewLedgerEntry;
    use crate::store::in_memory_store::InMemoryWalletStore;

    use super::*;

    struct Rig {
        engine: EscrowEngine,
        policy: Arc<StaticAccessPolicy>,
        ledger: Arc<LedgerLog>,
        audit: Arc<AuditLog>,
        store: Arc<InMemoryWalletStore>,
    }

    fn rig() -> Rig {
        let ledger = Arc::new(LedgerLog::new());
        let audit = Arc::new(AuditLog::new());
        let store = Arc::new(InMemoryWalletStore::new(
            ledger.clone(),
            audit.clone(),
            StoreConfig::default(),
        ));
        let policy = Arc::new(StaticAccessPolicy::new());
        let engine = EscrowEngine::new(
            store.clone(),
            ledger.clone(),
            audit.clone(),
            policy.clone(),
            StoreConfig::default(),
        );
        Rig {
            engine,
            policy,
            ledger,
            audit,
            store,
        }
    }

    fn usd() -> Currency {
        Currency::new("USD").unwrap()
    }

    fn funded_offer(rig: &Rig) -> EscrowContract {
        let alice = EntityRef::user("alice");
        rig.store
            .top_up("alice", &alice, usd(), 10000, "seed-alice")
            .unwrap();
        rig.engine
            .create_offer("alice", "task-7", alice, "bob", 4000, usd())
            .unwrap()
    }

    fn actions(rig: &Rig) -> Vec<AuditAction> {
        rig.audit
            .list(&AuditFilter::default(), Order::Ascending)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect()
    }

    #[test]
    fn offer_holds_funds_and_registers_the_contract() {
        let rig = rig();
        let contract = funded_offer(&rig);
        assert_eq!(contract.status(), ContractStatus::Offered);
        assert_eq!(contract.task_ref(), "task-7");
        assert_eq!(contract.amount_minor(), 4000);

        let balance = rig.store.balance(&EntityRef::user("alice")).unwrap();
        assert_eq!((balance.available_minor, balance.held_minor), (6000, 4000));

        let fetched = rig.engine.contract(contract.id()).unwrap();
        assert_eq!(fetched.status(), ContractStatus::Offered);
        assert_eq!(fetched.payee_id(), "bob");

        assert_eq!(
            actions(&rig),
            [
                AuditAction::WalletTopUp,
                AuditAction::WalletHold,
                AuditAction::ContractOffered,
            ]
        );
        let offered = rig
            .audit
            .list(
                &AuditFilter {
                    actions: vec![AuditAction::ContractOffered],
                    ..Default::default()
                },
                Order::Ascending,
            )
            .unwrap();
        assert_eq!(offered[0].project_ref.as_deref(), Some("task-7"));
        assert_eq!(offered[0].before, Value::Null);
        assert_eq!(offered[0].after["status"], "offered");
    }

    #[test]
    fn offer_without_funds_creates_nothing() {
        let rig = rig();
        let err = rig
            .engine
            .create_offer("alice", "task-7", EntityRef::user("alice"), "bob", 4000, usd())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Wallet(WalletError::InsufficientFunds { .. })
        ));
        // no hold entry, no contract event, nothing to accept later
        assert!(actions(&rig).is_empty());
        assert!(rig.ledger.is_empty().unwrap());
    }

    #[test]
    fn offer_may_hold_the_entire_balance_but_not_more() {
        let rig = rig();
        let alice = EntityRef::user("alice");
        rig.store.top_up("alice", &alice, usd(), 1000, "seed").unwrap();

        let err = rig
            .engine
            .create_offer("alice", "task-7", alice.clone(), "bob", 1001, usd())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Wallet(WalletError::InsufficientFunds {
                requested_minor: 1001,
                available_minor: 1000,
            })
        ));
        let balance = rig.store.balance(&alice).unwrap();
        assert_eq!((balance.available_minor, balance.held_minor), (1000, 0));

        rig.engine
            .create_offer("alice", "task-7", alice.clone(), "bob", 1000, usd())
            .unwrap();
        let balance = rig.store.balance(&alice).unwrap();
        assert_eq!((balance.available_minor, balance.held_minor), (0, 1000));
    }

    #[test]
    fn offer_amount_must_be_positive() {
        let rig = rig();
        let err = rig
            .engine
            .create_offer("alice", "task-7", EntityRef::user("alice"), "bob", 0, usd())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Wallet(WalletError::InvalidAmount { .. })
        ));
    }

    #[test]
    fn offer_needs_payer_standing() {
        let rig = rig();
        let acme = EntityRef::organization("acme");
        rig.store
            .top_up("carol", &acme, usd(), 10000, "seed-acme")
            .unwrap();

        // a user wallet can only be offered from by its owner
        let err = rig
            .engine
            .create_offer("mallory", "task-7", EntityRef::user("alice"), "bob", 100, usd())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Contract(ContractError::Forbidden { .. })
        ));

        // org wallets need an administering role
        let err = rig
            .engine
            .create_offer("carol", "task-7", acme.clone(), "bob", 100, usd())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Contract(ContractError::Forbidden { .. })
        ));
        rig.policy.grant("acme", "dave", Role::Member);
        assert!(
            rig.engine
                .create_offer("dave", "task-7", acme.clone(), "bob", 100, usd())
                .is_err()
        );
        rig.policy.grant("acme", "carol", Role::Admin);
        let contract = rig
            .engine
            .create_offer("carol", "task-7", acme.clone(), "bob", 100, usd())
            .unwrap();
        assert_eq!(contract.payer(), &acme);
    }

    #[test]
    fn users_cannot_escrow_to_themselves() {
        let rig = rig();
        let alice = EntityRef::user("alice");
        rig.store
            .top_up("alice", &alice, usd(), 1000, "seed")
            .unwrap();
        let err = rig
            .engine
            .create_offer("alice", "task-7", alice, "alice", 100, usd())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Contract(ContractError::Forbidden { .. })
        ));
        assert_eq!(
            err.to_string(),
            "Actor `alice` may not escrow funds to themselves"
        );

        // an org paying one of its own admins is a different situation
        let acme = EntityRef::organization("acme");
        rig.store
            .top_up("carol", &acme, usd(), 1000, "seed-acme")
            .unwrap();
        rig.policy.grant("acme", "carol", Role::Owner);
        assert!(
            rig.engine
                .create_offer("carol", "task-8", acme, "carol", 100, usd())
                .is_ok()
        );
    }

    #[test]
    fn accept_then_complete_pays_the_payee() {
        let rig = rig();
        let contract = funded_offer(&rig);

        let accepted = rig.engine.accept_offer("bob", contract.id()).unwrap();
        assert_eq!(accepted.status(), ContractStatus::Accepted);

        // a second accept changes nothing and records nothing
        let audit_len = rig.audit.len().unwrap();
        let repeat = rig.engine.accept_offer("bob", contract.id()).unwrap();
        assert_eq!(repeat.status(), ContractStatus::Accepted);
        assert_eq!(rig.audit.len().unwrap(), audit_len);

        let completed = rig.engine.complete_contract("alice", contract.id()).unwrap();
        assert_eq!(completed.status(), ContractStatus::Completed);

        let alice = rig.store.balance(&EntityRef::user("alice")).unwrap();
        assert_eq!((alice.available_minor, alice.held_minor), (6000, 0));
        let bob = rig.store.balance(&EntityRef::user("bob")).unwrap();
        assert_eq!((bob.available_minor, bob.held_minor), (4000, 0));

        assert_eq!(
            actions(&rig),
            [
                AuditAction::WalletTopUp,
                AuditAction::WalletHold,
                AuditAction::ContractOffered,
                AuditAction::ContractAccepted,
                AuditAction::WalletCapture,
                AuditAction::ContractCompleted,
            ]
        );

        // settled means settled
        let err = rig.engine.cancel_contract("alice", contract.id()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Contract(ContractError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn complete_needs_the_payer_or_an_override() {
        let rig = rig();
        let contract = funded_offer(&rig);
        rig.engine.accept_offer("bob", contract.id()).unwrap();

        for sneak in ["bob", "mallory"] {
            let err = rig.engine.complete_contract(sneak, contract.id()).unwrap_err();
            assert!(matches!(
                err,
                EngineError::Contract(ContractError::Forbidden { .. })
            ));
        }

        // a task-scope administrator can force the payout
        rig.policy.grant("task-7", "root", Role::Admin);
        let completed = rig.engine.complete_contract("root", contract.id()).unwrap();
        assert_eq!(completed.status(), ContractStatus::Completed);
    }

    #[test]
    fn reject_returns_the_hold() {
        let rig = rig();
        let contract = funded_offer(&rig);

        let rejected = rig.engine.reject_offer("bob", contract.id()).unwrap();
        assert_eq!(rejected.status(), ContractStatus::Rejected);

        let alice = rig.store.balance(&EntityRef::user("alice")).unwrap();
        assert_eq!((alice.available_minor, alice.held_minor), (10000, 0));
        // the payee never got a wallet out of it
        assert!(matches!(
            rig.store.balance(&EntityRef::user("bob")).unwrap_err(),
            WalletError::NotFound(_)
        ));

        let err = rig.engine.accept_offer("bob", contract.id()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Contract(ContractError::InvalidTransition { .. })
        ));
        assert!(actions(&rig).contains(&AuditAction::ContractRejected));
    }

    #[test]
    fn cancel_returns_the_hold_from_either_party() {
        for canceller in ["alice", "bob"] {
            let rig = rig();
            let contract = funded_offer(&rig);
            rig.engine.accept_offer("bob", contract.id()).unwrap();

            let cancelled = rig.engine.cancel_contract(canceller, contract.id()).unwrap();
            assert_eq!(cancelled.status(), ContractStatus::Cancelled);
            let alice = rig.store.balance(&EntityRef::user("alice")).unwrap();
            assert_eq!((alice.available_minor, alice.held_minor), (10000, 0));
        }
    }

    #[test]
    fn dispute_freezes_the_hold() {
        let rig = rig();
        let contract = funded_offer(&rig);
        rig.engine.accept_offer("bob", contract.id()).unwrap();

        let disputed = rig.engine.dispute_contract("bob", contract.id()).unwrap();
        assert_eq!(disputed.status(), ContractStatus::Disputed);

        // funds stay locked and no transition gets out of a dispute
        let alice = rig.store.balance(&EntityRef::user("alice")).unwrap();
        assert_eq!((alice.available_minor, alice.held_minor), (6000, 4000));
        let err = rig.engine.complete_contract("alice", contract.id()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Contract(ContractError::InvalidTransition { .. })
        ));
        let err = rig.engine.cancel_contract("bob", contract.id()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Contract(ContractError::InvalidTransition { .. })
        ));

        let disputes = rig
            .audit
            .list(
                &AuditFilter {
                    actions: vec![AuditAction::ContractDisputed],
                    ..Default::default()
                },
                Order::Ascending,
            )
            .unwrap();
        assert_eq!(disputes.len(), 1);
        assert_eq!(disputes[0].before["status"], "accepted");
        assert_eq!(disputes[0].after["status"], "disputed");
    }

    #[test]
    fn failed_capture_flags_reconciliation_and_keeps_the_contract_accepted() {
        let rig = rig();
        let bob = EntityRef::user("bob");
        // leave bob's wallet one unit short of full, so the payout cannot fit
        rig.store
            .top_up("bob", &bob, usd(), AmountMinor::MAX - 1, "seed-bob")
            .unwrap();
        let contract = funded_offer(&rig);
        rig.engine.accept_offer("bob", contract.id()).unwrap();

        let err = rig.engine.complete_contract("alice", contract.id()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Wallet(WalletError::InvalidAmount { .. })
        ));
        assert_eq!(
            rig.engine.contract(contract.id()).unwrap().status(),
            ContractStatus::Accepted
        );

        let flagged = rig
            .audit
            .list(
                &AuditFilter {
                    needs_reconciliation: Some(true),
                    ..Default::default()
                },
                Order::Ascending,
            )
            .unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].action, AuditAction::ContractCaptureFailed);
        assert_eq!(flagged[0].before["status"], "accepted");
        assert_eq!(flagged[0].after["status"], "accepted");

        // the backed-out capture left every wallet consistent
        assert!(rig.engine.reconcile_wallet(&EntityRef::user("alice")).unwrap().is_clean());
        assert!(rig.engine.reconcile_wallet(&bob).unwrap().is_clean());

        // cancelling still works and frees the hold
        rig.engine.cancel_contract("alice", contract.id()).unwrap();
        let alice = rig.store.balance(&EntityRef::user("alice")).unwrap();
        assert_eq!((alice.available_minor, alice.held_minor), (10000, 0));
    }

    #[test]
    fn reconcile_replays_the_whole_lifecycle() {
        let rig = rig();
        let alice = EntityRef::user("alice");
        let contract = funded_offer(&rig);
        rig.engine.accept_offer("bob", contract.id()).unwrap();
        rig.engine.complete_contract("alice", contract.id()).unwrap();
        rig.store.refund("alice", &alice, 1000, "r1").unwrap();

        let report = rig.engine.reconcile_wallet(&alice).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.ledger_total_minor, 5000);
        assert_eq!(report.wallet_total_minor, 5000);
        assert_eq!(report.entries_checked, 4);

        let report = rig.engine.reconcile_wallet(&EntityRef::user("bob")).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.ledger_total_minor, 4000);
    }

    #[test]
    fn reconcile_reports_tampering() {
        let rig = rig();
        let alice = EntityRef::user("alice");
        rig.store
            .top_up("alice", &alice, usd(), 5000, "seed")
            .unwrap();

        // an entry the wallet never saw, with a balance that cannot line up
        rig.ledger
            .append(NewLedgerEntry {
                wallet: alice.clone(),
                kind: LedgerKind::Capture,
                amount_minor: 700,
                related_contract_id: None,
                balance_after_minor: 99,
            })
            .unwrap();

        let report = rig.engine.reconcile_wallet(&alice).unwrap();
        assert!(!report.is_clean());
        assert!(
            report
                .anomalies
                .iter()
                .any(|a| a.contains("no known contract"))
        );
        assert!(report.anomalies.iter().any(|a| a.contains("recorded 99")));
        assert!(
            report
                .anomalies
                .iter()
                .any(|a| a.contains("the wallet holds 5000"))
        );
    }

    #[test]
    fn unknown_contracts_are_not_found() {
        let rig = rig();
        let err = rig.engine.accept_offer("bob", Uuid::new_v4()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Contract(ContractError::NotFound(_))
        ));
        let err = rig.engine.contract(Uuid::new_v4()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Contract(ContractError::NotFound(_))
        ));
    }
}
