use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contract::ActorId;
use crate::ledger::{LogPoisoned, Order};

pub type AuditEventId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    WalletTopUp,
    WalletHold,
    WalletRelease,
    WalletCapture,
    WalletRefund,
    ContractOffered,
    ContractAccepted,
    ContractCompleted,
    ContractRejected,
    ContractCancelled,
    ContractDisputed,
    /// Settlement was attempted and refused; the contract stayed accepted.
    ContractCaptureFailed,
    /// A hold could not be returned while rejecting or cancelling.
    ContractReleaseFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntityKind {
    Wallet,
    Contract,
}

/// Answers "who did what, and what changed". `before` and `after` are
/// snapshots of the touched entity, as JSON so wallet balances and contract
/// statuses share one log.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: AuditEventId,
    pub actor_id: ActorId,
    pub action: AuditAction,
    pub entity_kind: AuditEntityKind,
    pub entity_id: String,
    /// Task scope for contract events; wallet events carry no scope.
    pub project_ref: Option<String>,
    pub before: Value,
    pub after: Value,
    /// Set when a money movement failed partway and an operator should
    /// compare the ledger against wallet balances.
    pub needs_reconciliation: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAuditEvent {
    pub actor_id: ActorId,
    pub action: AuditAction,
    pub entity_kind: AuditEntityKind,
    pub entity_id: String,
    pub project_ref: Option<String>,
    pub before: Value,
    pub after: Value,
    pub needs_reconciliation: bool,
}

#[derive(Debug, Default, Clone)]
pub struct AuditFilter {
    pub project_ref: Option<String>,
    pub entity_kind: Option<AuditEntityKind>,
    pub entity_id: Option<String>,
    /// Empty means any action.
    pub actions: Vec<AuditAction>,
    pub needs_reconciliation: Option<bool>,
}

impl AuditFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(project_ref) = &self.project_ref {
            if event.project_ref.as_deref() != Some(project_ref.as_str()) {
                return false;
            }
        }
        if let Some(entity_kind) = self.entity_kind {
            if event.entity_kind != entity_kind {
                return false;
            }
        }
        if let Some(entity_id) = &self.entity_id {
            if event.entity_id != *entity_id {
                return false;
            }
        }
        if !self.actions.is_empty() && !self.actions.contains(&event.action) {
            return false;
        }
        if let Some(flag) = self.needs_reconciliation {
            if event.needs_reconciliation != flag {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Default)]
pub struct AuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, draft: NewAuditEvent) -> Result<AuditEvent, LogPoisoned> {
        let mut events = self.events.lock().map_err(|_| LogPoisoned)?;
        let event = AuditEvent {
            id: events.len() as AuditEventId + 1,
            actor_id: draft.actor_id,
            action: draft.action,
            entity_kind: draft.entity_kind,
            entity_id: draft.entity_id,
            project_ref: draft.project_ref,
            before: draft.before,
            after: draft.after,
            needs_reconciliation: draft.needs_reconciliation,
            created_at: Utc::now(),
        };
        events.push(event.clone());
        Ok(event)
    }

    pub fn list(&self, filter: &AuditFilter, order: Order) -> Result<Vec<AuditEvent>, LogPoisoned> {
        let events = self.events.lock().map_err(|_| LogPoisoned)?;
        let mut out: Vec<AuditEvent> = events.iter().filter(|e| filter.matches(e)).cloned().collect();
        if order == Order::Descending {
            out.reverse();
        }
        Ok(out)
    }

    pub fn len(&self) -> Result<usize, LogPoisoned> {
        Ok(self.events.lock().map_err(|_| LogPoisoned)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, LogPoisoned> {
        Ok(self.len()? == 0)
    }
}
