use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::LogPoisoned;
use crate::money::{AmountMinor, Currency};
use crate::wallet::EntityRef;

pub type ContractId = Uuid;
pub type ActorId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    Offered,
    Accepted,
    Completed,
    Rejected,
    Cancelled,
    Disputed,
}

impl ContractStatus {
    /// Terminal contracts never transition again; disputes are settled
    /// outside the engine.
    pub fn is_terminal(self) -> bool {
        match self {
            ContractStatus::Offered | ContractStatus::Accepted => false,
            ContractStatus::Completed
            | ContractStatus::Rejected
            | ContractStatus::Cancelled
            | ContractStatus::Disputed => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractEvent {
    pub from: ContractStatus,
    pub to: ContractStatus,
}

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("Contract {0} does not exist")]
    NotFound(ContractId),
    #[error("Actor `{actor_id}` may not {action}")]
    Forbidden {
        actor_id: ActorId,
        action: &'static str,
    },
    #[error("Cannot {action} a contract that is {status:?}")]
    InvalidTransition {
        action: &'static str,
        status: ContractStatus,
    },
    #[error("Contract {0} is busy, gave up waiting for it")]
    Conflict(ContractId),
    #[error("Contract storage is unavailable: {0}")]
    Internal(String),
}

impl From<LogPoisoned> for ContractError {
    fn from(err: LogPoisoned) -> Self {
        ContractError::Internal(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct EscrowContract {
    id: ContractId,
    task_ref: String,
    payer: EntityRef,
    payee_id: ActorId,
    amount_minor: AmountMinor,
    currency: Currency,
    status: ContractStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EscrowContract {
    pub fn offer(
        id: ContractId,
        task_ref: impl Into<String>,
        payer: EntityRef,
        payee_id: impl Into<ActorId>,
        amount_minor: AmountMinor,
        currency: Currency,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            task_ref: task_ref.into(),
            payer,
            payee_id: payee_id.into(),
            amount_minor,
            currency,
            status: ContractStatus::Offered,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> ContractId {
        self.id
    }

    pub fn task_ref(&self) -> &str {
        &self.task_ref
    }

    pub fn payer(&self) -> &EntityRef {
        &self.payer
    }

    pub fn payee_id(&self) -> &str {
        &self.payee_id
    }

    pub fn amount_minor(&self) -> AmountMinor {
        self.amount_minor
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn status(&self) -> ContractStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn apply(&mut self, event: &ContractEvent) {
        self.status = event.to;
        self.updated_at = Utc::now();
    }

    /// `Ok(None)` is a repeated accept by the same payee: a no-op, not an
    /// error, and nothing is recorded for it.
    pub fn handle_accept(&self, actor_id: &str) -> Result<Option<ContractEvent>, ContractError> {
        let is_payee = actor_id == self.payee_id;
        match self.status {
            ContractStatus::Offered if is_payee => {
                Ok(Some(self.event_to(ContractStatus::Accepted)))
            }
            ContractStatus::Offered => Err(forbidden(actor_id, "accept this contract")),
            ContractStatus::Accepted if is_payee => Ok(None),
            status => Err(ContractError::InvalidTransition {
                action: "accept",
                status,
            }),
        }
    }

    pub fn handle_complete(
        &self,
        actor_id: &str,
        acting_for_payer: bool,
    ) -> Result<ContractEvent, ContractError> {
        match self.status {
            ContractStatus::Accepted if acting_for_payer => {
                Ok(self.event_to(ContractStatus::Completed))
            }
            ContractStatus::Accepted => Err(forbidden(actor_id, "complete this contract")),
            status => Err(ContractError::InvalidTransition {
                action: "complete",
                status,
            }),
        }
    }

    pub fn handle_reject(
        &self,
        actor_id: &str,
        acting_for_payer: bool,
    ) -> Result<ContractEvent, ContractError> {
        let is_party = acting_for_payer || actor_id == self.payee_id;
        match self.status {
            ContractStatus::Offered if is_party => Ok(self.event_to(ContractStatus::Rejected)),
            ContractStatus::Offered => Err(forbidden(actor_id, "reject this contract")),
            status => Err(ContractError::InvalidTransition {
                action: "reject",
                status,
            }),
        }
    }

    pub fn handle_cancel(
        &self,
        actor_id: &str,
        acting_for_payer: bool,
    ) -> Result<ContractEvent, ContractError> {
        let is_party = acting_for_payer || actor_id == self.payee_id;
        match self.status {
            ContractStatus::Accepted if is_party => Ok(self.event_to(ContractStatus::Cancelled)),
            ContractStatus::Accepted => Err(forbidden(actor_id, "cancel this contract")),
            status => Err(ContractError::InvalidTransition {
                action: "cancel",
                status,
            }),
        }
    }

    pub fn handle_dispute(
        &self,
        actor_id: &str,
        acting_for_payer: bool,
    ) -> Result<ContractEvent, ContractError> {
        let is_party = acting_for_payer || actor_id == self.payee_id;
        match self.status {
            ContractStatus::Offered | ContractStatus::Accepted if is_party => {
                Ok(self.event_to(ContractStatus::Disputed))
            }
            ContractStatus::Offered | ContractStatus::Accepted => {
                Err(forbidden(actor_id, "dispute this contract"))
            }
            status => Err(ContractError::InvalidTransition {
                action: "dispute",
                status,
            }),
        }
    }

    fn event_to(&self, to: ContractStatus) -> ContractEvent {
        ContractEvent {
            from: self.status,
            to,
        }
    }
}

fn forbidden(actor_id: &str, action: &'static str) -> ContractError {
    ContractError::Forbidden {
        actor_id: actor_id.to_string(),
        action,
    }
}
