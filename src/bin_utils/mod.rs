//! This module could be a separate crate on its own, to bootstrap [`escrow_ledger`] within a
//! binary, but for simplicity it lives here so the integration tests can use it too.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;

use crate::access::StaticAccessPolicy;
use crate::audit::AuditLog;
use crate::contract::ContractId;
use crate::engine::{EngineError, EscrowEngine};
use crate::ledger::LedgerLog;
use crate::store::{StoreConfig, WalletStore, in_memory_store::InMemoryWalletStore};
use crate::wallet::{EntityRef, WalletError};
use csv_parser::{CsvOperationParser, OperationKind, OperationRow};
use csv_printer::{BalanceRow, print_balances};
pub mod csv_parser;
pub mod csv_printer;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{op:?} needs a value in the `{column}` column")]
    MissingColumn {
        op: OperationKind,
        column: &'static str,
    },
    #[error("No earlier offer used the task reference `{0}`")]
    UnknownTask(String),
    #[error(transparent)]
    WalletErr(#[from] WalletError),
    #[error(transparent)]
    EngineErr(#[from] EngineError),
}

pub struct Service<'w, R, W: 'w> {
    pub input: R,
    pub output: &'w mut W,
    pub error_printer: Box<dyn FnMut(u64, ServiceError)>,
}

impl<'w, R, W> Service<'w, R, W>
where
    R: Read,
    W: Write + 'w,
{
    pub fn run(mut self) -> Result<()> {
        let parser = CsvOperationParser::new(self.input);

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
            ledger,
            audit,
            policy.clone(),
            StoreConfig::default(),
        );
        let mut contracts_by_task: HashMap<String, ContractId> = HashMap::new();

        for (line, row) in parser {
            if let Err(err) = apply_row(&engine, store.as_ref(), &policy, &mut contracts_by_task, row)
            {
                (self.error_printer)(line, err);
            }
        }

        print_balances(
            self.output,
            store.balances()?.into_iter().map(|(entity, balance)| BalanceRow {
                entity_type: entity.entity_type,
                entity: entity.entity_id,
                currency: balance.currency,
                available: balance.available_minor,
                held: balance.held_minor,
                total: balance.total_minor(),
            }),
        )
    }
}

fn apply_row(
    engine: &EscrowEngine,
    store: &dyn WalletStore,
    policy: &StaticAccessPolicy,
    contracts_by_task: &mut HashMap<String, ContractId>,
    row: OperationRow,
) -> Result<(), ServiceError> {
    match row.op {
        OperationKind::Grant => {
            let scope = require(row.entity, row.op, "entity")?;
            let role = require(row.role, row.op, "role")?;
            policy.grant(scope, row.actor, role);
        }
        OperationKind::Topup => {
            let entity = payer_entity(&row)?;
            let amount = require(row.amount, row.op, "amount")?;
            let currency = require(row.currency, row.op, "currency")?;
            let key = require(row.key, row.op, "key")?;
            store.top_up(&row.actor, &entity, currency, amount, &key)?;
        }
        OperationKind::Refund => {
            let entity = payer_entity(&row)?;
            let amount = require(row.amount, row.op, "amount")?;
            let key = require(row.key, row.op, "key")?;
            store.refund(&row.actor, &entity, amount, &key)?;
        }
        OperationKind::Offer => {
            let payer = payer_entity(&row)?;
            let payee = require(row.payee, row.op, "payee")?;
            let amount = require(row.amount, row.op, "amount")?;
            let currency = require(row.currency, row.op, "currency")?;
            let task = require(row.task, row.op, "task")?;
            let contract = engine.create_offer(&row.actor, &task, payer, &payee, amount, currency)?;
            contracts_by_task.insert(task, contract.id());
        }
        OperationKind::Accept => {
            let contract_id = contract_for(contracts_by_task, row.task, row.op)?;
            engine.accept_offer(&row.actor, contract_id)?;
        }
        OperationKind::Complete => {
            let contract_id = contract_for(contracts_by_task, row.task, row.op)?;
            engine.complete_contract(&row.actor, contract_id)?;
        }
        OperationKind::Reject => {
            let contract_id = contract_for(contracts_by_task, row.task, row.op)?;
            engine.reject_offer(&row.actor, contract_id)?;
        }
        OperationKind::Cancel => {
            let contract_id = contract_for(contracts_by_task, row.task, row.op)?;
            engine.cancel_contract(&row.actor, contract_id)?;
        }
        OperationKind::Dispute => {
            let contract_id = contract_for(contracts_by_task, row.task, row.op)?;
            engine.dispute_contract(&row.actor, contract_id)?;
        }
    }
    Ok(())
}

fn require<T>(value: Option<T>, op: OperationKind, column: &'static str) -> Result<T, ServiceError> {
    value.ok_or(ServiceError::MissingColumn { op, column })
}

fn payer_entity(row: &OperationRow) -> Result<EntityRef, ServiceError> {
    let entity_type = require(row.entity_type, row.op, "entity_type")?;
    let entity_id = require(row.entity.clone(), row.op, "entity")?;
    Ok(EntityRef {
        entity_type,
        entity_id,
    })
}

fn contract_for(
    contracts_by_task: &HashMap<String, ContractId>,
    task: Option<String>,
    op: OperationKind,
) -> Result<ContractId, ServiceError> {
    let task = require(task, op, "task")?;
    contracts_by_task
        .get(&task)
        .copied()
        .ok_or(ServiceError::UnknownTask(task))
}
