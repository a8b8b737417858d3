use std::io::Read;

use csv::{DeserializeRecordsIntoIter, Trim};
use serde::Deserialize;

use crate::access::Role;
use crate::money::{AmountMinor, Currency};
use crate::wallet::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Grant,
    Topup,
    Refund,
    Offer,
    Accept,
    Complete,
    Reject,
    Cancel,
    Dispute,
}

/// One scripted operation. Which columns must be filled depends on `op`;
/// contract operations refer back to an earlier `offer` row by `task`, and
/// `grant` rows give `actor` the `role` within the scope named in `entity`.
#[derive(Debug, Deserialize)]
pub struct OperationRow {
    pub op: OperationKind,
    pub actor: String,
    pub entity_type: Option<EntityType>,
    pub entity: Option<String>,
    pub payee: Option<String>,
    pub amount: Option<AmountMinor>,
    pub currency: Option<Currency>,
    pub task: Option<String>,
    pub key: Option<String>,
    pub role: Option<Role>,
}

/// Parses an operation script in CSV format
///
/// # Panics
///
/// If a row cannot be parsed
pub struct CsvOperationParser<R> {
    iter: DeserializeRecordsIntoIter<R, OperationRow>,
}

impl<R> CsvOperationParser<R>
where
    R: Read,
{
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(source);

        Self {
            iter: reader.into_deserialize(),
        }
    }
}

impl<R> Iterator for CsvOperationParser<R>
where
    R: Read,
{
    type Item = (u64, OperationRow);

    fn next(&mut self) -> Option<Self::Item> {
        let curr_line = self.iter.reader().position().line();
        self.iter.next().map(|row| (curr_line, row.unwrap()))
    }
}
