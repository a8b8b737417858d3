use std::io::Write;

use csv::Writer;
use serde::Serialize;

use crate::money::{AmountMinor, Currency};
use crate::wallet::EntityType;

#[derive(Debug, Serialize)]
pub struct BalanceRow {
    pub entity_type: EntityType,
    pub entity: String,
    pub currency: Currency,
    pub available: AmountMinor,
    pub held: AmountMinor,
    pub total: AmountMinor,
}

pub fn print_balances<W>(
    output: &mut W,
    balances: impl Iterator<Item = BalanceRow>,
) -> anyhow::Result<()>
where
    W: Write,
{
    let mut writer = Writer::from_writer(output);
    for row in balances {
        if let Err(err) = writer.serialize(row) {
            anyhow::bail!("Failed to write to CSV: {err}")
        }
    }
    // Ensure all data is flushed to the output
    if let Err(err) = writer.flush() {
        anyhow::bail!("Failed to flush CSV writer: {err}")
    }
    Ok(())
}
