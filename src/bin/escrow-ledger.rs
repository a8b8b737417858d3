use std::fs::File;

use anyhow::{Context, Result};
use escrow_ledger::bin_utils::Service;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let filename = std::env::args()
        .nth(1)
        .context("Expected a file name as the first argument")?;
    let file = File::open(&filename).with_context(|| format!("Failed to open `{filename}`"))?;

    let service = Service {
        input: file,
        output: &mut std::io::stdout(),
        error_printer: Box::new(|line, err| {
            match err {
                escrow_ledger::bin_utils::ServiceError::MissingColumn { .. }
                | escrow_ledger::bin_utils::ServiceError::UnknownTask(_) => {
                    eprintln!("Error at line {line}: {err}")
                }
                escrow_ledger::bin_utils::ServiceError::WalletErr(_)
                | escrow_ledger::bin_utils::ServiceError::EngineErr(_) => {
                    // these are not technical errors, so we don't need to print them
                }
            }
        }),
    };
    service.run()
}
