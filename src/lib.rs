/// Fine grained access roles, plus a static in-memory policy for tests
/// and the CSV runner.
pub mod access;

/// Append-only record of every money movement and contract transition,
/// kept for compliance review.
pub mod audit;

/// CSV plumbing for the binary, kept in the library so the integration
/// tests can drive the full service the same way.
pub mod bin_utils;

/// Escrow contract lifecycle. State is modified using events, which are
/// created by handling commands.
pub mod contract;

/// Orchestrates contracts against wallets: offers place holds, completion
/// captures them, rejection and cancellation give them back.
pub mod engine;

/// Append-only double-entry style log of wallet movements, and the
/// queries over it.
pub mod ledger;

/// Minor-unit amounts and ISO 4217 currency codes.
pub mod money;

/// Wallet storage interface, plus "in memory" implementation.
///
/// NOTE: Technically this interface is not necessary, but it is the
/// integration point to replace the in memory implementation with
/// something more sophisticated.
pub mod store;

/// All logic related to a single wallet's balance management.
/// State is modified using events, which are created by handling commands.
pub mod wallet;
