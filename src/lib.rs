//! # Presale settlement core
//!
//! Accepts payments on two independent chains (BSC and Solana) and credits
//! purchasers with a fixed-price token allocation, plus an optional two-tier
//! referral bonus paid out on Solana.
//!
//! ## Settlement flow
//!
//! 1. **Verify**: the chain-matching [`chain::ChainVerifier`] confirms the
//!    claimed payment really happened, reached the collection destination,
//!    and succeeded at the chain level. Not-yet-indexed transactions are
//!    re-polled with a bounded budget.
//! 2. **Record**: [`ledger::PurchaseLedger`] inserts the purchase behind a
//!    uniqueness constraint on the transaction reference; a losing duplicate
//!    insert is success-with-no-op, which makes the whole flow retryable
//!    from any point.
//! 3. **Payout**: [`referral::ReferralEngine`] computes the 10% / 1% split
//!    and disburses it in the background. `has_referral_bonus` flips before
//!    the send, so retries can never double-pay.
//!
//! [`tracker::TransactionStatusTracker`] exposes each stage to the client;
//! [`orchestrator::SettlementOrchestrator`] wires the stages together.

pub mod api;
pub mod chain;
pub mod config;
pub mod constants;
pub mod error;
pub mod ledger;
pub mod models;
pub mod oracle;
pub mod orchestrator;
pub mod referral;
pub mod store;
pub mod tracker;
pub mod wallet;

pub use error::{Result, SettlementError, VerifyError};
