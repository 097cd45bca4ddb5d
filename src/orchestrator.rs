//! End-to-end settlement: verify the claimed payment, record the purchase
//! idempotently, then hand the referral payout to the background queue.
//!
//! Failure at any step marks that step on the tracker and halts. Nothing is
//! rolled back: verification and recording are idempotent, so the whole flow
//! is safe to retry from the top.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::chain::{verify_with_retry, ChainVerifier};
use crate::error::{Result, SettlementError, VerifyError};
use crate::ledger::{PurchaseDraft, PurchaseLedger};
use crate::models::{Chain, Purchase, User, VerifiedTransfer};
use crate::oracle::PriceOracle;
use crate::referral::DisbursementQueue;
use crate::tracker::{steps, TransactionStatusTracker};

#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub chain: Chain,
    pub transaction_reference: String,
    /// Known purchaser, when the caller is authenticated. Otherwise the
    /// owner of the verified sender wallet is provisioned lazily.
    pub user_id: Option<Uuid>,
    /// Sender the caller claims to be; mismatch is a permanent rejection.
    pub expected_sender: Option<String>,
    pub declared: Option<DeclaredPurchase>,
    pub referral_code: Option<String>,
    /// Wall-clock bound on the verification retry loop.
    pub deadline: Option<Instant>,
}

/// Client-declared purchase parameters, cross-checked against what the
/// chain actually shows.
#[derive(Debug, Clone)]
pub struct DeclaredPurchase {
    pub payment_amount: Decimal,
    pub allocated_tokens: Decimal,
}

#[derive(Debug, Clone)]
pub struct SettlementOutcome {
    pub purchase: Purchase,
    /// Absent when the reference was already settled and no fresh
    /// verification ran.
    pub transfer: Option<VerifiedTransfer>,
    pub already_recorded: bool,
    pub referral_linked: bool,
    /// A payout task was queued for this purchase.
    pub referral_bonus_pending: bool,
}

pub struct SettlementOrchestrator {
    verifiers: HashMap<Chain, Arc<dyn ChainVerifier>>,
    ledger: PurchaseLedger,
    oracle: Arc<PriceOracle>,
    queue: DisbursementQueue,
}

impl SettlementOrchestrator {
    pub fn new(
        verifiers: Vec<Arc<dyn ChainVerifier>>,
        ledger: PurchaseLedger,
        oracle: Arc<PriceOracle>,
        queue: DisbursementQueue,
    ) -> Self {
        let verifiers = verifiers.into_iter().map(|v| (v.chain(), v)).collect();
        Self { verifiers, ledger, oracle, queue }
    }

    /// One purchase attempt. The tracker is caller-owned so an in-flight
    /// attempt can be observed while this runs.
    pub async fn settle(
        &self,
        request: SettlementRequest,
        tracker: &mut TransactionStatusTracker,
    ) -> Result<SettlementOutcome> {
        // Holding a reference means the wallet already signed and sent.
        tracker.advance_to(steps::SEND_TRANSACTION)?;
        tracker.advance_to(steps::VERIFY_TRANSACTION)?;

        // Already settled: report the recorded purchase, do not re-verify.
        if let Some(existing) = self
            .ledger
            .purchase_by_reference(&request.transaction_reference)
            .await?
        {
            tracker.complete()?;
            return Ok(SettlementOutcome {
                referral_bonus_pending: false,
                referral_linked: false,
                already_recorded: true,
                transfer: None,
                purchase: existing,
            });
        }

        let verifier = self
            .verifiers
            .get(&request.chain)
            .ok_or_else(|| {
                SettlementError::Config(format!("no verifier for chain {}", request.chain))
            })?
            .clone();

        let transfer = match verify_with_retry(
            verifier.as_ref(),
            &request.transaction_reference,
            request.deadline,
        )
        .await
        {
            Ok(transfer) => transfer,
            Err(err) => {
                tracker.fail(steps::VERIFY_TRANSACTION, err.to_string())?;
                return Err(err.into());
            }
        };

        if let Some(expected) = &request.expected_sender {
            if !same_address(expected, &transfer.sender) {
                let err = VerifyError::SenderMismatch {
                    expected: expected.clone(),
                    actual: transfer.sender.clone(),
                };
                tracker.fail(steps::VERIFY_TRANSACTION, err.to_string())?;
                return Err(err.into());
            }
        }

        let user = self.resolve_user(&request, &transfer).await?;
        let referral_linked = match &request.referral_code {
            Some(code) => self.ledger.link_referrer(user.id, code).await?,
            None => false,
        };

        tracker.advance_to(steps::RECORD_PURCHASE)?;

        let draft = self.draft_from_transfer(&request, &transfer, &user).await;
        let outcome = match self.ledger.record_purchase(draft).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracker.fail(steps::RECORD_PURCHASE, err.to_string())?;
                return Err(err);
            }
        };

        // Payout is a queued side effect; the purchase response never waits
        // on it and never fails because of it.
        let has_referrer = referral_linked || user.referrer_id.is_some();
        let referral_bonus_pending =
            outcome.is_new() && has_referrer && self.queue.enqueue(outcome.purchase().id);

        tracker.complete()?;
        Ok(SettlementOutcome {
            purchase: outcome.purchase().clone(),
            already_recorded: !outcome.is_new(),
            transfer: Some(transfer),
            referral_linked,
            referral_bonus_pending,
        })
    }

    async fn resolve_user(
        &self,
        request: &SettlementRequest,
        transfer: &VerifiedTransfer,
    ) -> Result<User> {
        if let Some(user_id) = request.user_id {
            if let Some(user) = self.ledger.user_by_id(user_id).await? {
                return Ok(user);
            }
        }
        self.ledger
            .find_or_create_user_for_wallet(&transfer.sender, request.chain)
            .await
    }

    /// The chain-verified amount is authoritative; declared parameters are
    /// only cross-checked.
    async fn draft_from_transfer(
        &self,
        request: &SettlementRequest,
        transfer: &VerifiedTransfer,
        user: &User,
    ) -> PurchaseDraft {
        let quote = self.oracle.usd_price(request.chain).await;
        if quote.stale {
            tracing::warn!(chain = %request.chain, "pricing purchase against a stale quote");
        }
        let usd_value = transfer.amount * quote.price;
        let allocated_tokens = PurchaseLedger::allocation_for_usd(usd_value);

        if let Some(declared) = &request.declared {
            if declared.payment_amount != transfer.amount {
                tracing::warn!(
                    reference = %request.transaction_reference,
                    declared = %declared.payment_amount,
                    verified = %transfer.amount,
                    "declared payment amount differs from chain, using chain value"
                );
            }
            if declared.allocated_tokens != allocated_tokens {
                tracing::warn!(
                    reference = %request.transaction_reference,
                    declared = %declared.allocated_tokens,
                    computed = %allocated_tokens,
                    "declared allocation differs from computed, using computed value"
                );
            }
        }

        PurchaseDraft {
            user_id: user.id,
            chain: request.chain,
            payment_amount: transfer.amount,
            payment_currency: request.chain.native_currency().to_string(),
            allocated_tokens,
            price_per_token_usd: crate::constants::TOKEN_PRICE_USD,
            transaction_reference: request.transaction_reference.clone(),
        }
    }
}

/// EVM addresses compare case-insensitively; base58 is case-sensitive.
fn same_address(a: &str, b: &str) -> bool {
    if a.starts_with("0x") || b.starts_with("0x") {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}
