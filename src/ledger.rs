//! Purchase ledger: the idempotent record of completed purchases.
//!
//! "At most one purchase per on-chain transaction" is enforced by the
//! storage uniqueness constraint on `transaction_reference`, not by a
//! read-then-write. A losing concurrent insert is reported as
//! [`RecordOutcome::AlreadyRecorded`] and callers treat it as success.

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::constants::{ALLOCATION_SCALE, REFERRAL_CODE_LENGTH, TOKEN_PRICE_USD};
use crate::error::{Result, SettlementError};
use crate::models::{Chain, Purchase, PurchaseStatus, User};
use crate::store::{PurchaseStore, StoreError, UserStore};

/// Fields of a purchase before it gets an identity and a timestamp.
#[derive(Debug, Clone)]
pub struct PurchaseDraft {
    pub user_id: Uuid,
    pub chain: Chain,
    pub payment_amount: Decimal,
    pub payment_currency: String,
    pub allocated_tokens: Decimal,
    pub price_per_token_usd: Decimal,
    pub transaction_reference: String,
}

#[derive(Debug, Clone)]
pub enum RecordOutcome {
    /// This call created the purchase.
    Recorded(Purchase),
    /// The reference was already settled; carries the existing purchase.
    AlreadyRecorded(Purchase),
}

impl RecordOutcome {
    pub fn purchase(&self) -> &Purchase {
        match self {
            RecordOutcome::Recorded(p) | RecordOutcome::AlreadyRecorded(p) => p,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, RecordOutcome::Recorded(_))
    }
}

#[derive(Clone)]
pub struct PurchaseLedger {
    purchases: Arc<dyn PurchaseStore>,
    users: Arc<dyn UserStore>,
}

impl PurchaseLedger {
    pub fn new(purchases: Arc<dyn PurchaseStore>, users: Arc<dyn UserStore>) -> Self {
        Self { purchases, users }
    }

    /// Token allocation for a USD purchase value at the fixed sale price.
    pub fn allocation_for_usd(usd_value: Decimal) -> Decimal {
        (usd_value / TOKEN_PRICE_USD).round_dp(ALLOCATION_SCALE)
    }

    /// Idempotent insert keyed by `transaction_reference`. Exactly one of N
    /// concurrent calls for the same reference wins; the rest observe the
    /// winner's row.
    pub async fn record_purchase(&self, draft: PurchaseDraft) -> Result<RecordOutcome> {
        let purchase = Purchase {
            id: Uuid::new_v4(),
            user_id: draft.user_id,
            chain: draft.chain,
            payment_amount: draft.payment_amount,
            payment_currency: draft.payment_currency,
            allocated_tokens: draft.allocated_tokens,
            price_per_token_usd: draft.price_per_token_usd,
            transaction_reference: draft.transaction_reference,
            status: PurchaseStatus::Completed,
            has_referral_bonus: false,
            created_at: Utc::now(),
        };

        match self.purchases.insert_purchase(&purchase).await {
            Ok(()) => {
                tracing::info!(
                    purchase_id = %purchase.id,
                    chain = %purchase.chain,
                    reference = %purchase.transaction_reference,
                    tokens = %purchase.allocated_tokens,
                    "purchase recorded"
                );
                Ok(RecordOutcome::Recorded(purchase))
            }
            Err(StoreError::Duplicate(_)) => {
                let existing = self
                    .purchases
                    .purchase_by_reference(&purchase.transaction_reference)
                    .await?
                    .ok_or_else(|| {
                        SettlementError::AlreadyRecorded(purchase.transaction_reference.clone())
                    })?;
                tracing::info!(
                    purchase_id = %existing.id,
                    reference = %existing.transaction_reference,
                    "transaction already settled, treating as no-op"
                );
                Ok(RecordOutcome::AlreadyRecorded(existing))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Looks up the user owning `wallet_address` on `chain`, provisioning
    /// one lazily on first purchase. Two concurrent first-purchases from the
    /// same wallet race at the uniqueness constraint; the loser re-reads.
    pub async fn find_or_create_user_for_wallet(
        &self,
        wallet_address: &str,
        chain: Chain,
    ) -> Result<User> {
        // Bounded: each iteration either returns or hit a uniqueness race.
        for _ in 0..4 {
            if let Some(user) = self.users.user_by_wallet(wallet_address, chain).await? {
                return Ok(user);
            }

            let user = User {
                id: Uuid::new_v4(),
                bsc_address: (chain == Chain::Bsc).then(|| wallet_address.to_string()),
                solana_address: (chain == Chain::Solana).then(|| wallet_address.to_string()),
                referral_code: generate_referral_code(),
                referrer_id: None,
                created_at: Utc::now(),
            };
            match self.users.insert_user(&user).await {
                Ok(()) => {
                    tracing::info!(user_id = %user.id, chain = %chain, "provisioned user for wallet");
                    return Ok(user);
                }
                // Wallet race or code collision: loop back to the lookup.
                Err(StoreError::Duplicate(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(SettlementError::Store(StoreError::Backend(
            "user provisioning kept colliding".to_string(),
        )))
    }

    /// Links `user_id` to the owner of `code`, once. Returns true when the
    /// referrer was newly set. Self-referrals and re-links are no-ops.
    pub async fn link_referrer(&self, user_id: Uuid, code: &str) -> Result<bool> {
        let Some(referrer) = self.users.user_by_referral_code(code).await? else {
            tracing::debug!(code, "referral code does not resolve, ignoring");
            return Ok(false);
        };
        if referrer.id == user_id {
            return Ok(false);
        }
        Ok(self.users.set_referrer_if_unset(user_id, referrer.id).await?)
    }

    pub async fn purchase_by_reference(&self, reference: &str) -> Result<Option<Purchase>> {
        Ok(self.purchases.purchase_by_reference(reference).await?)
    }

    pub async fn purchase_by_id(&self, id: Uuid) -> Result<Option<Purchase>> {
        Ok(self.purchases.purchase_by_id(id).await?)
    }

    pub async fn user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.users.user_by_id(id).await?)
    }
}

fn generate_referral_code() -> String {
    let mut rng = rand::thread_rng();
    (0..REFERRAL_CODE_LENGTH)
        .map(|_| {
            // Unambiguous uppercase alphanumerics.
            const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
            ALPHABET[rng.gen_range(0..ALPHABET.len())] as char
        })
        .collect()
}
