//! Two-tier referral engine.
//!
//! Bonus *value* is fixed in USD at disbursement time; the *quantity* sent
//! on chain floats with the oracle price (native payout) or is pegged 1:1
//! (stablecoin payout). `Purchase.has_referral_bonus` is compare-and-set
//! before the on-chain send, so a retry can never double-pay. The accepted
//! tradeoff: a crash between the flag flip and the send leaves a flag with
//! no transfer; that case is persisted as a `Failed` bonus row and raised
//! through an error-level log, never retried blindly.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::constants::{LAMPORTS_PER_SOL, REFERRAL_BONUS_RATE, SECOND_TIER_RATE};
use crate::error::{Result, SettlementError};
use crate::models::{BonusStatus, Chain, Purchase, ReferralBonus};
use crate::oracle::PriceOracle;
use crate::store::{PurchaseStore, UserStore};
use crate::wallet::DisbursementWallet;

// =====================================================
// BONUS MATH
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BonusSplit {
    /// First tier + second tier, in USD.
    pub total_usd: Decimal,
    pub referrer_usd: Decimal,
    pub second_tier_usd: Decimal,
}

/// Splits the bonus for a purchase of `purchase_usd_value`: 10% total, of
/// which the second tier takes 10% and the referrer keeps the remainder.
pub fn compute_bonus(purchase_usd_value: Decimal) -> BonusSplit {
    let total_usd = purchase_usd_value * REFERRAL_BONUS_RATE;
    let second_tier_usd = total_usd * SECOND_TIER_RATE;
    BonusSplit {
        total_usd,
        referrer_usd: total_usd - second_tier_usd,
        second_tier_usd,
    }
}

// =====================================================
// DISBURSEMENT
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoReferrer,
    NoPayoutWallet,
    AlreadyProcessed,
}

#[derive(Debug, Clone)]
pub enum DisburseOutcome {
    /// Bonus sent and recorded.
    Disbursed(ReferralBonus),
    /// Nothing to do; not an error and never retried.
    Skipped(SkipReason),
    /// Send failed after the flag was set; recorded for reconciliation.
    Failed(ReferralBonus),
}

#[derive(Debug, Clone)]
pub struct PayoutConfig {
    /// Fixed second-tier destination wallet.
    pub second_tier_address: String,
    /// Pegged payout mint; native SOL when `None`.
    pub token_mint: Option<String>,
    pub token_decimals: u32,
}

pub struct ReferralEngine {
    purchases: Arc<dyn PurchaseStore>,
    users: Arc<dyn UserStore>,
    oracle: Arc<PriceOracle>,
    wallet: Arc<dyn DisbursementWallet>,
    payout: PayoutConfig,
}

impl ReferralEngine {
    pub fn new(
        purchases: Arc<dyn PurchaseStore>,
        users: Arc<dyn UserStore>,
        oracle: Arc<PriceOracle>,
        wallet: Arc<dyn DisbursementWallet>,
        payout: PayoutConfig,
    ) -> Self {
        Self { purchases, users, oracle, wallet, payout }
    }

    pub async fn disburse_by_id(&self, purchase_id: Uuid) -> Result<DisburseOutcome> {
        let purchase = self
            .purchases
            .purchase_by_id(purchase_id)
            .await?
            .ok_or(SettlementError::PurchaseNotFound(purchase_id))?;
        self.disburse(&purchase).await
    }

    /// Best-effort side effect of purchase recording: failures here never
    /// reject or roll back the purchase itself.
    pub async fn disburse(&self, purchase: &Purchase) -> Result<DisburseOutcome> {
        if purchase.has_referral_bonus {
            return Ok(DisburseOutcome::Skipped(SkipReason::AlreadyProcessed));
        }

        let Some(buyer) = self.users.user_by_id(purchase.user_id).await? else {
            tracing::warn!(purchase_id = %purchase.id, "purchase has no owning user");
            return Ok(DisburseOutcome::Skipped(SkipReason::NoReferrer));
        };
        let Some(referrer_id) = buyer.referrer_id else {
            return Ok(DisburseOutcome::Skipped(SkipReason::NoReferrer));
        };
        let Some(referrer) = self.users.user_by_id(referrer_id).await? else {
            tracing::warn!(purchase_id = %purchase.id, %referrer_id, "referrer record missing");
            return Ok(DisburseOutcome::Skipped(SkipReason::NoReferrer));
        };
        let Some(payout_address) = referrer.solana_address.clone() else {
            tracing::info!(
                purchase_id = %purchase.id,
                referrer_id = %referrer.id,
                "referrer has no payout-capable wallet, skipping bonus"
            );
            return Ok(DisburseOutcome::Skipped(SkipReason::NoPayoutWallet));
        };

        // The one-way gate. Losing this CAS means another attempt (or a past
        // one) owns the payout.
        if !self.purchases.mark_referral_attempted(purchase.id).await? {
            return Ok(DisburseOutcome::Skipped(SkipReason::AlreadyProcessed));
        }

        let split = compute_bonus(purchase.usd_value());
        let bonus = ReferralBonus {
            id: Uuid::new_v4(),
            referrer_id: referrer.id,
            purchase_id: purchase.id,
            bonus_amount: split.total_usd,
            bonus_percentage: REFERRAL_BONUS_RATE * dec!(100),
            status: BonusStatus::Processed,
            created_at: Utc::now(),
        };

        match self.send_split(&payout_address, &split).await {
            Ok((referrer_sig, second_tier_sig)) => {
                self.purchases.insert_bonus(&bonus).await?;
                tracing::info!(
                    purchase_id = %purchase.id,
                    referrer_id = %referrer.id,
                    bonus_usd = %split.total_usd,
                    referrer_sig,
                    second_tier_sig,
                    "referral bonus disbursed"
                );
                Ok(DisburseOutcome::Disbursed(bonus))
            }
            Err(err) => {
                let failed = ReferralBonus { status: BonusStatus::Failed, ..bonus };
                self.purchases.insert_bonus(&failed).await?;
                // Operational alert: flag is set, transfer did not complete.
                // Requires manual reconciliation, never an automatic retry.
                tracing::error!(
                    purchase_id = %purchase.id,
                    referrer_id = %referrer.id,
                    bonus_usd = %split.total_usd,
                    error = %err,
                    "referral bonus send failed after flag was set"
                );
                Ok(DisburseOutcome::Failed(failed))
            }
        }
    }

    /// Sends both tiers, converting USD to on-chain units at current prices.
    async fn send_split(
        &self,
        referrer_address: &str,
        split: &BonusSplit,
    ) -> Result<(String, String)> {
        match &self.payout.token_mint {
            Some(mint) => {
                // Pegged payout token: $1.00 per whole token.
                let referrer_units = to_base_units(split.referrer_usd, self.payout.token_decimals)?;
                let second_units = to_base_units(split.second_tier_usd, self.payout.token_decimals)?;
                let a = self
                    .wallet
                    .send_token(referrer_address, mint, referrer_units)
                    .await
                    .map_err(|e| SettlementError::Disbursement(e.to_string()))?;
                let b = self
                    .wallet
                    .send_token(&self.payout.second_tier_address, mint, second_units)
                    .await
                    .map_err(|e| SettlementError::Disbursement(e.to_string()))?;
                Ok((a, b))
            }
            None => {
                let quote = self.oracle.usd_price(Chain::Solana).await;
                if quote.stale {
                    tracing::warn!(price = %quote.price, "disbursing against a stale SOL price");
                }
                let lamports_per_usd = Decimal::from(LAMPORTS_PER_SOL) / quote.price;
                let referrer_lamports = decimal_to_u64(split.referrer_usd * lamports_per_usd)?;
                let second_lamports = decimal_to_u64(split.second_tier_usd * lamports_per_usd)?;
                let a = self
                    .wallet
                    .send_sol(referrer_address, referrer_lamports)
                    .await
                    .map_err(|e| SettlementError::Disbursement(e.to_string()))?;
                let b = self
                    .wallet
                    .send_sol(&self.payout.second_tier_address, second_lamports)
                    .await
                    .map_err(|e| SettlementError::Disbursement(e.to_string()))?;
                Ok((a, b))
            }
        }
    }
}

fn to_base_units(usd: Decimal, decimals: u32) -> Result<u64> {
    decimal_to_u64(usd * Decimal::from(10u64.pow(decimals)))
}

fn decimal_to_u64(value: Decimal) -> Result<u64> {
    value
        .trunc()
        .to_u64()
        .ok_or_else(|| SettlementError::Disbursement(format!("amount out of range: {value}")))
}

// =====================================================
// BACKGROUND WORKER
// =====================================================

/// Queue decoupling disbursement from the purchase response. The purchase
/// API never blocks on a payout; outcomes surface through logs and the
/// persisted bonus rows (failed rows are the dead letters).
#[derive(Clone)]
pub struct DisbursementQueue {
    tx: mpsc::UnboundedSender<Uuid>,
}

impl DisbursementQueue {
    pub fn spawn(engine: Arc<ReferralEngine>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Uuid>();
        tokio::spawn(async move {
            while let Some(purchase_id) = rx.recv().await {
                match engine.disburse_by_id(purchase_id).await {
                    Ok(DisburseOutcome::Disbursed(bonus)) => {
                        tracing::debug!(%purchase_id, bonus_id = %bonus.id, "payout task done");
                    }
                    Ok(DisburseOutcome::Skipped(reason)) => {
                        tracing::debug!(%purchase_id, ?reason, "payout task skipped");
                    }
                    Ok(DisburseOutcome::Failed(bonus)) => {
                        tracing::warn!(%purchase_id, bonus_id = %bonus.id, "payout task failed, dead-lettered");
                    }
                    Err(err) => {
                        tracing::error!(%purchase_id, error = %err, "payout task errored");
                    }
                }
            }
        });
        Self { tx }
    }

    /// Returns false when the worker has shut down.
    pub fn enqueue(&self, purchase_id: Uuid) -> bool {
        self.tx.send(purchase_id).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TOKEN_PRICE_USD;
    use crate::ledger::{PurchaseDraft, PurchaseLedger};
    use crate::oracle::{PriceFeed, PriceOracle};
    use crate::store::MemoryStore;
    use crate::wallet::WalletError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FixedFeed;

    #[async_trait]
    impl PriceFeed for FixedFeed {
        async fn fetch_usd_price(&self, _chain: Chain) -> std::result::Result<Decimal, String> {
            Ok(dec!(100))
        }
    }

    #[derive(Default)]
    struct MockWallet {
        fail: AtomicBool,
        sends: AtomicU32,
        sent: Mutex<Vec<(String, u64)>>,
    }

    #[async_trait]
    impl DisbursementWallet for MockWallet {
        async fn send_sol(&self, to: &str, lamports: u64) -> std::result::Result<String, WalletError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(WalletError::Rpc("node unreachable".to_string()));
            }
            self.sends.fetch_add(1, Ordering::SeqCst);
            self.sent.lock().unwrap().push((to.to_string(), lamports));
            Ok(format!("sig-{to}"))
        }

        async fn send_token(
            &self,
            to: &str,
            _mint: &str,
            amount: u64,
        ) -> std::result::Result<String, WalletError> {
            self.send_sol(to, amount).await
        }
    }

    struct Fixture {
        engine: ReferralEngine,
        ledger: PurchaseLedger,
        store: Arc<MemoryStore>,
        wallet: Arc<MockWallet>,
    }

    fn fixture(token_mint: Option<String>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let wallet = Arc::new(MockWallet::default());
        let engine = ReferralEngine::new(
            store.clone(),
            store.clone(),
            Arc::new(PriceOracle::new(Arc::new(FixedFeed))),
            wallet.clone(),
            PayoutConfig {
                second_tier_address: "2ndTierWallet".to_string(),
                token_mint,
                token_decimals: 6,
            },
        );
        let ledger = PurchaseLedger::new(store.clone(), store.clone());
        Fixture { engine, ledger, store, wallet }
    }

    /// $50 purchase with a referrer on record; returns the purchase.
    async fn settled_purchase(f: &Fixture, with_referrer: bool) -> Purchase {
        let referrer = f
            .ledger
            .find_or_create_user_for_wallet("RefWallet111", Chain::Solana)
            .await
            .unwrap();
        let buyer = f
            .ledger
            .find_or_create_user_for_wallet("BuyerWallet1", Chain::Solana)
            .await
            .unwrap();
        if with_referrer {
            f.ledger.link_referrer(buyer.id, &referrer.referral_code).await.unwrap();
        }
        let outcome = f
            .ledger
            .record_purchase(PurchaseDraft {
                user_id: buyer.id,
                chain: Chain::Solana,
                payment_amount: dec!(0.5),
                payment_currency: "SOL".to_string(),
                allocated_tokens: PurchaseLedger::allocation_for_usd(dec!(50)),
                price_per_token_usd: TOKEN_PRICE_USD,
                transaction_reference: "sig-bonus".to_string(),
            })
            .await
            .unwrap();
        outcome.purchase().clone()
    }

    #[test]
    fn bonus_split_adds_up() {
        let split = compute_bonus(dec!(50));
        assert_eq!(split.total_usd, dec!(5.00));
        assert_eq!(split.second_tier_usd, dec!(0.500));
        assert_eq!(split.referrer_usd, dec!(4.500));
        assert_eq!(split.referrer_usd + split.second_tier_usd, dec!(5.000));
    }

    #[test]
    fn second_tier_is_one_percent_of_purchase() {
        let split = compute_bonus(dec!(1234));
        assert_eq!(split.second_tier_usd, dec!(1234) * dec!(0.01));
    }

    #[tokio::test]
    async fn disburses_both_tiers_in_pegged_token_units() {
        let f = fixture(Some("USDTmint1111".to_string()));
        let purchase = settled_purchase(&f, true).await;

        let outcome = f.engine.disburse(&purchase).await.unwrap();
        assert!(matches!(outcome, DisburseOutcome::Disbursed(_)));

        let sent = f.wallet.sent.lock().unwrap().clone();
        // $4.50 and $0.50 at 6 decimals. Allocation rounding shifts the
        // split by well under one base unit.
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "RefWallet111");
        assert!((sent[0].1 as i64 - 4_500_000).abs() <= 1);
        assert_eq!(sent[1].0, "2ndTierWallet");
        assert!((sent[1].1 as i64 - 500_000).abs() <= 1);

        let bonuses = f.store.bonuses();
        assert_eq!(bonuses.len(), 1);
        assert_eq!(bonuses[0].status, BonusStatus::Processed);
    }

    #[tokio::test]
    async fn native_payout_quantity_floats_with_the_oracle_price() {
        let f = fixture(None);
        let purchase = settled_purchase(&f, true).await;

        f.engine.disburse(&purchase).await.unwrap();
        let sent = f.wallet.sent.lock().unwrap().clone();
        // $4.50 at $100/SOL = 0.045 SOL.
        assert!((sent[0].1 as i64 - 45_000_000).abs() <= 1);
    }

    #[tokio::test]
    async fn skips_purchase_without_referrer() {
        let f = fixture(None);
        let purchase = settled_purchase(&f, false).await;
        let outcome = f.engine.disburse(&purchase).await.unwrap();
        assert!(matches!(outcome, DisburseOutcome::Skipped(SkipReason::NoReferrer)));
        assert_eq!(f.wallet.sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_disbursement_is_a_no_op() {
        let f = fixture(None);
        let purchase = settled_purchase(&f, true).await;

        f.engine.disburse(&purchase).await.unwrap();
        let again = f.engine.disburse_by_id(purchase.id).await.unwrap();
        assert!(matches!(again, DisburseOutcome::Skipped(SkipReason::AlreadyProcessed)));
        assert_eq!(f.store.bonuses().len(), 1);
        assert_eq!(f.wallet.sends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_disbursements_pay_at_most_once() {
        let f = fixture(None);
        let purchase = settled_purchase(&f, true).await;
        let engine = Arc::new(f.engine);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = engine.clone();
            let id = purchase.id;
            handles.push(tokio::spawn(async move { engine.disburse_by_id(id).await }));
        }
        let mut disbursed = 0;
        for handle in handles {
            if matches!(handle.await.unwrap().unwrap(), DisburseOutcome::Disbursed(_)) {
                disbursed += 1;
            }
        }
        assert_eq!(disbursed, 1);
        assert_eq!(f.store.bonuses().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_records_a_failed_bonus_and_keeps_the_flag() {
        let f = fixture(None);
        let purchase = settled_purchase(&f, true).await;
        f.wallet.fail.store(true, Ordering::SeqCst);

        let outcome = f.engine.disburse(&purchase).await.unwrap();
        assert!(matches!(outcome, DisburseOutcome::Failed(_)));

        let bonuses = f.store.bonuses();
        assert_eq!(bonuses.len(), 1);
        assert_eq!(bonuses[0].status, BonusStatus::Failed);

        // Flag stays set: no blind retry, no double payment.
        f.wallet.fail.store(false, Ordering::SeqCst);
        let retry = f.engine.disburse_by_id(purchase.id).await.unwrap();
        assert!(matches!(retry, DisburseOutcome::Skipped(SkipReason::AlreadyProcessed)));
        assert_eq!(f.wallet.sends.load(Ordering::SeqCst), 0);
    }
}
