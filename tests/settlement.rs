//! End-to-end settlement flows over the in-memory store with mock chain
//! collaborators.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use presale_settlement::chain::{ChainVerifier, RetryPolicy};
use presale_settlement::constants::TOKEN_PRICE_USD;
use presale_settlement::error::{SettlementError, VerifyError};
use presale_settlement::ledger::PurchaseLedger;
use presale_settlement::models::{BonusStatus, Chain, VerifiedTransfer};
use presale_settlement::oracle::{PriceFeed, PriceOracle};
use presale_settlement::orchestrator::{
    DeclaredPurchase, SettlementOrchestrator, SettlementRequest,
};
use presale_settlement::referral::{DisbursementQueue, PayoutConfig, ReferralEngine};
use presale_settlement::store::MemoryStore;
use presale_settlement::tracker::{steps, TransactionStatusTracker};
use presale_settlement::wallet::{DisbursementWallet, WalletError};

const SENDER: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";
const COLLECTION: &str = "7UX2i7SucgLMQcfZ75s3VXmZZY4YRUyJN9X1RgfMoDUi";

// =====================================================
// MOCK COLLABORATORS
// =====================================================

#[derive(Clone)]
enum VerifierScript {
    /// Found and valid with this payment amount.
    Success(Decimal),
    /// Never indexed.
    NeverFound,
    /// Found but failed at the chain level.
    FailedOnChain,
    /// Found but sent to the wrong destination.
    WrongDestination,
}

struct MockVerifier {
    script: VerifierScript,
    attempts: AtomicU32,
}

impl MockVerifier {
    fn new(script: VerifierScript) -> Arc<Self> {
        Arc::new(Self { script, attempts: AtomicU32::new(0) })
    }
}

#[async_trait]
impl ChainVerifier for MockVerifier {
    fn chain(&self) -> Chain {
        Chain::Solana
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy { max_attempts: 5, interval: Duration::from_millis(2) }
    }

    async fn verify_transfer(&self, reference: &str) -> Result<VerifiedTransfer, VerifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            VerifierScript::Success(amount) => Ok(VerifiedTransfer {
                sender: SENDER.to_string(),
                destination: COLLECTION.to_string(),
                amount: *amount,
                succeeded: true,
                block_reference: Some("252004831".to_string()),
            }),
            VerifierScript::NeverFound => Err(VerifyError::NotFound(reference.to_string())),
            VerifierScript::FailedOnChain => {
                Err(VerifyError::TransactionFailed("instruction error".to_string()))
            }
            VerifierScript::WrongDestination => Err(VerifyError::WrongDestination {
                expected: COLLECTION.to_string(),
                actual: "SomeOtherWallet".to_string(),
            }),
        }
    }
}

struct FixedFeed;

#[async_trait]
impl PriceFeed for FixedFeed {
    async fn fetch_usd_price(&self, _chain: Chain) -> Result<Decimal, String> {
        Ok(dec!(100))
    }
}

#[derive(Default)]
struct CountingWallet {
    sends: AtomicU32,
}

#[async_trait]
impl DisbursementWallet for CountingWallet {
    async fn send_sol(&self, to: &str, _lamports: u64) -> Result<String, WalletError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(format!("sig-{to}"))
    }

    async fn send_token(&self, to: &str, _mint: &str, _amount: u64) -> Result<String, WalletError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        Ok(format!("sig-{to}"))
    }
}

struct Harness {
    orchestrator: Arc<SettlementOrchestrator>,
    ledger: PurchaseLedger,
    store: Arc<MemoryStore>,
    wallet: Arc<CountingWallet>,
}

fn harness(script: VerifierScript) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let ledger = PurchaseLedger::new(store.clone(), store.clone());
    let oracle = Arc::new(PriceOracle::new(Arc::new(FixedFeed)));
    let wallet = Arc::new(CountingWallet::default());
    let engine = Arc::new(ReferralEngine::new(
        store.clone(),
        store.clone(),
        oracle.clone(),
        wallet.clone(),
        PayoutConfig {
            second_tier_address: "2ndTierWallet".to_string(),
            token_mint: None,
            token_decimals: 6,
        },
    ));
    let queue = DisbursementQueue::spawn(engine);
    let orchestrator = Arc::new(SettlementOrchestrator::new(
        vec![MockVerifier::new(script)],
        ledger.clone(),
        oracle,
        queue,
    ));
    Harness { orchestrator, ledger, store, wallet }
}

fn request(reference: &str) -> SettlementRequest {
    SettlementRequest {
        chain: Chain::Solana,
        transaction_reference: reference.to_string(),
        user_id: None,
        expected_sender: None,
        declared: None,
        referral_code: None,
        deadline: None,
    }
}

// =====================================================
// SCENARIOS
// =====================================================

#[tokio::test]
async fn settles_a_verified_half_sol_purchase() {
    let h = harness(VerifierScript::Success(dec!(0.5)));
    let mut tracker = TransactionStatusTracker::purchase_flow(false);

    let outcome = h.orchestrator.settle(request("sig-ok"), &mut tracker).await.unwrap();

    // 0.5 SOL at $100 = $50 at $0.012/token.
    assert_eq!(outcome.purchase.allocated_tokens, dec!(4166.666667));
    assert_eq!(outcome.purchase.payment_amount, dec!(0.5));
    assert_eq!(outcome.purchase.price_per_token_usd, TOKEN_PRICE_USD);
    assert!(!outcome.already_recorded);
    assert!(!outcome.referral_bonus_pending);
    assert!(tracker.is_complete());

    // The sender's wallet got a user provisioned lazily.
    let user = h.ledger.user_by_id(outcome.purchase.user_id).await.unwrap().unwrap();
    assert_eq!(user.solana_address.as_deref(), Some(SENDER));
}

#[tokio::test]
async fn replayed_reference_settles_as_a_no_op() {
    let h = harness(VerifierScript::Success(dec!(0.5)));
    let mut first = TransactionStatusTracker::purchase_flow(false);
    let original = h.orchestrator.settle(request("sig-replay"), &mut first).await.unwrap();

    let mut second = TransactionStatusTracker::purchase_flow(false);
    let replay = h.orchestrator.settle(request("sig-replay"), &mut second).await.unwrap();

    assert!(replay.already_recorded);
    assert!(replay.transfer.is_none());
    assert_eq!(replay.purchase.id, original.purchase.id);
    assert!(second.is_complete());
    assert_eq!(h.store.purchase_count(), 1);
}

#[tokio::test]
async fn concurrent_submissions_of_one_reference_both_succeed_with_one_row() {
    let h = harness(VerifierScript::Success(dec!(0.5)));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let orchestrator = h.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            let mut tracker = TransactionStatusTracker::purchase_flow(false);
            orchestrator.settle(request("sig-race"), &mut tracker).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().expect("every concurrent submission settles");
    }
    assert_eq!(h.store.purchase_count(), 1);
}

#[tokio::test]
async fn never_indexed_transaction_terminates_with_not_found() {
    let h = harness(VerifierScript::NeverFound);
    let mut tracker = TransactionStatusTracker::purchase_flow(false);

    let err = h.orchestrator.settle(request("sig-ghost"), &mut tracker).await.unwrap_err();
    assert!(matches!(err, SettlementError::Verify(VerifyError::NotFound(_))));
    assert!(tracker.is_error());
    assert_eq!(tracker.current_step_id(), Some(steps::VERIFY_TRANSACTION));
    assert_eq!(h.store.purchase_count(), 0);
}

#[tokio::test]
async fn chain_level_failure_is_permanent_and_records_nothing() {
    let h = harness(VerifierScript::FailedOnChain);
    let mut tracker = TransactionStatusTracker::purchase_flow(false);

    let err = h.orchestrator.settle(request("sig-bad"), &mut tracker).await.unwrap_err();
    assert!(matches!(err, SettlementError::Verify(VerifyError::TransactionFailed(_))));
    assert_eq!(h.store.purchase_count(), 0);
}

#[tokio::test]
async fn wrong_destination_is_rejected_before_recording() {
    let h = harness(VerifierScript::WrongDestination);
    let mut tracker = TransactionStatusTracker::purchase_flow(false);

    let err = h.orchestrator.settle(request("sig-stray"), &mut tracker).await.unwrap_err();
    assert!(matches!(err, SettlementError::Verify(VerifyError::WrongDestination { .. })));
    assert_eq!(h.store.purchase_count(), 0);
}

#[tokio::test]
async fn sender_mismatch_is_rejected() {
    let h = harness(VerifierScript::Success(dec!(0.5)));
    let mut tracker = TransactionStatusTracker::purchase_flow(false);

    let mut req = request("sig-spoof");
    req.expected_sender = Some("SomeoneElse1111111111111111111111".to_string());
    let err = h.orchestrator.settle(req, &mut tracker).await.unwrap_err();
    assert!(matches!(err, SettlementError::Verify(VerifyError::SenderMismatch { .. })));
    assert_eq!(h.store.purchase_count(), 0);
}

#[tokio::test]
async fn declared_parameters_do_not_override_the_chain() {
    let h = harness(VerifierScript::Success(dec!(0.5)));
    let mut tracker = TransactionStatusTracker::purchase_flow(false);

    let mut req = request("sig-declared");
    // Client claims twice the tokens; the verified amount wins.
    req.declared = Some(DeclaredPurchase {
        payment_amount: dec!(1.0),
        allocated_tokens: dec!(8333.333334),
    });
    let outcome = h.orchestrator.settle(req, &mut tracker).await.unwrap();
    assert_eq!(outcome.purchase.allocated_tokens, dec!(4166.666667));
}

#[tokio::test]
async fn referred_purchase_queues_and_pays_the_bonus() {
    let h = harness(VerifierScript::Success(dec!(0.5)));

    let referrer = h
        .ledger
        .find_or_create_user_for_wallet("RefWallet111", Chain::Solana)
        .await
        .unwrap();

    let mut tracker = TransactionStatusTracker::purchase_flow(false);
    let mut req = request("sig-referred");
    req.referral_code = Some(referrer.referral_code.clone());
    let outcome = h.orchestrator.settle(req, &mut tracker).await.unwrap();

    assert!(outcome.referral_linked);
    assert!(outcome.referral_bonus_pending);

    // The payout runs on the background queue; wait for the bonus row.
    let mut bonuses = Vec::new();
    for _ in 0..50 {
        bonuses = h.store.bonuses();
        if !bonuses.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(bonuses.len(), 1);
    assert_eq!(bonuses[0].status, BonusStatus::Processed);
    assert_eq!(bonuses[0].referrer_id, referrer.id);
    // $50 purchase: $5 total bonus.
    assert_eq!(bonuses[0].bonus_amount.round_dp(2), dec!(5.00));
    // Two transfers: referrer tier and second tier.
    assert_eq!(h.wallet.sends.load(Ordering::SeqCst), 2);

    let purchase = h.ledger.purchase_by_id(outcome.purchase.id).await.unwrap().unwrap();
    assert!(purchase.has_referral_bonus);
}

#[tokio::test]
async fn unreferred_purchase_never_touches_the_wallet() {
    let h = harness(VerifierScript::Success(dec!(0.5)));
    let mut tracker = TransactionStatusTracker::purchase_flow(false);
    let outcome = h.orchestrator.settle(request("sig-plain"), &mut tracker).await.unwrap();

    assert!(!outcome.referral_bonus_pending);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(h.store.bonuses().is_empty());
    assert_eq!(h.wallet.sends.load(Ordering::SeqCst), 0);
}
