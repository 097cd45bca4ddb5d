//! HTTP surface: purchase settlement, standalone verification, and the
//! referral distribution endpoint. Errors carry a machine-readable `code`
//! and a human-readable `message`; verification failures add `details`.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::SettlementError;
use crate::ledger::PurchaseLedger;
use crate::models::Chain;
use crate::orchestrator::{DeclaredPurchase, SettlementOrchestrator, SettlementRequest};
use crate::referral::{DisburseOutcome, ReferralEngine, SkipReason};
use crate::tracker::TransactionStatusTracker;

/// Upper bound on how long a single API call may sit in the verification
/// retry loop.
const VERIFY_DEADLINE: Duration = Duration::from_secs(45);

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SettlementOrchestrator>,
    pub ledger: PurchaseLedger,
    pub engine: Arc<ReferralEngine>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/purchases", post(create_purchase))
        .route("/verify/:chain", post(verify_transaction))
        .route("/referrals/distribute-bonus", post(distribute_bonus))
        .with_state(state)
}

// =====================================================
// REQUEST BODIES
// =====================================================

/// The request to settle a purchase the client already paid on chain.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePurchaseRequest {
    pub user_id: Option<Uuid>,
    pub chain: Chain,
    pub payment_amount: Decimal,
    pub allocated_tokens: Decimal,
    pub transaction_reference: String,
    /// Wallet the caller claims sent the payment.
    pub wallet_address: Option<String>,
    pub referral_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub transaction_reference: Option<String>,
    /// BSC verification traditionally carries the hash under this name.
    pub tx_hash: Option<String>,
    pub wallet_address: Option<String>,
    pub referral_code: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributeBonusRequest {
    pub purchase_id: Uuid,
}

// =====================================================
// HANDLERS
// =====================================================

async fn create_purchase(
    State(state): State<AppState>,
    Json(request): Json<CreatePurchaseRequest>,
) -> Response {
    // The dedicated endpoint signals a replay explicitly instead of the
    // orchestrator's silent no-op.
    match state.ledger.purchase_by_reference(&request.transaction_reference).await {
        Ok(Some(existing)) => {
            return (
                StatusCode::CONFLICT,
                Json(json!({
                    "code": "already_recorded",
                    "message": "transaction reference already settled",
                    "purchase": existing,
                })),
            )
                .into_response();
        }
        Ok(None) => {}
        Err(err) => return error_response(&err),
    }

    let mut tracker = TransactionStatusTracker::purchase_flow(false);
    let settlement = SettlementRequest {
        chain: request.chain,
        transaction_reference: request.transaction_reference,
        user_id: request.user_id,
        expected_sender: request.wallet_address,
        declared: Some(DeclaredPurchase {
            payment_amount: request.payment_amount,
            allocated_tokens: request.allocated_tokens,
        }),
        referral_code: request.referral_code,
        deadline: Some(Instant::now() + VERIFY_DEADLINE),
    };

    match state.orchestrator.settle(settlement, &mut tracker).await {
        Ok(outcome) => {
            if outcome.already_recorded {
                return (
                    StatusCode::CONFLICT,
                    Json(json!({
                        "code": "already_recorded",
                        "message": "transaction reference already settled",
                        "purchase": outcome.purchase,
                    })),
                )
                    .into_response();
            }
            (
                StatusCode::OK,
                Json(json!({
                    "purchase": outcome.purchase,
                    "verified": true,
                    "referralUpdated": outcome.referral_linked,
                    "referralBonusPending": outcome.referral_bonus_pending,
                    "steps": tracker,
                })),
            )
                .into_response()
        }
        Err(err) => error_response_with_steps(&err, &tracker),
    }
}

async fn verify_transaction(
    State(state): State<AppState>,
    Path(chain): Path<String>,
    Json(request): Json<VerifyRequest>,
) -> Response {
    let Ok(chain) = Chain::from_str(&chain) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "code": "unknown_chain", "message": format!("unknown chain: {chain}") })),
        )
            .into_response();
    };
    let Some(reference) = request.tx_hash.or(request.transaction_reference) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "code": "missing_reference",
                "message": "transactionReference (or txHash) is required",
            })),
        )
            .into_response();
    };

    let mut tracker = TransactionStatusTracker::purchase_flow(false);
    let settlement = SettlementRequest {
        chain,
        transaction_reference: reference,
        user_id: None,
        expected_sender: request.wallet_address,
        declared: None,
        referral_code: request.referral_code,
        deadline: Some(Instant::now() + VERIFY_DEADLINE),
    };

    match state.orchestrator.settle(settlement, &mut tracker).await {
        Ok(outcome) => {
            let transaction = outcome.transfer.as_ref().map(|t| {
                json!({
                    "sender": t.sender,
                    "amount": t.amount,
                    "tokenAmount": outcome.purchase.allocated_tokens,
                    "blockReference": t.block_reference,
                })
            });
            (
                StatusCode::OK,
                Json(json!({
                    "verified": true,
                    "transaction": transaction,
                    "purchase": outcome.purchase,
                    "alreadyRecorded": outcome.already_recorded,
                })),
            )
                .into_response()
        }
        Err(err) => error_response(&err),
    }
}

async fn distribute_bonus(
    State(state): State<AppState>,
    Json(request): Json<DistributeBonusRequest>,
) -> Response {
    match state.engine.disburse_by_id(request.purchase_id).await {
        Ok(DisburseOutcome::Disbursed(bonus)) | Ok(DisburseOutcome::Failed(bonus)) => {
            let second_tier = bonus.bonus_amount * crate::constants::SECOND_TIER_RATE;
            (
                StatusCode::OK,
                Json(json!({
                    "bonus": bonus,
                    "breakdown": {
                        "totalUsd": bonus.bonus_amount,
                        "referrerUsd": bonus.bonus_amount - second_tier,
                        "secondTierUsd": second_tier,
                    },
                })),
            )
                .into_response()
        }
        Ok(DisburseOutcome::Skipped(reason)) => {
            let (code, message) = match reason {
                SkipReason::AlreadyProcessed => {
                    ("bonus_already_processed", "referral bonus already processed")
                }
                SkipReason::NoReferrer => ("no_referrer", "purchaser has no referrer"),
                SkipReason::NoPayoutWallet => {
                    ("no_payout_wallet", "referrer has no payout wallet on file")
                }
            };
            (StatusCode::BAD_REQUEST, Json(json!({ "code": code, "message": message })))
                .into_response()
        }
        Err(err) => error_response(&err),
    }
}

// =====================================================
// ERROR MAPPING
// =====================================================

fn status_and_body(err: &SettlementError) -> (StatusCode, serde_json::Value) {
    match err {
        SettlementError::Verify(verify) => (
            StatusCode::BAD_REQUEST,
            json!({
                "code": verify.code(),
                "message": "on-chain verification failed",
                "details": verify.to_string(),
            }),
        ),
        SettlementError::AlreadyRecorded(reference) => (
            StatusCode::CONFLICT,
            json!({ "code": "already_recorded", "message": err.to_string(), "reference": reference }),
        ),
        SettlementError::PurchaseNotFound(_) => {
            (StatusCode::NOT_FOUND, json!({ "code": "purchase_not_found", "message": err.to_string() }))
        }
        SettlementError::BonusAlreadyProcessed(_) => (
            StatusCode::BAD_REQUEST,
            json!({ "code": "bonus_already_processed", "message": err.to_string() }),
        ),
        SettlementError::NoReferrer(_) => {
            (StatusCode::BAD_REQUEST, json!({ "code": "no_referrer", "message": err.to_string() }))
        }
        SettlementError::Store(_)
        | SettlementError::Tracker(_)
        | SettlementError::Disbursement(_)
        | SettlementError::Oracle(_)
        | SettlementError::Config(_) => {
            tracing::error!(error = %err, "internal error serving request");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "code": "internal_error", "message": "internal error" }),
            )
        }
    }
}

fn error_response(err: &SettlementError) -> Response {
    let (status, body) = status_and_body(err);
    (status, Json(body)).into_response()
}

/// Failure responses for the purchase flow include the step machine so the
/// client can tell exactly what to retry.
fn error_response_with_steps(err: &SettlementError, tracker: &TransactionStatusTracker) -> Response {
    let (status, mut body) = status_and_body(err);
    body["steps"] = serde_json::to_value(tracker).unwrap_or(serde_json::Value::Null);
    (status, Json(body)).into_response()
}
