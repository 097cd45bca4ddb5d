//! Chain verification.
//!
//! One [`ChainVerifier`] implementation per settlement chain, selected by the
//! `chain` field on the request. Verifiers normalize a chain-specific lookup
//! into a [`VerifiedTransfer`] and classify failures as retryable (not yet
//! indexed) or permanent (failed, wrong destination, undecodable).

mod bsc;
mod solana;

pub use bsc::BscVerifier;
pub use solana::SolanaVerifier;

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::VerifyError;
use crate::models::{Chain, VerifiedTransfer};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

#[async_trait]
pub trait ChainVerifier: Send + Sync {
    fn chain(&self) -> Chain;

    /// How often a not-yet-indexed transaction is re-polled.
    fn retry_policy(&self) -> RetryPolicy;

    /// Single verification attempt. `NotFound` means the node has not
    /// indexed the transaction yet and the caller may retry.
    async fn verify_transfer(&self, reference: &str) -> Result<VerifiedTransfer, VerifyError>;
}

/// Retries `NotFound` with a fixed interval up to the verifier's attempt
/// budget, honoring an optional wall-clock deadline. Permanent rejections
/// pass through on the first occurrence. Exhaustion surfaces as `NotFound`.
pub async fn verify_with_retry(
    verifier: &dyn ChainVerifier,
    reference: &str,
    deadline: Option<Instant>,
) -> Result<VerifiedTransfer, VerifyError> {
    let policy = verifier.retry_policy();
    let mut last_not_found = VerifyError::NotFound(reference.to_string());

    for attempt in 1..=policy.max_attempts {
        match verifier.verify_transfer(reference).await {
            Ok(transfer) => return Ok(transfer),
            Err(err) if err.is_retryable() => {
                tracing::debug!(
                    chain = %verifier.chain(),
                    reference,
                    attempt,
                    max_attempts = policy.max_attempts,
                    "transaction not indexed yet"
                );
                last_not_found = err;
            }
            Err(err) => return Err(err),
        }

        if attempt == policy.max_attempts {
            break;
        }
        if let Some(deadline) = deadline {
            if Instant::now() + policy.interval >= deadline {
                break;
            }
        }
        tokio::time::sleep(policy.interval).await;
    }

    Err(last_not_found)
}

/// Minimal JSON-RPC 2.0 call helper shared by both verifiers and the
/// disbursement wallet.
pub(crate) async fn rpc_call(
    http: &reqwest::Client,
    url: &str,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, String> {
    let body = serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });

    let response: serde_json::Value = http
        .post(url)
        .json(&body)
        .send()
        .await
        .map_err(|e| format!("{method} request failed: {e}"))?
        .json()
        .await
        .map_err(|e| format!("{method} returned invalid JSON: {e}"))?;

    if let Some(err) = response.get("error").filter(|e| !e.is_null()) {
        return Err(format!("{method} RPC error: {err}"));
    }
    Ok(response.get("result").cloned().unwrap_or(serde_json::Value::Null))
}
