//! BSC (account-based chain) verifier.
//!
//! The authoritative purchase signal is the transaction itself: the call must
//! target the presale contract, carry the canonical `buyTokens` selector, and
//! have a successful receipt. The paid amount is the transaction value; the
//! decoded call argument is the buyer-declared token amount.

use serde_json::Value;
use sha3::{Digest, Keccak256};

use crate::constants::{BSC_VERIFY_MAX_ATTEMPTS, BSC_VERIFY_RETRY_INTERVAL, WEI_PER_BNB};
use crate::error::VerifyError;
use crate::models::{Chain, VerifiedTransfer};

use super::{rpc_call, ChainVerifier, RetryPolicy};
use async_trait::async_trait;
use rust_decimal::prelude::*;

/// Canonical presale entry point. Anything else sent to the contract is an
/// incidental transfer and is rejected.
const BUY_FUNCTION_SIGNATURE: &str = "buyTokens(uint256)";

pub struct BscVerifier {
    http: reqwest::Client,
    rpc_url: String,
    /// Lowercased presale contract address, the only accepted destination.
    presale_contract: String,
    buy_selector: [u8; 4],
}

impl BscVerifier {
    pub fn new(http: reqwest::Client, rpc_url: impl Into<String>, presale_contract: &str) -> Self {
        let digest = Keccak256::digest(BUY_FUNCTION_SIGNATURE.as_bytes());
        let mut buy_selector = [0u8; 4];
        buy_selector.copy_from_slice(&digest[..4]);
        Self {
            http,
            rpc_url: rpc_url.into(),
            presale_contract: presale_contract.to_lowercase(),
            buy_selector,
        }
    }

    /// Decides on a fetched transaction + receipt pair. Pure so it can be
    /// exercised against fixtures.
    fn evaluate(&self, tx: &Value, receipt: &Value) -> Result<VerifiedTransfer, VerifyError> {
        let status = receipt["status"].as_str().unwrap_or("0x0");
        if status != "0x1" {
            return Err(VerifyError::TransactionFailed(format!(
                "receipt status {status}"
            )));
        }

        let to = tx["to"]
            .as_str()
            .ok_or_else(|| VerifyError::Undecodable("transaction has no `to` address".into()))?
            .to_lowercase();
        if to != self.presale_contract {
            return Err(VerifyError::WrongDestination {
                expected: self.presale_contract.clone(),
                actual: to,
            });
        }

        let from = tx["from"]
            .as_str()
            .ok_or_else(|| VerifyError::Undecodable("transaction has no `from` address".into()))?
            .to_lowercase();

        let input = tx["input"].as_str().unwrap_or("0x");
        self.decode_buy_call(input)?;

        let value_wei = parse_hex_u128(tx["value"].as_str().unwrap_or("0x0"))
            .ok_or_else(|| VerifyError::Undecodable("unparseable transaction value".into()))?;
        let amount_bnb = Decimal::from_u128(value_wei)
            .ok_or_else(|| VerifyError::Undecodable("transaction value out of range".into()))?
            / WEI_PER_BNB;

        Ok(VerifiedTransfer {
            sender: from,
            destination: to,
            amount: amount_bnb,
            succeeded: true,
            block_reference: receipt["blockNumber"].as_str().map(str::to_owned),
        })
    }

    /// Confirms the calldata is a `buyTokens` call and returns the declared
    /// token amount argument.
    fn decode_buy_call(&self, input: &str) -> Result<u128, VerifyError> {
        let data = input.strip_prefix("0x").unwrap_or(input);
        if data.len() < 8 + 64 {
            return Err(VerifyError::Undecodable(format!(
                "calldata too short for a buy call: {} hex chars",
                data.len()
            )));
        }

        let mut selector = [0u8; 4];
        for (i, byte) in selector.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&data[i * 2..i * 2 + 2], 16)
                .map_err(|_| VerifyError::Undecodable("non-hex calldata".into()))?;
        }
        if selector != self.buy_selector {
            return Err(VerifyError::Undecodable(format!(
                "unexpected function selector 0x{}",
                &data[..8]
            )));
        }

        // First ABI word: declared token amount. High bytes must be zero for
        // it to fit the u128 we do math in.
        let word = &data[8..8 + 64];
        if !word[..32].bytes().all(|b| b == b'0') {
            return Err(VerifyError::Undecodable("token amount argument overflows".into()));
        }
        u128::from_str_radix(&word[32..], 16)
            .map_err(|_| VerifyError::Undecodable("unparseable token amount argument".into()))
    }
}

fn parse_hex_u128(raw: &str) -> Option<u128> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    if digits.is_empty() {
        return None;
    }
    u128::from_str_radix(digits, 16).ok()
}

#[async_trait]
impl ChainVerifier for BscVerifier {
    fn chain(&self) -> Chain {
        Chain::Bsc
    }

    fn retry_policy(&self) -> RetryPolicy {
        // Receipts lag at most a block; a single delayed retry.
        RetryPolicy {
            max_attempts: BSC_VERIFY_MAX_ATTEMPTS,
            interval: BSC_VERIFY_RETRY_INTERVAL,
        }
    }

    async fn verify_transfer(&self, reference: &str) -> Result<VerifiedTransfer, VerifyError> {
        let tx = rpc_call(
            &self.http,
            &self.rpc_url,
            "eth_getTransactionByHash",
            serde_json::json!([reference]),
        )
        .await
        .map_err(VerifyError::Rpc)?;
        if tx.is_null() {
            return Err(VerifyError::NotFound(reference.to_string()));
        }

        let receipt = rpc_call(
            &self.http,
            &self.rpc_url,
            "eth_getTransactionReceipt",
            serde_json::json!([reference]),
        )
        .await
        .map_err(VerifyError::Rpc)?;
        if receipt.is_null() {
            // Broadcast but not yet mined.
            return Err(VerifyError::NotFound(reference.to_string()));
        }

        self.evaluate(&tx, &receipt)
    }
}
