//! Solana (ledger-style chain) verifier.
//!
//! Memos are advisory only. The transferred amount comes from the sender's
//! pre/post balance delta net of the fee, and the destination check requires
//! the collection address to actually be credited. The sender is the first
//! signer in the account-key list, which arrives either flat (legacy) or as
//! a list-of-lists plus loaded addresses (versioned transactions).

use serde_json::Value;

use crate::constants::{LAMPORTS_PER_SOL, SOLANA_VERIFY_MAX_ATTEMPTS, SOLANA_VERIFY_RETRY_INTERVAL};
use crate::error::VerifyError;
use crate::models::{Chain, VerifiedTransfer};

use super::{rpc_call, ChainVerifier, RetryPolicy};
use async_trait::async_trait;
use rust_decimal::prelude::*;

pub struct SolanaVerifier {
    http: reqwest::Client,
    rpc_url: String,
    /// Collection wallet; the only accepted destination.
    collection_address: String,
}

impl SolanaVerifier {
    pub fn new(
        http: reqwest::Client,
        rpc_url: impl Into<String>,
        collection_address: impl Into<String>,
    ) -> Self {
        Self {
            http,
            rpc_url: rpc_url.into(),
            collection_address: collection_address.into(),
        }
    }

    fn evaluate(&self, tx: &Value) -> Result<VerifiedTransfer, VerifyError> {
        let meta = &tx["meta"];
        if meta.is_null() {
            return Err(VerifyError::Undecodable("transaction has no meta".into()));
        }
        if !meta["err"].is_null() {
            return Err(VerifyError::TransactionFailed(meta["err"].to_string()));
        }

        let keys = account_keys(tx);
        if keys.is_empty() {
            return Err(VerifyError::Undecodable("empty account key list".into()));
        }
        // First signer pays and is the sender; never trust a memo for identity.
        let sender = keys[0].clone();

        let destination_index = keys
            .iter()
            .position(|k| k == &self.collection_address)
            .ok_or_else(|| VerifyError::WrongDestination {
                expected: self.collection_address.clone(),
                actual: "absent from account keys".into(),
            })?;

        let pre = balances(&meta["preBalances"]);
        let post = balances(&meta["postBalances"]);
        if pre.len() != keys.len() || post.len() != keys.len() {
            return Err(VerifyError::Undecodable("balance arrays do not match keys".into()));
        }

        let credited = post[destination_index].saturating_sub(pre[destination_index]);
        if credited == 0 {
            return Err(VerifyError::WrongDestination {
                expected: self.collection_address.clone(),
                actual: "destination not credited".into(),
            });
        }

        let fee = meta["fee"].as_u64().unwrap_or(0);
        let debited = pre[0].saturating_sub(post[0]);
        let transferred_lamports = debited.saturating_sub(fee);
        if transferred_lamports == 0 {
            return Err(VerifyError::Undecodable("sender balance delta is zero".into()));
        }

        let amount_sol = Decimal::from(transferred_lamports) / Decimal::from(LAMPORTS_PER_SOL);

        Ok(VerifiedTransfer {
            sender,
            destination: self.collection_address.clone(),
            amount: amount_sol,
            succeeded: true,
            block_reference: tx["slot"].as_u64().map(|s| s.to_string()),
        })
    }
}

/// Normalizes `message.accountKeys` across transaction versions: entries are
/// base58 strings (raw), `{pubkey}` objects (jsonParsed), or one level of
/// nested lists; versioned transactions append loaded lookup-table addresses
/// through `meta.loadedAddresses`.
fn account_keys(tx: &Value) -> Vec<String> {
    let mut keys = Vec::new();
    collect_keys(&tx["transaction"]["message"]["accountKeys"], &mut keys);

    let loaded = &tx["meta"]["loadedAddresses"];
    collect_keys(&loaded["writable"], &mut keys);
    collect_keys(&loaded["readonly"], &mut keys);
    keys
}

fn collect_keys(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Object(map) => {
            if let Some(Value::String(s)) = map.get("pubkey") {
                out.push(s.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_keys(item, out);
            }
        }
        _ => {}
    }
}

fn balances(value: &Value) -> Vec<u64> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default()
}

#[async_trait]
impl ChainVerifier for SolanaVerifier {
    fn chain(&self) -> Chain {
        Chain::Solana
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: SOLANA_VERIFY_MAX_ATTEMPTS,
            interval: SOLANA_VERIFY_RETRY_INTERVAL,
        }
    }

    async fn verify_transfer(&self, reference: &str) -> Result<VerifiedTransfer, VerifyError> {
        let tx = rpc_call(
            &self.http,
            &self.rpc_url,
            "getTransaction",
            serde_json::json!([
                reference,
                {
                    "encoding": "json",
                    "commitment": "confirmed",
                    "maxSupportedTransactionVersion": 0
                }
            ]),
        )
        .await
        .map_err(VerifyError::Rpc)?;

        if tx.is_null() {
            return Err(VerifyError::NotFound(reference.to_string()));
        }
        self.evaluate(&tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    const SENDER: &str = "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin";
    const COLLECTION: &str = "7UX2i7SucgLMQcfZ75s3VXmZZY4YRUyJN9X1RgfMoDUi";

    fn verifier() -> SolanaVerifier {
        SolanaVerifier::new(reqwest::Client::new(), "http://unused", COLLECTION)
    }

    /// 0.5 SOL transfer, 5000 lamport fee, flat legacy key list.
    fn legacy_tx() -> Value {
        json!({
            "slot": 252_004_831u64,
            "transaction": {
                "message": {
                    "accountKeys": [SENDER, COLLECTION, "11111111111111111111111111111111"]
                }
            },
            "meta": {
                "err": null,
                "fee": 5000,
                "preBalances": [2_000_000_000u64, 1_000_000u64, 1u64],
                "postBalances": [1_499_995_000u64, 501_000_000u64, 1u64]
            }
        })
    }

    #[test]
    fn derives_amount_from_balance_delta() {
        let transfer = verifier().evaluate(&legacy_tx()).unwrap();
        assert_eq!(transfer.amount, dec!(0.5));
        assert_eq!(transfer.sender, SENDER);
        assert_eq!(transfer.destination, COLLECTION);
        assert_eq!(transfer.block_reference.as_deref(), Some("252004831"));
    }

    #[test]
    fn takes_first_signer_from_nested_key_list() {
        let mut tx = legacy_tx();
        // Versioned shape: list-of-lists for the static keys.
        tx["transaction"]["message"]["accountKeys"] =
            json!([[SENDER, COLLECTION], ["11111111111111111111111111111111"]]);
        let transfer = verifier().evaluate(&tx).unwrap();
        assert_eq!(transfer.sender, SENDER);
    }

    #[test]
    fn reads_json_parsed_key_objects_and_loaded_addresses() {
        let mut tx = legacy_tx();
        tx["transaction"]["message"]["accountKeys"] = json!([
            { "pubkey": SENDER, "signer": true, "writable": true },
            { "pubkey": "11111111111111111111111111111111", "signer": false }
        ]);
        tx["meta"]["loadedAddresses"] = json!({ "writable": [COLLECTION], "readonly": [] });
        tx["meta"]["preBalances"] = json!([2_000_000_000u64, 1u64, 1_000_000u64]);
        tx["meta"]["postBalances"] = json!([1_499_995_000u64, 1u64, 501_000_000u64]);
        let transfer = verifier().evaluate(&tx).unwrap();
        assert_eq!(transfer.amount, dec!(0.5));
    }

    #[test]
    fn rejects_chain_level_failure() {
        let mut tx = legacy_tx();
        tx["meta"]["err"] = json!({ "InstructionError": [0, "Custom"] });
        let err = verifier().evaluate(&tx).unwrap_err();
        assert!(matches!(err, VerifyError::TransactionFailed(_)));
    }

    #[test]
    fn rejects_transfer_that_never_touches_the_collection_address() {
        let mut tx = legacy_tx();
        tx["transaction"]["message"]["accountKeys"] =
            json!([SENDER, "3yFwqXBfZY4jBVUafQ1YEXw189y2dN3V5KQq9uzBDy1E"]);
        tx["meta"]["preBalances"] = json!([2_000_000_000u64, 0u64]);
        tx["meta"]["postBalances"] = json!([1_499_995_000u64, 500_000_000u64]);
        let err = verifier().evaluate(&tx).unwrap_err();
        assert!(matches!(err, VerifyError::WrongDestination { .. }));
    }

    #[test]
    fn rejects_when_collection_is_present_but_not_credited() {
        let mut tx = legacy_tx();
        tx["meta"]["postBalances"] = json!([1_999_995_000u64, 1_000_000u64, 1u64]);
        let err = verifier().evaluate(&tx).unwrap_err();
        assert!(matches!(err, VerifyError::WrongDestination { .. }));
    }
}
