use std::env;

use crate::error::{Result, SettlementError};

/// Runtime settings, supplied entirely through the environment. The core
/// never invents or persists a signing credential.
#[derive(Debug, Clone)]
pub struct Settings {
    /// JSON-RPC endpoint for the BSC node.
    pub bsc_rpc_url: String,
    /// JSON-RPC endpoint for the Solana node.
    pub solana_rpc_url: String,
    /// Presale contract address on BSC; the only accepted destination there.
    pub bsc_presale_contract: String,
    /// Collection wallet on Solana; the only accepted destination there.
    pub solana_collection_address: String,
    /// Base58-encoded 64-byte keypair of the disbursement wallet.
    pub disbursement_wallet_secret: String,
    /// Fixed second-tier payout destination.
    pub second_tier_address: String,
    /// SPL mint for token-based bonus payout; native SOL when unset.
    pub payout_token_mint: Option<String>,
    /// Decimals of the payout token mint (ignored for native payout).
    pub payout_token_decimals: u32,
    /// Price feed base URL (CoinGecko-compatible `simple/price` API).
    pub price_feed_url: String,
    pub database_url: String,
    pub bind_address: String,
}

fn required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| SettlementError::Config(format!("{key} is not set")))
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Ok(Settings {
            bsc_rpc_url: required("BSC_RPC_URL")?,
            solana_rpc_url: required("SOLANA_RPC_URL")?,
            bsc_presale_contract: required("BSC_PRESALE_CONTRACT")?.to_lowercase(),
            solana_collection_address: required("SOLANA_COLLECTION_ADDRESS")?,
            disbursement_wallet_secret: required("DISBURSEMENT_WALLET_SECRET")?,
            second_tier_address: required("SECOND_TIER_ADDRESS")?,
            payout_token_mint: env::var("PAYOUT_TOKEN_MINT").ok().filter(|v| !v.is_empty()),
            payout_token_decimals: env::var("PAYOUT_TOKEN_DECIMALS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(6),
            price_feed_url: env::var("PRICE_FEED_URL")
                .unwrap_or_else(|_| "https://api.coingecko.com/api/v3".to_string()),
            database_url: required("DATABASE_URL")?,
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        })
    }
}
