use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use presale_settlement::api::{self, AppState};
use presale_settlement::chain::{BscVerifier, ChainVerifier, SolanaVerifier};
use presale_settlement::config::Settings;
use presale_settlement::ledger::PurchaseLedger;
use presale_settlement::oracle::{HttpPriceFeed, PriceOracle};
use presale_settlement::orchestrator::SettlementOrchestrator;
use presale_settlement::referral::{DisbursementQueue, PayoutConfig, ReferralEngine};
use presale_settlement::store::PgStore;
use presale_settlement::wallet::SolanaWallet;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = Settings::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&settings.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    let store = Arc::new(PgStore::new(pool));

    let http = reqwest::Client::new();
    let verifiers: Vec<Arc<dyn ChainVerifier>> = vec![
        Arc::new(BscVerifier::new(
            http.clone(),
            settings.bsc_rpc_url.clone(),
            &settings.bsc_presale_contract,
        )),
        Arc::new(SolanaVerifier::new(
            http.clone(),
            settings.solana_rpc_url.clone(),
            settings.solana_collection_address.clone(),
        )),
    ];

    let oracle = Arc::new(PriceOracle::new(Arc::new(HttpPriceFeed::new(
        http.clone(),
        settings.price_feed_url.clone(),
    ))));

    let wallet = Arc::new(SolanaWallet::from_base58_secret(
        &settings.disbursement_wallet_secret,
        http.clone(),
        settings.solana_rpc_url.clone(),
    )?);
    tracing::info!(address = %wallet.address(), "disbursement wallet loaded");

    let engine = Arc::new(ReferralEngine::new(
        store.clone(),
        store.clone(),
        oracle.clone(),
        wallet,
        PayoutConfig {
            second_tier_address: settings.second_tier_address.clone(),
            token_mint: settings.payout_token_mint.clone(),
            token_decimals: settings.payout_token_decimals,
        },
    ));
    let queue = DisbursementQueue::spawn(engine.clone());

    let ledger = PurchaseLedger::new(store.clone(), store.clone());
    let orchestrator = Arc::new(SettlementOrchestrator::new(
        verifiers,
        ledger.clone(),
        oracle,
        queue,
    ));

    let app = api::router(AppState { orchestrator, ledger, engine });
    let listener = tokio::net::TcpListener::bind(&settings.bind_address).await?;
    tracing::info!(address = %settings.bind_address, "settlement server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
