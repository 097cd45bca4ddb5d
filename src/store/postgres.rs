//! Postgres store. Uniqueness lives in the schema (see `migrations/`); a
//! SQLSTATE 23505 from a racing insert comes back as `StoreError::Duplicate`.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{Chain, Purchase, PurchaseStatus, ReferralBonus, User};

use super::{PurchaseStore, StoreError, UserStore};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Maps a unique violation to `Duplicate`, naming the violated constraint.
fn map_insert_err(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            let constraint = db.constraint().unwrap_or_default();
            return if constraint.contains("transaction_reference") {
                StoreError::Duplicate("transaction_reference")
            } else if constraint.contains("referral_code") {
                StoreError::Duplicate("referral_code")
            } else if constraint.contains("purchase_id") {
                StoreError::Duplicate("purchase_id")
            } else {
                StoreError::Duplicate("wallet_address")
            };
        }
    }
    backend(err)
}

fn purchase_from_row(row: &PgRow) -> Result<Purchase, StoreError> {
    let chain: String = row.try_get("chain").map_err(backend)?;
    let status: String = row.try_get("status").map_err(backend)?;
    Ok(Purchase {
        id: row.try_get("id").map_err(backend)?,
        user_id: row.try_get("user_id").map_err(backend)?,
        chain: Chain::from_str(&chain).map_err(StoreError::Backend)?,
        payment_amount: row.try_get("payment_amount").map_err(backend)?,
        payment_currency: row.try_get("payment_currency").map_err(backend)?,
        allocated_tokens: row.try_get("allocated_tokens").map_err(backend)?,
        price_per_token_usd: row.try_get("price_per_token_usd").map_err(backend)?,
        transaction_reference: row.try_get("transaction_reference").map_err(backend)?,
        status: PurchaseStatus::from_str(&status).map_err(StoreError::Backend)?,
        has_referral_bonus: row.try_get("has_referral_bonus").map_err(backend)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(backend)?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User, StoreError> {
    Ok(User {
        id: row.try_get("id").map_err(backend)?,
        bsc_address: row.try_get("bsc_address").map_err(backend)?,
        solana_address: row.try_get("solana_address").map_err(backend)?,
        referral_code: row.try_get("referral_code").map_err(backend)?,
        referrer_id: row.try_get("referrer_id").map_err(backend)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(backend)?,
    })
}

const PURCHASE_COLUMNS: &str = "id, user_id, chain, payment_amount, payment_currency, \
     allocated_tokens, price_per_token_usd, transaction_reference, status, \
     has_referral_bonus, created_at";

#[async_trait]
impl PurchaseStore for PgStore {
    async fn insert_purchase(&self, purchase: &Purchase) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO purchases (id, user_id, chain, payment_amount, payment_currency, \
             allocated_tokens, price_per_token_usd, transaction_reference, status, \
             has_referral_bonus, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(purchase.id)
        .bind(purchase.user_id)
        .bind(purchase.chain.as_str())
        .bind(purchase.payment_amount)
        .bind(&purchase.payment_currency)
        .bind(purchase.allocated_tokens)
        .bind(purchase.price_per_token_usd)
        .bind(&purchase.transaction_reference)
        .bind(purchase.status.as_str())
        .bind(purchase.has_referral_bonus)
        .bind(purchase.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_insert_err)?;
        Ok(())
    }

    async fn purchase_by_reference(&self, reference: &str) -> Result<Option<Purchase>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PURCHASE_COLUMNS} FROM purchases WHERE transaction_reference = $1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.as_ref().map(purchase_from_row).transpose()
    }

    async fn purchase_by_id(&self, id: Uuid) -> Result<Option<Purchase>, StoreError> {
        let row = sqlx::query(&format!("SELECT {PURCHASE_COLUMNS} FROM purchases WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(purchase_from_row).transpose()
    }

    async fn mark_referral_attempted(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE purchases SET has_referral_bonus = TRUE \
             WHERE id = $1 AND has_referral_bonus = FALSE",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_bonus(&self, bonus: &ReferralBonus) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO referral_bonuses (id, referrer_id, purchase_id, bonus_amount, \
             bonus_percentage, status, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(bonus.id)
        .bind(bonus.referrer_id)
        .bind(bonus.purchase_id)
        .bind(bonus.bonus_amount)
        .bind(bonus.bonus_percentage)
        .bind(bonus.status.as_str())
        .bind(bonus.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_insert_err)?;
        Ok(())
    }
}

const USER_COLUMNS: &str =
    "id, bsc_address, solana_address, referral_code, referrer_id, created_at";

#[async_trait]
impl UserStore for PgStore {
    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (id, bsc_address, solana_address, referral_code, referrer_id, \
             created_at) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(user.id)
        .bind(&user.bsc_address)
        .bind(&user.solana_address)
        .bind(&user.referral_code)
        .bind(user.referrer_id)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_insert_err)?;
        Ok(())
    }

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn user_by_wallet(
        &self,
        address: &str,
        chain: Chain,
    ) -> Result<Option<User>, StoreError> {
        let query = match chain {
            Chain::Bsc => format!("SELECT {USER_COLUMNS} FROM users WHERE bsc_address = $1"),
            Chain::Solana => format!("SELECT {USER_COLUMNS} FROM users WHERE solana_address = $1"),
        };
        let row = sqlx::query(&query)
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn user_by_referral_code(&self, code: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE referral_code = $1"))
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn set_referrer_if_unset(
        &self,
        user_id: Uuid,
        referrer_id: Uuid,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE users SET referrer_id = $2 WHERE id = $1 AND referrer_id IS NULL",
        )
        .bind(user_id)
        .bind(referrer_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(result.rows_affected() == 1)
    }
}
