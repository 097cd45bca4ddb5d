//! Storage boundary.
//!
//! The persistence engine is abstract: a transactional store with uniqueness
//! constraints. Uniqueness violations surface as [`StoreError::Duplicate`] so
//! callers can close check-then-insert races at the constraint instead of
//! with a separate read.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Chain, Purchase, ReferralBonus, User};

#[derive(Error, Debug)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write; `0` names the constraint.
    #[error("duplicate {0}")]
    Duplicate(&'static str),

    #[error("backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait PurchaseStore: Send + Sync {
    /// Inserts atomically; `Duplicate("transaction_reference")` when the
    /// reference is already recorded.
    async fn insert_purchase(&self, purchase: &Purchase) -> Result<(), StoreError>;

    async fn purchase_by_reference(&self, reference: &str) -> Result<Option<Purchase>, StoreError>;

    async fn purchase_by_id(&self, id: Uuid) -> Result<Option<Purchase>, StoreError>;

    /// Compare-and-set of `has_referral_bonus` false -> true. Returns false
    /// when the flag was already set (or the purchase does not exist).
    async fn mark_referral_attempted(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn insert_bonus(&self, bonus: &ReferralBonus) -> Result<(), StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Inserts atomically; duplicates on wallet address or referral code.
    async fn insert_user(&self, user: &User) -> Result<(), StoreError>;

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    async fn user_by_wallet(&self, address: &str, chain: Chain)
        -> Result<Option<User>, StoreError>;

    async fn user_by_referral_code(&self, code: &str) -> Result<Option<User>, StoreError>;

    /// Sets `referrer_id` only when currently unset. Returns false when a
    /// referrer already existed.
    async fn set_referrer_if_unset(
        &self,
        user_id: Uuid,
        referrer_id: Uuid,
    ) -> Result<bool, StoreError>;
}
