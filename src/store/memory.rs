//! In-process store. Backs tests and local development; mirrors the
//! uniqueness semantics of the Postgres implementation exactly.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{Chain, Purchase, ReferralBonus, User};

use super::{PurchaseStore, StoreError, UserStore};

#[derive(Default)]
struct Inner {
    purchases: HashMap<Uuid, Purchase>,
    purchase_by_reference: HashMap<String, Uuid>,
    bonuses: HashMap<Uuid, ReferralBonus>,
    bonus_by_purchase: HashMap<Uuid, Uuid>,
    users: HashMap<Uuid, User>,
    user_by_wallet: HashMap<(Chain, String), Uuid>,
    user_by_code: HashMap<String, Uuid>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: all bonus rows written so far.
    pub fn bonuses(&self) -> Vec<ReferralBonus> {
        self.inner.lock().unwrap().bonuses.values().cloned().collect()
    }

    /// Test helper: total number of recorded purchases.
    pub fn purchase_count(&self) -> usize {
        self.inner.lock().unwrap().purchases.len()
    }
}

#[async_trait]
impl PurchaseStore for MemoryStore {
    async fn insert_purchase(&self, purchase: &Purchase) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .purchase_by_reference
            .contains_key(&purchase.transaction_reference)
        {
            return Err(StoreError::Duplicate("transaction_reference"));
        }
        inner
            .purchase_by_reference
            .insert(purchase.transaction_reference.clone(), purchase.id);
        inner.purchases.insert(purchase.id, purchase.clone());
        Ok(())
    }

    async fn purchase_by_reference(&self, reference: &str) -> Result<Option<Purchase>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .purchase_by_reference
            .get(reference)
            .and_then(|id| inner.purchases.get(id))
            .cloned())
    }

    async fn purchase_by_id(&self, id: Uuid) -> Result<Option<Purchase>, StoreError> {
        Ok(self.inner.lock().unwrap().purchases.get(&id).cloned())
    }

    async fn mark_referral_attempted(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.purchases.get_mut(&id) {
            Some(purchase) if !purchase.has_referral_bonus => {
                purchase.has_referral_bonus = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_bonus(&self, bonus: &ReferralBonus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.bonus_by_purchase.contains_key(&bonus.purchase_id) {
            return Err(StoreError::Duplicate("purchase_id"));
        }
        inner.bonus_by_purchase.insert(bonus.purchase_id, bonus.id);
        inner.bonuses.insert(bonus.id, bonus.clone());
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.user_by_code.contains_key(&user.referral_code) {
            return Err(StoreError::Duplicate("referral_code"));
        }
        let wallets = [
            (Chain::Bsc, user.bsc_address.clone()),
            (Chain::Solana, user.solana_address.clone()),
        ];
        for (chain, address) in &wallets {
            if let Some(address) = address {
                if inner.user_by_wallet.contains_key(&(*chain, address.clone())) {
                    return Err(StoreError::Duplicate("wallet_address"));
                }
            }
        }
        for (chain, address) in wallets {
            if let Some(address) = address {
                inner.user_by_wallet.insert((chain, address), user.id);
            }
        }
        inner.user_by_code.insert(user.referral_code.clone(), user.id);
        inner.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn user_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().unwrap().users.get(&id).cloned())
    }

    async fn user_by_wallet(
        &self,
        address: &str,
        chain: Chain,
    ) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .user_by_wallet
            .get(&(chain, address.to_string()))
            .and_then(|id| inner.users.get(id))
            .cloned())
    }

    async fn user_by_referral_code(&self, code: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .user_by_code
            .get(code)
            .and_then(|id| inner.users.get(id))
            .cloned())
    }

    async fn set_referrer_if_unset(
        &self,
        user_id: Uuid,
        referrer_id: Uuid,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.users.get_mut(&user_id) {
            Some(user) if user.referrer_id.is_none() => {
                user.referrer_id = Some(referrer_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
