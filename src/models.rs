use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =====================================================
// CHAINS
// =====================================================

/// Settlement chains accepted for payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Account-based EVM chain; payments in BNB, referenced by tx hash.
    Bsc,
    /// Ledger-style chain; payments in SOL, referenced by signature.
    Solana,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Bsc => "bsc",
            Chain::Solana => "solana",
        }
    }

    pub fn native_currency(&self) -> &'static str {
        match self {
            Chain::Bsc => "BNB",
            Chain::Solana => "SOL",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bsc" => Ok(Chain::Bsc),
            "solana" => Ok(Chain::Solana),
            other => Err(format!("unknown chain: {other}")),
        }
    }
}

// =====================================================
// PURCHASES
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    Completed,
    Failed,
}

impl PurchaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseStatus::Completed => "completed",
            PurchaseStatus::Failed => "failed",
        }
    }
}

impl FromStr for PurchaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(PurchaseStatus::Completed),
            "failed" => Ok(PurchaseStatus::Failed),
            other => Err(format!("unknown purchase status: {other}")),
        }
    }
}

/// One completed, verified payment. Immutable after creation except for
/// `has_referral_bonus`, which flips false -> true exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Purchase {
    pub id: Uuid,
    pub user_id: Uuid,
    pub chain: Chain,
    /// Paid amount in the chain's native unit (SOL or BNB).
    pub payment_amount: Decimal,
    pub payment_currency: String,
    pub allocated_tokens: Decimal,
    /// Price snapshot at time of purchase; fixed program-wide, kept for audit.
    pub price_per_token_usd: Decimal,
    /// Chain-native tx identifier. Globally unique: the idempotency key.
    pub transaction_reference: String,
    pub status: PurchaseStatus,
    pub has_referral_bonus: bool,
    pub created_at: DateTime<Utc>,
}

impl Purchase {
    /// USD value of the purchase at the recorded price snapshot.
    pub fn usd_value(&self) -> Decimal {
        self.allocated_tokens * self.price_per_token_usd
    }
}

// =====================================================
// REFERRALS
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BonusStatus {
    Processed,
    Failed,
}

impl BonusStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BonusStatus::Processed => "processed",
            BonusStatus::Failed => "failed",
        }
    }
}

impl FromStr for BonusStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processed" => Ok(BonusStatus::Processed),
            "failed" => Ok(BonusStatus::Failed),
            other => Err(format!("unknown bonus status: {other}")),
        }
    }
}

/// One bonus disbursement tied to a purchase. At most one per purchase,
/// enforced by `Purchase.has_referral_bonus`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralBonus {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub purchase_id: Uuid,
    /// Total bonus value in USD (first tier + second tier).
    pub bonus_amount: Decimal,
    pub bonus_percentage: Decimal,
    pub status: BonusStatus,
    pub created_at: DateTime<Utc>,
}

// =====================================================
// USERS
// =====================================================

/// A presale participant. `referrer_id` is set at most once and never
/// changed after the first purchase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub bsc_address: Option<String>,
    pub solana_address: Option<String>,
    pub referral_code: String,
    pub referrer_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn wallet_for(&self, chain: Chain) -> Option<&str> {
        match chain {
            Chain::Bsc => self.bsc_address.as_deref(),
            Chain::Solana => self.solana_address.as_deref(),
        }
    }
}

// =====================================================
// VERIFICATION
// =====================================================

/// Normalized result of chain verification. Transient, never persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedTransfer {
    pub sender: String,
    pub destination: String,
    /// Amount in the chain's native unit, derived from the chain's
    /// authoritative source (balance delta on Solana, tx value on BSC).
    pub amount: Decimal,
    pub succeeded: bool,
    pub block_reference: Option<String>,
}
