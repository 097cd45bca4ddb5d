use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// =====================================================
// SALE PARAMETERS
// =====================================================

pub const TOKEN_SYMBOL: &str = "NOVA";

/// Fixed program-wide sale price. Stored on every purchase for audit.
pub const TOKEN_PRICE_USD: Decimal = dec!(0.012);

/// First-tier referral bonus: 10% of the purchase USD value.
pub const REFERRAL_BONUS_RATE: Decimal = dec!(0.10);

/// Second tier takes 10% of the first-tier bonus (1% of the purchase).
pub const SECOND_TIER_RATE: Decimal = dec!(0.10);

pub const REFERRAL_CODE_LENGTH: usize = 8;

// =====================================================
// CHAIN UNITS
// =====================================================

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000; // 10^9
pub const WEI_PER_BNB: Decimal = dec!(1_000_000_000_000_000_000); // 10^18

/// Decimal places kept on token allocations.
pub const ALLOCATION_SCALE: u32 = 6;

// =====================================================
// VERIFICATION RETRY BUDGETS
// =====================================================

/// Solana nodes index a confirmed signature within a few slots; poll a
/// bounded number of times before surfacing "not found".
pub const SOLANA_VERIFY_MAX_ATTEMPTS: u32 = 5;
pub const SOLANA_VERIFY_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// BSC receipts lag one block at most; a single delayed retry suffices.
pub const BSC_VERIFY_MAX_ATTEMPTS: u32 = 2;
pub const BSC_VERIFY_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Post-send confirmation poll for disbursement transactions.
pub const CONFIRM_MAX_ATTEMPTS: u32 = 5;
pub const CONFIRM_POLL_INTERVAL: Duration = Duration::from_secs(5);

// =====================================================
// PRICE ORACLE
// =====================================================

/// Max staleness before a cached price triggers a refresh. 120s for mainnet.
pub const PRICE_CACHE_TTL: Duration = Duration::from_secs(120);

/// Last-resort prices when no feed reading has ever succeeded. Always
/// reported with the stale flag set.
pub const FALLBACK_SOL_PRICE_USD: Decimal = dec!(150);
pub const FALLBACK_BNB_PRICE_USD: Decimal = dec!(600);
