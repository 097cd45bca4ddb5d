//! Disbursement wallet.
//!
//! Builds, signs and submits the legacy Solana transactions that pay out
//! referral bonuses: a system transfer for native SOL, or an SPL token
//! transfer with the recipient's associated token account created
//! idempotently in the same transaction. The signing key is supplied by
//! configuration; nothing here generates or stores credentials.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::chain::rpc_call;
use crate::constants::{CONFIRM_MAX_ATTEMPTS, CONFIRM_POLL_INTERVAL};

pub const SYSTEM_PROGRAM: &str = "11111111111111111111111111111111";
pub const TOKEN_PROGRAM: &str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";
pub const ASSOCIATED_TOKEN_PROGRAM: &str = "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL";

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("transaction not confirmed: {0}")]
    Unconfirmed(String),
}

/// Payout transport used by the referral engine. Returns the transaction
/// signature of the submitted transfer.
#[async_trait]
pub trait DisbursementWallet: Send + Sync {
    async fn send_sol(&self, to: &str, lamports: u64) -> Result<String, WalletError>;

    /// Transfers `amount` base units of `mint` to `to`'s associated token
    /// account, creating the account if it does not exist yet.
    async fn send_token(&self, to: &str, mint: &str, amount: u64) -> Result<String, WalletError>;
}

// =====================================================
// ADDRESSES
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pubkey(pub [u8; 32]);

impl Pubkey {
    pub fn from_base58(s: &str) -> Result<Self, WalletError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| WalletError::InvalidAddress(format!("{s}: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| WalletError::InvalidAddress(format!("{s}: not 32 bytes")))?;
        Ok(Pubkey(arr))
    }

    pub fn to_base58(self) -> String {
        bs58::encode(self.0).into_string()
    }

    fn is_on_curve(&self) -> bool {
        VerifyingKey::from_bytes(&self.0).is_ok()
    }
}

/// Program-derived address: highest bump whose hash falls off the ed25519
/// curve.
pub fn derive_program_address(seeds: &[&[u8]], program: &Pubkey) -> Result<Pubkey, WalletError> {
    for bump in (0..=255u8).rev() {
        let mut hasher = Sha256::new();
        for seed in seeds {
            hasher.update(seed);
        }
        hasher.update([bump]);
        hasher.update(program.0);
        hasher.update(b"ProgramDerivedAddress");
        let candidate = Pubkey(hasher.finalize().into());
        if !candidate.is_on_curve() {
            return Ok(candidate);
        }
    }
    Err(WalletError::InvalidAddress("no viable bump for PDA".to_string()))
}

pub fn associated_token_address(owner: &Pubkey, mint: &Pubkey) -> Result<Pubkey, WalletError> {
    let token_program = Pubkey::from_base58(TOKEN_PROGRAM)?;
    let ata_program = Pubkey::from_base58(ASSOCIATED_TOKEN_PROGRAM)?;
    derive_program_address(&[&owner.0, &token_program.0, &mint.0], &ata_program)
}

// =====================================================
// TRANSACTION ENCODING (legacy message format)
// =====================================================

struct AccountMeta {
    pubkey: Pubkey,
    is_signer: bool,
    is_writable: bool,
}

struct Instruction {
    program: Pubkey,
    accounts: Vec<AccountMeta>,
    data: Vec<u8>,
}

fn system_transfer(from: Pubkey, to: Pubkey, lamports: u64) -> Result<Instruction, WalletError> {
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&2u32.to_le_bytes()); // SystemInstruction::Transfer
    data.extend_from_slice(&lamports.to_le_bytes());
    Ok(Instruction {
        program: Pubkey::from_base58(SYSTEM_PROGRAM)?,
        accounts: vec![
            AccountMeta { pubkey: from, is_signer: true, is_writable: true },
            AccountMeta { pubkey: to, is_signer: false, is_writable: true },
        ],
        data,
    })
}

fn token_transfer(
    source: Pubkey,
    destination: Pubkey,
    authority: Pubkey,
    amount: u64,
) -> Result<Instruction, WalletError> {
    let mut data = Vec::with_capacity(9);
    data.push(3); // TokenInstruction::Transfer
    data.extend_from_slice(&amount.to_le_bytes());
    Ok(Instruction {
        program: Pubkey::from_base58(TOKEN_PROGRAM)?,
        accounts: vec![
            AccountMeta { pubkey: source, is_signer: false, is_writable: true },
            AccountMeta { pubkey: destination, is_signer: false, is_writable: true },
            AccountMeta { pubkey: authority, is_signer: true, is_writable: false },
        ],
        data,
    })
}

fn create_ata_idempotent(
    payer: Pubkey,
    ata: Pubkey,
    owner: Pubkey,
    mint: Pubkey,
) -> Result<Instruction, WalletError> {
    Ok(Instruction {
        program: Pubkey::from_base58(ASSOCIATED_TOKEN_PROGRAM)?,
        accounts: vec![
            AccountMeta { pubkey: payer, is_signer: true, is_writable: true },
            AccountMeta { pubkey: ata, is_signer: false, is_writable: true },
            AccountMeta { pubkey: owner, is_signer: false, is_writable: false },
            AccountMeta { pubkey: mint, is_signer: false, is_writable: false },
            AccountMeta {
                pubkey: Pubkey::from_base58(SYSTEM_PROGRAM)?,
                is_signer: false,
                is_writable: false,
            },
            AccountMeta {
                pubkey: Pubkey::from_base58(TOKEN_PROGRAM)?,
                is_signer: false,
                is_writable: false,
            },
        ],
        data: vec![1], // CreateIdempotent
    })
}

fn encode_shortvec_len(out: &mut Vec<u8>, mut value: usize) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Deduped account table in message order: writable signers, readonly
/// signers, writable non-signers, readonly non-signers. The fee payer is
/// forced to the front.
fn compile_accounts(payer: Pubkey, instructions: &[Instruction]) -> Vec<(Pubkey, bool, bool)> {
    let mut merged: Vec<(Pubkey, bool, bool)> = vec![(payer, true, true)];
    let mut upsert = |pubkey: Pubkey, is_signer: bool, is_writable: bool| {
        match merged.iter_mut().find(|(k, _, _)| *k == pubkey) {
            Some(entry) => {
                entry.1 |= is_signer;
                entry.2 |= is_writable;
            }
            None => merged.push((pubkey, is_signer, is_writable)),
        }
    };
    for ix in instructions {
        for meta in &ix.accounts {
            upsert(meta.pubkey, meta.is_signer, meta.is_writable);
        }
        upsert(ix.program, false, false);
    }

    let rank = |entry: &(Pubkey, bool, bool)| match (entry.1, entry.2) {
        (true, true) => 0u8,
        (true, false) => 1,
        (false, true) => 2,
        (false, false) => 3,
    };
    // Payer stays at index 0; everything else sorts by class.
    let mut rest = merged.split_off(1);
    rest.sort_by_key(rank);
    merged.extend(rest);
    merged
}

fn compile_message(
    payer: Pubkey,
    instructions: &[Instruction],
    recent_blockhash: [u8; 32],
) -> Vec<u8> {
    let accounts = compile_accounts(payer, instructions);
    let num_signers = accounts.iter().filter(|(_, s, _)| *s).count() as u8;
    let num_readonly_signed = accounts.iter().filter(|(_, s, w)| *s && !*w).count() as u8;
    let num_readonly_unsigned = accounts.iter().filter(|(_, s, w)| !*s && !*w).count() as u8;

    let index_of = |key: &Pubkey| -> u8 {
        accounts.iter().position(|(k, _, _)| k == key).expect("compiled account") as u8
    };

    let mut message = vec![num_signers, num_readonly_signed, num_readonly_unsigned];
    encode_shortvec_len(&mut message, accounts.len());
    for (key, _, _) in &accounts {
        message.extend_from_slice(&key.0);
    }
    message.extend_from_slice(&recent_blockhash);
    encode_shortvec_len(&mut message, instructions.len());
    for ix in instructions {
        message.push(index_of(&ix.program));
        encode_shortvec_len(&mut message, ix.accounts.len());
        for meta in &ix.accounts {
            message.push(index_of(&meta.pubkey));
        }
        encode_shortvec_len(&mut message, ix.data.len());
        message.extend_from_slice(&ix.data);
    }
    message
}

// =====================================================
// WALLET
// =====================================================

pub struct SolanaWallet {
    http: reqwest::Client,
    rpc_url: String,
    signer: SigningKey,
    pubkey: Pubkey,
}

impl SolanaWallet {
    /// Accepts the standard base58-encoded 64-byte keypair export, or a
    /// bare 32-byte seed.
    pub fn from_base58_secret(
        secret: &str,
        http: reqwest::Client,
        rpc_url: impl Into<String>,
    ) -> Result<Self, WalletError> {
        let bytes = bs58::decode(secret)
            .into_vec()
            .map_err(|e| WalletError::InvalidKey(e.to_string()))?;
        let seed: [u8; 32] = match bytes.len() {
            // Standard export is the 64-byte keypair; the seed is the first half.
            64 => bytes[..32]
                .try_into()
                .map_err(|_| WalletError::InvalidKey("malformed keypair".to_string()))?,
            32 => bytes
                .try_into()
                .map_err(|_| WalletError::InvalidKey("malformed seed".to_string()))?,
            n => return Err(WalletError::InvalidKey(format!("unexpected key length {n}"))),
        };
        let signer = SigningKey::from_bytes(&seed);
        let pubkey = Pubkey(signer.verifying_key().to_bytes());
        Ok(Self { http, rpc_url: rpc_url.into(), signer, pubkey })
    }

    pub fn address(&self) -> String {
        self.pubkey.to_base58()
    }

    async fn latest_blockhash(&self) -> Result<[u8; 32], WalletError> {
        let result = rpc_call(
            &self.http,
            &self.rpc_url,
            "getLatestBlockhash",
            serde_json::json!([{ "commitment": "confirmed" }]),
        )
        .await
        .map_err(WalletError::Rpc)?;
        let hash = result["value"]["blockhash"]
            .as_str()
            .ok_or_else(|| WalletError::Rpc("missing blockhash in response".to_string()))?;
        Ok(Pubkey::from_base58(hash)?.0)
    }

    async fn sign_and_send(&self, instructions: &[Instruction]) -> Result<String, WalletError> {
        let blockhash = self.latest_blockhash().await?;
        let message = compile_message(self.pubkey, instructions, blockhash);
        let signature = self.signer.sign(&message);

        let mut wire = Vec::with_capacity(1 + 64 + message.len());
        encode_shortvec_len(&mut wire, 1);
        wire.extend_from_slice(&signature.to_bytes());
        wire.extend_from_slice(&message);

        let result = rpc_call(
            &self.http,
            &self.rpc_url,
            "sendTransaction",
            serde_json::json!([BASE64.encode(&wire), { "encoding": "base64" }]),
        )
        .await
        .map_err(WalletError::Rpc)?;
        let signature = result
            .as_str()
            .ok_or_else(|| WalletError::Rpc("sendTransaction returned no signature".to_string()))?
            .to_string();

        self.confirm(&signature).await?;
        Ok(signature)
    }

    /// Bounded post-send confirmation poll.
    async fn confirm(&self, signature: &str) -> Result<(), WalletError> {
        for attempt in 1..=CONFIRM_MAX_ATTEMPTS {
            let result = rpc_call(
                &self.http,
                &self.rpc_url,
                "getSignatureStatuses",
                serde_json::json!([[signature]]),
            )
            .await
            .map_err(WalletError::Rpc)?;

            let status = &result["value"][0];
            if !status.is_null() {
                if !status["err"].is_null() {
                    return Err(WalletError::Unconfirmed(format!(
                        "{signature} failed on chain: {}",
                        status["err"]
                    )));
                }
                let confirmation = status["confirmationStatus"].as_str().unwrap_or("");
                if confirmation == "confirmed" || confirmation == "finalized" {
                    return Ok(());
                }
            }

            if attempt < CONFIRM_MAX_ATTEMPTS {
                tokio::time::sleep(CONFIRM_POLL_INTERVAL).await;
            }
        }
        Err(WalletError::Unconfirmed(format!(
            "{signature} not confirmed after {CONFIRM_MAX_ATTEMPTS} attempts"
        )))
    }
}

#[async_trait]
impl DisbursementWallet for SolanaWallet {
    async fn send_sol(&self, to: &str, lamports: u64) -> Result<String, WalletError> {
        let to = Pubkey::from_base58(to)?;
        let transfer = system_transfer(self.pubkey, to, lamports)?;
        self.sign_and_send(&[transfer]).await
    }

    async fn send_token(&self, to: &str, mint: &str, amount: u64) -> Result<String, WalletError> {
        let owner = Pubkey::from_base58(to)?;
        let mint = Pubkey::from_base58(mint)?;
        let source = associated_token_address(&self.pubkey, &mint)?;
        let destination = associated_token_address(&owner, &mint)?;

        // Recipient account creation batches with the transfer so a missing
        // account can never strand the payout.
        let create = create_ata_idempotent(self.pubkey, destination, owner, mint)?;
        let transfer = token_transfer(source, destination, self.pubkey, amount)?;
        self.sign_and_send(&[create, transfer]).await
    }
}
