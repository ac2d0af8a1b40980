//! Recipient-hash derivation: the weld between the two legs.
//!
//! `recipient_hash = RPO( account_prefix, account_suffix, secret word )`
//! computed once by the facade when a deposit hash is requested, and
//! again by the note script when the user consumes the minted note.
//! Both sides hash the same reduced field elements, so the digests
//! agree by construction.

use miden_objects::account::AccountId;
use miden_objects::{Felt, Hasher, Word, ZERO};
use zeroize::Zeroize;

/// The 32-byte commitment locking a minted note. Also the deposit memo
/// payload on the source chain, hex-encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecipientHash(pub [u8; 32]);

impl RecipientHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The digest as one word of field elements, the form the note
    /// inputs carry on the rollup.
    pub fn to_felts(&self) -> [Felt; 4] {
        let mut felts = [Felt::new(0); 4];
        for (i, chunk) in self.0.chunks_exact(8).enumerate() {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            felts[i] = Felt::new(u64::from_le_bytes(raw));
        }
        felts
    }
}

impl std::fmt::Display for RecipientHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A user-supplied 32-byte secret. Ephemeral: zeroed on drop, redacted
/// in Debug output, never written to the store or the logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; 32]);

impl Secret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The secret as one word, reduced into the field. This is the
    /// exact value the consuming transaction passes as note args.
    pub fn to_felts(&self) -> [Felt; 4] {
        let mut felts = [Felt::new(0); 4];
        for (i, chunk) in self.0.chunks_exact(8).enumerate() {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            felts[i] = Felt::new(u64::from_le_bytes(raw));
        }
        felts
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeriveError {
    MalformedAccountId,
    MalformedSecret,
}

impl std::fmt::Display for DeriveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeriveError::MalformedAccountId => write!(f, "malformed account id"),
            DeriveError::MalformedSecret => write!(f, "malformed secret"),
        }
    }
}

impl std::error::Error for DeriveError {}

impl From<DeriveError> for crate::error::AppError {
    fn from(e: DeriveError) -> Self {
        match e {
            DeriveError::MalformedAccountId => crate::error::AppError::MalformedAccountId,
            DeriveError::MalformedSecret => crate::error::AppError::MalformedSecret,
        }
    }
}

/// Parses an account id in either of its accepted encodings: bech32
/// (`mtst1...`) or hex with optional `0x` prefix.
pub fn parse_account_id(input: &str) -> Result<AccountId, DeriveError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DeriveError::MalformedAccountId);
    }
    if let Ok((_network, id)) = AccountId::from_bech32(trimmed) {
        return Ok(id);
    }
    let hex_part = if trimmed.starts_with("0x") || trimmed.starts_with("0X") {
        trimmed.to_string()
    } else {
        format!("0x{trimmed}")
    };
    AccountId::from_hex(&hex_part).map_err(|_| DeriveError::MalformedAccountId)
}

/// Parses a secret: 64 hex chars, optional `0x` prefix, exactly 32
/// bytes after decoding.
pub fn parse_secret(input: &str) -> Result<Secret, DeriveError> {
    let trimmed = input.trim();
    let hex_part = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if hex_part.len() != 64 {
        return Err(DeriveError::MalformedSecret);
    }
    let mut decoded = hex::decode(hex_part).map_err(|_| DeriveError::MalformedSecret)?;
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&decoded);
    decoded.zeroize();
    Ok(Secret::from_bytes(bytes))
}

/// Pure, deterministic derivation. Called at deposit-hash request time
/// and mirrored by the note script at consume time: the script merges
/// the consuming account's id word with the secret word it receives as
/// note args, so both sides compute `merge(id_word, secret_word)`.
pub fn recipient_hash(account_id: &AccountId, secret: &Secret) -> RecipientHash {
    let id_word: Word = [
        account_id.prefix().as_felt(),
        account_id.suffix(),
        ZERO,
        ZERO,
    ]
    .into();
    let secret_word: Word = secret.to_felts().into();
    let digest = Hasher::merge(&[id_word.into(), secret_word.into()]);

    let mut bytes = [0u8; 32];
    for (i, felt) in digest.as_elements().iter().enumerate() {
        bytes[i * 8..(i + 1) * 8].copy_from_slice(&felt.as_int().to_le_bytes());
    }
    RecipientHash(bytes)
}
