#![forbid(unsafe_code)]

//! Wallet-based signing and identity recovery.
//!
//! Envelopes are signed with recoverable secp256k1 ECDSA over the keccak-256
//! digest of the payload bytes. The 65-byte signature (r || s || recovery id)
//! is carried base64-encoded and lets any peer recover the signer's wallet
//! address without a key registry.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};

pub const SIGNATURE_LENGTH: usize = 65;

/// How far in the past a signed GET nonce may be before it is rejected.
pub const DEFAULT_NONCE_MAX_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("signature is not valid base64")]
    MalformedSignature,
    #[error("signature must be {SIGNATURE_LENGTH} bytes")]
    BadSignatureLength,
    #[error("signer recovery failed")]
    RecoveryFailed,
    #[error("signing failed")]
    SigningFailed,
    #[error("nonce is not a valid RFC3339 timestamp")]
    MalformedNonce,
    #[error("nonce is outside the accepted window")]
    StaleNonce,
}

/// This node's signing identity: a secp256k1 key plus the wallet address it
/// recovers to.
#[derive(Clone)]
pub struct WalletKey {
    signing_key: SigningKey,
    wallet: String,
}

impl WalletKey {
    pub fn from_hex(private_key_hex: &str) -> Result<Self, AuthError> {
        let raw = hex::decode(private_key_hex.trim_start_matches("0x"))
            .map_err(|_| AuthError::InvalidPrivateKey)?;
        let signing_key =
            SigningKey::from_slice(&raw).map_err(|_| AuthError::InvalidPrivateKey)?;
        let wallet = wallet_address(signing_key.verifying_key());
        Ok(Self {
            signing_key,
            wallet,
        })
    }

    pub fn new(signing_key: SigningKey) -> Self {
        let wallet = wallet_address(signing_key.verifying_key());
        Self {
            signing_key,
            wallet,
        }
    }

    pub fn wallet(&self) -> &str {
        &self.wallet
    }

    /// Signs arbitrary payload bytes, returning the base64 signature carried
    /// in the `x-sig` header and the envelope `sig` field.
    pub fn sign(&self, payload: &[u8]) -> Result<String, AuthError> {
        let digest = Keccak256::new_with_prefix(payload);
        let (signature, recovery_id) = self
            .signing_key
            .sign_digest_recoverable(digest)
            .map_err(|_| AuthError::SigningFailed)?;
        let mut raw = [0u8; SIGNATURE_LENGTH];
        raw[..64].copy_from_slice(&signature.to_bytes());
        raw[64] = recovery_id.to_byte();
        Ok(STANDARD.encode(raw))
    }
}

impl std::fmt::Debug for WalletKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletKey")
            .field("wallet", &self.wallet)
            .finish_non_exhaustive()
    }
}

/// Recovers the signer's wallet address from payload bytes and a base64
/// signature. Malformed input is an error the caller is expected to treat as
/// a drop, not a fault; foreign envelopes are routine in a gossip network.
pub fn recover_wallet(payload: &[u8], sig_base64: &str) -> Result<String, AuthError> {
    let raw = STANDARD
        .decode(sig_base64)
        .map_err(|_| AuthError::MalformedSignature)?;
    if raw.len() != SIGNATURE_LENGTH {
        return Err(AuthError::BadSignatureLength);
    }
    let signature = Signature::from_slice(&raw[..64]).map_err(|_| AuthError::RecoveryFailed)?;
    let recovery_id =
        RecoveryId::from_byte(raw[64]).ok_or(AuthError::RecoveryFailed)?;
    let digest = Keccak256::new_with_prefix(payload);
    let verifying_key = VerifyingKey::recover_from_digest(digest, &signature, recovery_id)
        .map_err(|_| AuthError::RecoveryFailed)?;
    Ok(wallet_address(&verifying_key))
}

/// Derives the canonical lowercase wallet address for a public key: the last
/// 20 bytes of the keccak-256 of the uncompressed point, `0x`-prefixed.
pub fn wallet_address(verifying_key: &VerifyingKey) -> String {
    let point = verifying_key.to_encoded_point(false);
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

/// Validates a signed GET nonce: an RFC3339 timestamp no older than
/// `max_age` and not unreasonably far in the future (clock skew allowance of
/// one minute).
pub fn check_nonce(nonce: &str, now: DateTime<Utc>, max_age: Duration) -> Result<(), AuthError> {
    let issued: DateTime<Utc> = nonce
        .parse()
        .map_err(|_| AuthError::MalformedNonce)?;
    let age = now.signed_duration_since(issued);
    let max_age = chrono::Duration::from_std(max_age).map_err(|_| AuthError::StaleNonce)?;
    if age > max_age || age < -chrono::Duration::minutes(1) {
        return Err(AuthError::StaleNonce);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rand_core::OsRng;

    use super::*;

    fn test_key() -> WalletKey {
        WalletKey::new(SigningKey::random(&mut OsRng))
    }

    #[test]
    fn sign_then_recover_yields_same_wallet() {
        let key = test_key();
        let payload = br#"{"method":"chat.read","params":{"chat_id":"1:2"}}"#;
        let sig = key.sign(payload).expect("sign");
        let recovered = recover_wallet(payload, &sig).expect("recover");
        assert_eq!(recovered, key.wallet());
    }

    #[test]
    fn tampered_payload_recovers_different_wallet() {
        let key = test_key();
        let sig = key.sign(b"original payload").expect("sign");
        let recovered = recover_wallet(b"tampered payload", &sig).expect("recover");
        assert_ne!(recovered, key.wallet());
    }

    #[test]
    fn malformed_signature_is_an_error() {
        assert_eq!(
            recover_wallet(b"payload", "not base64!!"),
            Err(AuthError::MalformedSignature)
        );
        let short = STANDARD.encode([0u8; 10]);
        assert_eq!(
            recover_wallet(b"payload", &short),
            Err(AuthError::BadSignatureLength)
        );
    }

    #[test]
    fn wallet_address_is_lowercase_hex() {
        let key = test_key();
        let wallet = key.wallet();
        assert!(wallet.starts_with("0x"));
        assert_eq!(wallet.len(), 42);
        assert_eq!(wallet, &wallet.to_lowercase());
    }

    #[test]
    fn nonce_window() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let fresh = now - chrono::Duration::seconds(30);
        let stale = now - chrono::Duration::minutes(6);
        assert!(check_nonce(&fresh.to_rfc3339(), now, DEFAULT_NONCE_MAX_AGE).is_ok());
        assert_eq!(
            check_nonce(&stale.to_rfc3339(), now, DEFAULT_NONCE_MAX_AGE),
            Err(AuthError::StaleNonce)
        );
        assert_eq!(
            check_nonce("yesterday", now, DEFAULT_NONCE_MAX_AGE),
            Err(AuthError::MalformedNonce)
        );
    }
}
