//! Wallet signer.
//!
//! Owns the operator's secp256k1 key, derives the canonical wallet
//! address, and produces EIP-191 prefixed-message signatures for backend
//! challenges and EULA acceptance. Deterministic for a given key and
//! message (RFC 6979 nonces), so retries sign identically.

use alloy_primitives::Address;
use k256::ecdsa::SigningKey;
use sha3::{Digest, Keccak256};
use teneo_types::{SdkError, SdkResult};
use zeroize::Zeroizing;

/// Prefix prepended to backend auth challenges before signing.
pub const SDK_AUTH_MESSAGE_PREFIX: &str = "Teneo SDK auth: ";

/// A wallet-bound signer constructed from a 32-byte private key.
pub struct WalletSigner {
    key: SigningKey,
    address: String,
}

impl WalletSigner {
    /// Parse a hex private key (`0x` prefix optional) and derive the
    /// EIP-55 checksummed wallet address.
    pub fn from_hex(private_key_hex: &str) -> SdkResult<Self> {
        let trimmed = Zeroizing::new(
            private_key_hex
                .trim()
                .strip_prefix("0x")
                .unwrap_or(private_key_hex.trim())
                .to_string(),
        );
        let bytes = Zeroizing::new(
            hex::decode(trimmed.as_str())
                .map_err(|e| SdkError::InvalidKey(format!("not valid hex: {e}")))?,
        );
        if bytes.len() != 32 {
            return Err(SdkError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let key = SigningKey::from_slice(&bytes)
            .map_err(|e| SdkError::InvalidKey(format!("not a valid secp256k1 scalar: {e}")))?;
        let address = address_from_key(&key);
        Ok(Self { key, address })
    }

    /// The canonical (EIP-55 checksummed) wallet address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Sign arbitrary bytes under the `"\x19Ethereum Signed Message:\n"`
    /// prefix. Returns the 65-byte `r || s || v` signature with the
    /// recovery byte normalized to 27/28.
    pub fn sign_prefixed(&self, message: &[u8]) -> SdkResult<[u8; 65]> {
        let prehash = eip191_hash(message);
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&prehash)
            .map_err(|e| SdkError::Internal(format!("signing failed: {e}")))?;

        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = recovery_id.to_byte() + 27;
        Ok(out)
    }

    /// Sign a backend auth challenge: prefix with [`SDK_AUTH_MESSAGE_PREFIX`]
    /// and return the 0x-hex signature the verify endpoint expects.
    pub fn sign_challenge(&self, challenge: &str) -> SdkResult<String> {
        let message = format!("{SDK_AUTH_MESSAGE_PREFIX}{challenge}");
        let signature = self.sign_prefixed(message.as_bytes())?;
        Ok(format!("0x{}", hex::encode(signature)))
    }

    /// Sign a free-form message (EULA acceptance) as 0x-hex.
    pub fn sign_message(&self, message: &str) -> SdkResult<String> {
        let signature = self.sign_prefixed(message.as_bytes())?;
        Ok(format!("0x{}", hex::encode(signature)))
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.key
    }
}

impl std::fmt::Debug for WalletSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never expose key material through Debug.
        f.debug_struct("WalletSigner")
            .field("address", &self.address)
            .finish()
    }
}

/// Keccak-256 of the EIP-191 personal-sign envelope.
pub fn eip191_hash(message: &[u8]) -> [u8; 32] {
    let prefix = format!("\x19Ethereum Signed Message:\n{}", message.len());
    let mut hasher = Keccak256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Derive the checksummed address for a signing key: keccak-256 of the
/// uncompressed public key (minus the 0x04 tag), last 20 bytes.
fn address_from_key(key: &SigningKey) -> String {
    let point = key.verifying_key().to_encoded_point(false);
    let digest = Keccak256::digest(&point.as_bytes()[1..]);
    Address::from_slice(&digest[12..]).to_checksum(None)
}
