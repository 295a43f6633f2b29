//! Key material for Nebula certificates.
//!
//! Nodes get an X25519 key-agreement keypair; the certificate authority
//! signs with Ed25519. Private material is zeroized on drop and never
//! appears in `Debug` output.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

pub const X25519_PRIVATE_KEY_BANNER: &str = "NEBULA X25519 PRIVATE KEY";
pub const ED25519_PRIVATE_KEY_BANNER: &str = "NEBULA ED25519 PRIVATE KEY";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("pem: {0}")]
    Pem(String),
    #[error("unexpected PEM block: expected {expected}, found {found}")]
    Banner {
        expected: &'static str,
        found: String,
    },
    #[error("invalid key length: expected {expected} bytes, found {found}")]
    KeyLength { expected: usize, found: usize },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("certificate decode: {0}")]
    Decode(String),
    #[error("signature verification failed")]
    BadSignature,
}

// ── PEM helpers ─────────────────────────────────────────────────────

pub(crate) fn encode_pem(tag: &str, contents: &[u8]) -> String {
    let block = pem::Pem::new(tag, contents.to_vec());
    pem::encode_config(
        &block,
        pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
    )
}

/// Parse the first PEM block and check its banner.
pub(crate) fn decode_pem(input: &[u8], expected: &'static str) -> Result<Vec<u8>, CryptoError> {
    let block = pem::parse(input).map_err(|e| CryptoError::Pem(e.to_string()))?;
    if block.tag() != expected {
        return Err(CryptoError::Banner {
            expected,
            found: block.tag().to_string(),
        });
    }
    Ok(block.into_contents())
}

// ── Node keys ───────────────────────────────────────────────────────

/// X25519 keypair handed to a joining node alongside its certificate.
pub struct NodeKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl NodeKeyPair {
    /// Generate a keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Private key in Nebula PEM form. Zeroized when dropped.
    pub fn private_key_pem(&self) -> Zeroizing<String> {
        let raw = Zeroizing::new(self.secret.to_bytes());
        Zeroizing::new(encode_pem(X25519_PRIVATE_KEY_BANNER, raw.as_ref()))
    }
}

impl std::fmt::Debug for NodeKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

// ── CA signing key ──────────────────────────────────────────────────

/// Ed25519 key of the certificate authority.
///
/// Exposes signing and the public half only. The PEM export exists for
/// bootstrapping a new authority and is not used on the serving path.
pub struct CaSigningKey {
    key: SigningKey,
}

impl CaSigningKey {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load a `NEBULA ED25519 PRIVATE KEY` block.
    ///
    /// Accepts the 64-byte seed-plus-public form written by Nebula tooling
    /// (the embedded public half must match) or a bare 32-byte seed.
    pub fn from_pem(input: &[u8]) -> Result<Self, CryptoError> {
        let raw = Zeroizing::new(decode_pem(input, ED25519_PRIVATE_KEY_BANNER)?);
        let key = match raw.len() {
            64 => {
                let mut bytes = Zeroizing::new([0u8; 64]);
                bytes.copy_from_slice(&raw);
                SigningKey::from_keypair_bytes(&bytes)
                    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            }
            32 => {
                let mut seed = Zeroizing::new([0u8; 32]);
                seed.copy_from_slice(&raw);
                SigningKey::from_bytes(&seed)
            }
            found => {
                return Err(CryptoError::KeyLength {
                    expected: 64,
                    found,
                })
            }
        };
        Ok(Self { key })
    }

    pub fn to_pem(&self) -> Zeroizing<String> {
        let bytes = Zeroizing::new(self.key.to_keypair_bytes());
        Zeroizing::new(encode_pem(ED25519_PRIVATE_KEY_BANNER, bytes.as_ref()))
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    pub(crate) fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for CaSigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CaSigningKey(<redacted>)")
    }
}

/// Verify an Ed25519 signature made by `public_key`.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let public: [u8; 32] = public_key
        .try_into()
        .map_err(|_| CryptoError::KeyLength {
            expected: 32,
            found: public_key.len(),
        })?;
    let verifying =
        VerifyingKey::from_bytes(&public).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let signature =
        ed25519_dalek::Signature::from_slice(signature).map_err(|_| CryptoError::BadSignature)?;
    verifying
        .verify(message, &signature)
        .map_err(|_| CryptoError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_keypair_pem_uses_nebula_banners() {
        let kp = NodeKeyPair::generate();
        assert!(kp
            .private_key_pem()
            .starts_with("-----BEGIN NEBULA X25519 PRIVATE KEY-----\n"));
    }

    #[test]
    fn node_public_key_derives_from_private() {
        let kp = NodeKeyPair::generate();
        let raw = decode_pem(kp.private_key_pem().as_bytes(), X25519_PRIVATE_KEY_BANNER).unwrap();
        let mut private = [0u8; 32];
        private.copy_from_slice(&raw);
        let derived = x25519_dalek::x25519(private, x25519_dalek::X25519_BASEPOINT_BYTES);
        assert_eq!(derived, kp.public_key());
    }

    #[test]
    fn node_keypairs_are_unique() {
        assert_ne!(
            NodeKeyPair::generate().public_key(),
            NodeKeyPair::generate().public_key()
        );
    }

    #[test]
    fn ca_key_pem_reload_keeps_public_key() {
        let key = CaSigningKey::generate();
        let reloaded = CaSigningKey::from_pem(key.to_pem().as_bytes()).unwrap();
        assert_eq!(key.public_key(), reloaded.public_key());
    }

    #[test]
    fn ca_key_rejects_wrong_banner() {
        let kp = NodeKeyPair::generate();
        let err = CaSigningKey::from_pem(kp.private_key_pem().as_bytes()).unwrap_err();
        assert!(matches!(err, CryptoError::Banner { .. }));
    }

    #[test]
    fn ca_key_rejects_mismatched_public_half() {
        let a = CaSigningKey::generate();
        let b = CaSigningKey::generate();
        let mut bytes = a.key.to_keypair_bytes().to_vec();
        bytes[32..].copy_from_slice(&b.public_key());
        let pem = encode_pem(ED25519_PRIVATE_KEY_BANNER, &bytes);
        assert!(CaSigningKey::from_pem(pem.as_bytes()).is_err());
    }

    #[test]
    fn signatures_verify_only_for_signed_message() {
        let key = CaSigningKey::generate();
        let sig = key.sign(b"details");
        assert!(verify_signature(&key.public_key(), b"details", &sig).is_ok());
        assert!(verify_signature(&key.public_key(), b"tampered", &sig).is_err());
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = CaSigningKey::generate();
        assert_eq!(format!("{key:?}"), "CaSigningKey(<redacted>)");
    }
}
