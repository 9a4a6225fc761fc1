//! # Cryptographic Infrastructure
//!
//! Primitives shared by the message protocol:
//!
//! - **Signatures**: domain-separated Ed25519 signing and verification over
//!   serialized message bodies
//! - **Hybrid sealing**: per-datagram symmetric encryption keyed by an
//!   ephemeral X25519 agreement against the recipient's public key
//!
//! ## Identity model
//!
//! Each node has exactly one Ed25519 keypair. The same key pair serves both
//! roles: signatures verify against the Ed25519 public key directly, and the
//! encryption side converts it to its X25519 (Montgomery) form so that a peer
//! learned via `PING` can immediately receive sealed datagrams.
//!
//! ## Sealing format
//!
//! `seal` derives a fresh 32-byte symmetric key per datagram:
//!
//! ```text
//! shared  = X25519(ephemeral_secret, recipient_montgomery)
//! sym_key = blake3::derive_key(SEAL_KDF_CONTEXT, shared)
//! output  = ephemeral_public(32) || nonce(12) || chacha20poly1305(sym_key, plaintext)
//! ```
//!
//! The AEAD tag covers the whole signed body, so tampering with a sealed
//! datagram is detected before the signature is even examined. Decryption
//! failures fail closed; no partial plaintext is ever surfaced.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};

use crate::identity::Keypair;

// ============================================================================
// Domain Separation
// ============================================================================
//
// Signatures over message bodies carry a protocol prefix so they cannot be
// replayed in another context that happens to sign the same byte string.

/// Domain separation prefix for datagram body signatures.
pub const BODY_SIGNATURE_DOMAIN: &[u8] = b"grapnel-body-v1:";

/// KDF context string for the per-datagram symmetric key.
const SEAL_KDF_CONTEXT: &str = "grapnel-seal-v1";

/// ChaCha20-Poly1305 nonce length.
const NONCE_LEN: usize = 12;

/// X25519 public key length.
const EPHEMERAL_LEN: usize = 32;

// ============================================================================
// Errors
// ============================================================================

/// Signature verification failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Sealing or opening failure. Deliberately carries no detail beyond the
/// phase that failed; callers drop the datagram either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SealError {
    /// Recipient public key is not a valid Ed25519 point.
    InvalidRecipientKey,
    /// Ciphertext too short to contain ephemeral key and nonce.
    Truncated,
    /// AEAD decryption or authentication failed.
    OpenFailed,
    /// AEAD encryption failed.
    SealFailed,
}

impl std::fmt::Display for SealError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SealError::InvalidRecipientKey => {
                write!(f, "recipient key is not a valid Ed25519 point")
            }
            SealError::Truncated => write!(f, "sealed payload truncated"),
            SealError::OpenFailed => write!(f, "sealed payload failed to open"),
            SealError::SealFailed => write!(f, "sealing failed"),
        }
    }
}

impl std::error::Error for SealError {}

// ============================================================================
// Domain-Separated Signatures
// ============================================================================

/// Sign data with the body domain prefix. Returns the 64-byte signature.
pub fn sign_body(keypair: &Keypair, data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(BODY_SIGNATURE_DOMAIN.len() + data.len());
    prefixed.extend_from_slice(BODY_SIGNATURE_DOMAIN);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a body signature against a raw Ed25519 public key.
pub fn verify_body(
    public_key: &[u8; 32],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(BODY_SIGNATURE_DOMAIN.len() + data.len());
    prefixed.extend_from_slice(BODY_SIGNATURE_DOMAIN);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// Hybrid Sealing (ephemeral X25519 + ChaCha20-Poly1305)
// ============================================================================

/// Seal `plaintext` for the holder of `recipient_ed25519` (raw public key).
pub fn seal(plaintext: &[u8], recipient_ed25519: &[u8; 32]) -> Result<Vec<u8>, SealError> {
    let recipient = VerifyingKey::from_bytes(recipient_ed25519)
        .map_err(|_| SealError::InvalidRecipientKey)?;
    let recipient_x25519 = X25519Public::from(recipient.to_montgomery().to_bytes());

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519Public::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient_x25519);
    let sym_key = blake3::derive_key(SEAL_KDF_CONTEXT, shared.as_bytes());

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&sym_key));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| SealError::SealFailed)?;

    let mut out = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed payload with our keypair. Fails closed on any malformation.
pub fn open(sealed: &[u8], keypair: &Keypair) -> Result<Vec<u8>, SealError> {
    if sealed.len() < EPHEMERAL_LEN + NONCE_LEN {
        return Err(SealError::Truncated);
    }
    let (ephemeral_bytes, rest) = sealed.split_at(EPHEMERAL_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(ephemeral_bytes);
    let ephemeral_public = X25519Public::from(ephemeral);

    let secret = StaticSecret::from(keypair.x25519_scalar_bytes());
    let shared = secret.diffie_hellman(&ephemeral_public);
    let sym_key = blake3::derive_key(SEAL_KDF_CONTEXT, shared.as_bytes());

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&sym_key));
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| SealError::OpenFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_with_domain() {
        let keypair = Keypair::generate();
        let sig = sign_body(&keypair, b"payload");

        assert!(verify_body(&keypair.public_key_bytes(), b"payload", &sig).is_ok());
        assert_eq!(
            verify_body(&keypair.public_key_bytes(), b"other", &sig),
            Err(SignatureError::VerificationFailed)
        );

        let other = Keypair::generate();
        assert_eq!(
            verify_body(&other.public_key_bytes(), b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn bad_signature_length_rejected() {
        let keypair = Keypair::generate();
        assert_eq!(
            verify_body(&keypair.public_key_bytes(), b"x", &[0u8; 10]),
            Err(SignatureError::InvalidLength)
        );
    }

    #[test]
    fn seal_open_round_trip() {
        let recipient = Keypair::generate();
        let sealed = seal(b"secret datagram", &recipient.public_key_bytes()).unwrap();

        assert_ne!(&sealed[EPHEMERAL_LEN + NONCE_LEN..], b"secret datagram");
        let opened = open(&sealed, &recipient).unwrap();
        assert_eq!(opened, b"secret datagram");
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let recipient = Keypair::generate();
        let eavesdropper = Keypair::generate();
        let sealed = seal(b"secret", &recipient.public_key_bytes()).unwrap();

        assert_eq!(open(&sealed, &eavesdropper), Err(SealError::OpenFailed));
    }

    #[test]
    fn truncated_sealed_payload_rejected() {
        let recipient = Keypair::generate();
        assert_eq!(open(&[0u8; 16], &recipient), Err(SealError::Truncated));
    }

    #[test]
    fn sealing_is_randomized() {
        let recipient = Keypair::generate();
        let a = seal(b"same plaintext", &recipient.public_key_bytes()).unwrap();
        let b = seal(b"same plaintext", &recipient.public_key_bytes()).unwrap();
        assert_ne!(a, b);
    }
}
