//! # Datagram Envelope
//!
//! Every UDP datagram is one envelope: a single flag byte followed by a
//! bincode frame.
//!
//! ```text
//! [0x00] [ bincode(Signed { signature, body_bytes }) ]            plaintext
//! [0x01] [ seal( bincode(Signed { signature, body_bytes }) ) ]    encrypted
//! ```
//!
//! The signature inside is always over the domain-separated body bytes, so
//! encryption wraps authentication: peers that can decrypt still verify the
//! sender, and plaintext `PING`s are verifiable the moment the sender's key
//! is known.
//!
//! Opening is split in two because the receiver may not know the sender's
//! key at decode time. [`open`] peels the framing and decryption and returns
//! an [`OpenedEnvelope`]; the caller resolves the sender (routing table, or
//! the key carried in a `PING`), then calls [`OpenedEnvelope::verify`].
//! Unverifiable datagrams are dropped, never processed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, SealError, SignatureError};
use crate::identity::Keypair;
use crate::messages::{self, Body};

const FLAG_PLAINTEXT: u8 = 0;
const FLAG_ENCRYPTED: u8 = 1;

/// Signature wrapper serialized inside every envelope. `body_bytes` is the
/// encoded [`Body`], kept as bytes so verification sees exactly what was
/// signed.
#[derive(Serialize, Deserialize)]
struct Signed {
    signature: Vec<u8>,
    body_bytes: Vec<u8>,
}

// ============================================================================
// Errors
// ============================================================================

/// Malformed or unopenable datagram.
#[derive(Debug)]
pub enum ProtocolError {
    /// Datagram too short to carry a flag byte.
    Empty,
    /// Flag byte is neither plaintext nor encrypted.
    UnknownFlag(u8),
    /// bincode frame failed to decode (or exceeded the size bound).
    Decode(bincode::Error),
    /// Encrypted envelope could not be sealed or opened.
    Seal(SealError),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Empty => write!(f, "empty datagram"),
            ProtocolError::UnknownFlag(flag) => write!(f, "unknown envelope flag {flag:#04x}"),
            ProtocolError::Decode(err) => write!(f, "envelope decode failed: {err}"),
            ProtocolError::Seal(err) => write!(f, "envelope encryption failed: {err}"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Decode(err) => Some(err),
            ProtocolError::Seal(err) => Some(err),
            _ => None,
        }
    }
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Decode(err)
    }
}

impl From<SealError> for ProtocolError {
    fn from(err: SealError) -> Self {
        ProtocolError::Seal(err)
    }
}

// ============================================================================
// Sealing
// ============================================================================

/// Encode, sign, and optionally encrypt a body into one datagram.
///
/// `recipient` present selects the encrypted envelope; absent (key not yet
/// learned, or a payload that must travel plaintext) selects the signed
/// plaintext envelope.
pub fn seal_body(
    body: &Body,
    keypair: &Keypair,
    recipient: Option<&[u8; 32]>,
) -> Result<Vec<u8>, ProtocolError> {
    let body_bytes = messages::serialize(body)?;
    let signature = crypto::sign_body(keypair, &body_bytes);
    let signed = messages::serialize(&Signed {
        signature,
        body_bytes,
    })?;

    let mut datagram;
    match recipient {
        Some(public_key) => {
            let sealed = crypto::seal(&signed, public_key)?;
            datagram = Vec::with_capacity(1 + sealed.len());
            datagram.push(FLAG_ENCRYPTED);
            datagram.extend_from_slice(&sealed);
        }
        None => {
            datagram = Vec::with_capacity(1 + signed.len());
            datagram.push(FLAG_PLAINTEXT);
            datagram.extend_from_slice(&signed);
        }
    }
    Ok(datagram)
}

// ============================================================================
// Opening
// ============================================================================

/// A decoded datagram whose signature has not yet been checked.
pub struct OpenedEnvelope {
    pub body: Body,
    pub was_encrypted: bool,
    signature: Vec<u8>,
    body_bytes: Vec<u8>,
}

impl OpenedEnvelope {
    /// Check the envelope signature against the sender's public key.
    pub fn verify(&self, public_key: &[u8; 32]) -> Result<(), SignatureError> {
        crypto::verify_body(public_key, &self.body_bytes, &self.signature)
    }
}

/// Peel the framing (and, for encrypted envelopes, the seal) off a received
/// datagram. The signature is retained for a later [`OpenedEnvelope::verify`].
pub fn open(datagram: &[u8], keypair: &Keypair) -> Result<OpenedEnvelope, ProtocolError> {
    let (&flag, frame) = datagram.split_first().ok_or(ProtocolError::Empty)?;

    let signed: Signed = match flag {
        FLAG_PLAINTEXT => messages::deserialize_bounded(frame)?,
        FLAG_ENCRYPTED => {
            let opened = crypto::open(frame, keypair)?;
            messages::deserialize_bounded(&opened)?
        }
        other => return Err(ProtocolError::UnknownFlag(other)),
    };

    let body: Body = messages::deserialize_bounded(&signed.body_bytes)?;
    Ok(OpenedEnvelope {
        body,
        was_encrypted: flag == FLAG_ENCRYPTED,
        signature: signed.signature,
        body_bytes: signed.body_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{next_message_id, Payload};

    fn make_body(keypair: &Keypair) -> Body {
        Body {
            id: next_message_id(),
            node_id: keypair.node_id(),
            payload: Payload::Ping {
                public_key: keypair.public_key_bytes(),
            },
        }
    }

    #[test]
    fn plaintext_round_trip_verifies() {
        let sender = Keypair::generate();
        let receiver = Keypair::generate();
        let body = make_body(&sender);

        let datagram = seal_body(&body, &sender, None).unwrap();
        assert_eq!(datagram[0], FLAG_PLAINTEXT);

        let opened = open(&datagram, &receiver).unwrap();
        assert!(!opened.was_encrypted);
        assert_eq!(opened.body.id, body.id);
        assert_eq!(opened.body.node_id, sender.node_id());
        opened.verify(&sender.public_key_bytes()).unwrap();
    }

    #[test]
    fn encrypted_round_trip_verifies() {
        let sender = Keypair::generate();
        let receiver = Keypair::generate();
        let body = make_body(&sender);

        let datagram = seal_body(&body, &sender, Some(&receiver.public_key_bytes())).unwrap();
        assert_eq!(datagram[0], FLAG_ENCRYPTED);

        let opened = open(&datagram, &receiver).unwrap();
        assert!(opened.was_encrypted);
        opened.verify(&sender.public_key_bytes()).unwrap();
    }

    #[test]
    fn encrypted_envelope_unreadable_by_third_party() {
        let sender = Keypair::generate();
        let receiver = Keypair::generate();
        let eavesdropper = Keypair::generate();
        let body = make_body(&sender);

        let datagram = seal_body(&body, &sender, Some(&receiver.public_key_bytes())).unwrap();
        assert!(matches!(
            open(&datagram, &eavesdropper),
            Err(ProtocolError::Seal(_))
        ));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let sender = Keypair::generate();
        let receiver = Keypair::generate();
        let imposter = Keypair::generate();

        let datagram = seal_body(&make_body(&sender), &sender, None).unwrap();
        let opened = open(&datagram, &receiver).unwrap();
        assert!(opened.verify(&imposter.public_key_bytes()).is_err());
    }

    #[test]
    fn tampered_body_fails_verification() {
        let sender = Keypair::generate();
        let receiver = Keypair::generate();

        let mut datagram = seal_body(&make_body(&sender), &sender, None).unwrap();
        let last = datagram.len() - 1;
        datagram[last] ^= 0xff;

        // Flipping a bit lands either in the decode step or the signature.
        match open(&datagram, &receiver) {
            Err(_) => {}
            Ok(opened) => assert!(opened.verify(&sender.public_key_bytes()).is_err()),
        }
    }

    #[test]
    fn garbage_rejected() {
        let keypair = Keypair::generate();
        assert!(matches!(open(&[], &keypair), Err(ProtocolError::Empty)));
        assert!(matches!(
            open(&[0x07, 1, 2, 3], &keypair),
            Err(ProtocolError::UnknownFlag(0x07))
        ));
        assert!(open(&[FLAG_PLAINTEXT, 0xde, 0xad], &keypair).is_err());
    }
}
