//! The authentication handshake run over every new connection.
//!
//! Each peer joining the network needs to prove that it owns the static key
//! behind its claimed identity. The handshake is a 3-act exchange between an
//! initiator and a responder:
//!
//! ```text
//! INITIATOR                               RESPONDER
//!
//! [Act 1]
//! nonce1 = random_nonce()
//! Act1Message{nonce1, protocol} ---->
//!                                         [Act 2]
//!                                         nonce2 = random_nonce()
//!                                         challenge = sha256(nonce1 || nonce2)
//!                                   <---- Act2Message{nonce2, challenge, protocol}
//! [Act 3]
//! challenge = sha256(nonce1 || nonce2)
//! Act3Message{challenge} ---->
//! ```
//!
//! Every act message is signed with the sender's static key by the
//! [`connection`] layer. The types in this module only represent the states
//! each side goes through; a side can only move forward by consuming the
//! message of the previous act, so acts cannot be run out of order.
//!
//! The handshake provides authentication only: no secret is shared, and the
//! connection stays in plain text.
use digest::Digest;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::HandshakeError;

pub mod connection;

pub use connection::{AllowAll, AuthenticatedConnection, Firewall};

/// The size of a challenge, in bytes.
pub const CHALLENGE_LEN: usize = 32;

pub type Challenge = [u8; CHALLENGE_LEN];

/// Sent in the first act by the initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Act1Message {
    nonce: [u8; 8],
    protocol: String,
}

/// Sent in the second act by the responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Act2Message {
    nonce: [u8; 8],
    challenge: Challenge,
    protocol: String,
}

/// Sent in the third act by the initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Act3Message {
    challenge: Challenge,
}

/// The initiator, ready to run the first act.
#[derive(Debug)]
pub struct InitiatorAct1 {
    nonce1: u64,
    protocol: String,
}

impl InitiatorAct1 {
    /// Start a new handshake for a given protocol.
    pub fn new(protocol: &str) -> Result<Self, HandshakeError> {
        Ok(Self {
            nonce1: random_nonce()?,
            protocol: protocol.to_string(),
        })
    }

    pub fn message(&self) -> Act1Message {
        Act1Message {
            nonce: self.nonce1.to_le_bytes(),
            protocol: self.protocol.clone(),
        }
    }

    pub fn next(self) -> InitiatorAct2 {
        InitiatorAct2 {
            nonce1: self.nonce1,
            protocol: self.protocol,
        }
    }
}

/// The initiator, waiting for the responder's answer.
#[derive(Debug)]
pub struct InitiatorAct2 {
    nonce1: u64,
    protocol: String,
}

impl InitiatorAct2 {
    /// Validate the responder's challenge.
    ///
    /// If the challenge doesn't match the one recomputed locally, the
    /// handshake must be aborted immediately.
    pub fn next(self, message: &Act2Message) -> Result<InitiatorAct3, HandshakeError> {
        if message.protocol != self.protocol {
            return Err(HandshakeError::UnsupportedProtocol(message.protocol.clone()));
        }

        let nonce2 = u64::from_le_bytes(message.nonce);
        let expected = hash_to_challenge(self.nonce1, nonce2);
        if !challenges_equal(&expected, &message.challenge) {
            return Err(HandshakeError::UnexpectedResponderChallenge);
        }

        Ok(InitiatorAct3 {
            challenge: message.challenge,
        })
    }
}

/// The initiator, ready to run the last act.
#[derive(Debug)]
pub struct InitiatorAct3 {
    challenge: Challenge,
}

impl InitiatorAct3 {
    pub fn message(&self) -> Act3Message {
        Act3Message {
            challenge: self.challenge,
        }
    }
}

/// The responder, ready to run the second act.
///
/// The responder has no state before receiving the first message, so there is
/// no representation for it in the first act.
#[derive(Debug)]
pub struct ResponderAct2 {
    nonce2: u64,
    challenge: Challenge,
    protocol: String,
}

impl ResponderAct2 {
    /// Answer a handshake initiated by a remote peer.
    ///
    /// This also checks that both parties run the same protocol.
    pub fn answer(message: &Act1Message, protocol: &str) -> Result<Self, HandshakeError> {
        if message.protocol != protocol {
            return Err(HandshakeError::UnsupportedProtocol(message.protocol.clone()));
        }

        let nonce1 = u64::from_le_bytes(message.nonce);
        let nonce2 = random_nonce()?;

        Ok(Self {
            nonce2,
            challenge: hash_to_challenge(nonce1, nonce2),
            protocol: protocol.to_string(),
        })
    }

    pub fn message(&self) -> Act2Message {
        Act2Message {
            nonce: self.nonce2.to_le_bytes(),
            challenge: self.challenge,
            protocol: self.protocol.clone(),
        }
    }

    pub fn next(self) -> ResponderAct3 {
        ResponderAct3 {
            challenge: self.challenge,
        }
    }
}

/// The responder, waiting for the initiator's challenge.
#[derive(Debug)]
pub struct ResponderAct3 {
    challenge: Challenge,
}

impl ResponderAct3 {
    /// Complete the handshake.
    ///
    /// Succeeds only if the initiator returned the expected challenge.
    pub fn finalize(self, message: &Act3Message) -> Result<(), HandshakeError> {
        if !challenges_equal(&self.challenge, &message.challenge) {
            return Err(HandshakeError::UnexpectedInitiatorChallenge);
        }
        Ok(())
    }
}

/// SHA256 of the little endian bytes of both nonces, in a 32 byte buffer.
fn hash_to_challenge(nonce1: u64, nonce2: u64) -> Challenge {
    let mut input = [0u8; CHALLENGE_LEN];
    input[0..8].copy_from_slice(&nonce1.to_le_bytes());
    input[8..16].copy_from_slice(&nonce2.to_le_bytes());

    Sha256::digest(input).into()
}

fn challenges_equal(a: &Challenge, b: &Challenge) -> bool {
    a[..].ct_eq(&b[..]).into()
}

fn random_nonce() -> Result<u64, HandshakeError> {
    let mut bytes = [0u8; 8];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(HandshakeError::Nonce)?;
    Ok(u64::from_le_bytes(bytes))
}
