//! # Identity Primitives
//!
//! This module defines the core identity types used throughout Meshsub:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Identity`]: 32-byte public key serving as the peer's unique identifier
//!
//! ## Identity Model
//!
//! Meshsub uses a simple identity model: **Identity = Ed25519 Public Key**.
//! This provides:
//!
//! - **Self-certifying identities**: possession of the private key proves
//!   ownership, no external registry needed
//! - **Signature verification without lookup**: the claimed source of a signed
//!   message IS the verification key
//!
//! The transport collaborator is responsible for binding connections to
//! identities (e.g. via mutually-authenticated TLS); the mesh engine only
//! consumes identities it is handed.
//!
//! ## Security Invariants
//!
//! - P1: `Identity::from_bytes(bytes).as_bytes() == bytes` (round-trip preservation)
//! - P2: Only valid Ed25519 points are accepted as signing identities

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let identity = Self(bytes);

        debug_assert_eq!(
            identity.0, bytes,
            "P1 violation: Identity must preserve bytes exactly"
        );

        identity
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Check whether this identity is a usable Ed25519 verification key.
    ///
    /// Rejects the trivially-invalid all-zero and all-0xFF patterns as well
    /// as byte strings that do not decode to a curve point.
    pub fn is_valid(&self) -> bool {
        if self.0 == [0u8; 32] || self.0 == [0xFFu8; 32] {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn identity_matches_public_key() {
        for _ in 0..50 {
            let keypair = Keypair::generate();
            let identity = keypair.identity();
            let public_key = keypair.public_key_bytes();

            assert_eq!(
                *identity.as_bytes(),
                public_key,
                "P1 violation: Identity does not match public key"
            );
        }
    }

    #[test]
    fn identity_hex_round_trip() {
        let keypair = Keypair::generate();
        let identity = keypair.identity();

        let hex = identity.to_hex();
        let parsed = Identity::from_hex(&hex).expect("hex round-trip must succeed");
        assert_eq!(identity, parsed);

        assert!(Identity::from_hex("abcd").is_err());
        assert!(Identity::from_hex("not hex at all").is_err());
    }

    #[test]
    fn generated_identities_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let keypair = Keypair::generate();
            assert!(
                seen.insert(*keypair.identity().as_bytes()),
                "identity collision between fresh keypairs"
            );
        }
    }

    #[test]
    fn sign_verify_round_trip() {
        let keypair = Keypair::generate();
        let message = b"mesh control frame";

        let signature = keypair.sign(message);
        assert!(keypair.verify(message, &signature));
        assert!(!keypair.verify(b"tampered frame", &signature));
    }

    #[test]
    fn trivial_identities_are_invalid() {
        assert!(!Identity::from_bytes([0u8; 32]).is_valid());
        assert!(!Identity::from_bytes([0xFFu8; 32]).is_valid());
        assert!(Keypair::generate().identity().is_valid());
    }
}
