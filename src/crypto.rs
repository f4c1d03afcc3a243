//! # Cryptographic Infrastructure
//!
//! Domain-separated Ed25519 signing and verification used by the publish
//! path and the validation pipeline.
//!
//! ## Security Properties
//!
//! - Only Ed25519 signatures are accepted (no RSA, ECDSA fallback)
//! - Domain separation prevents cross-protocol signature replay
//! - `verify_strict` rejects malleable/non-canonical signatures

use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::{Identity, Keypair};

// ============================================================================
// Signature Error Types
// ============================================================================

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
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
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================
//
// SECURITY: Domain separation prevents cross-protocol signature replay
// attacks. Each signed data type uses a unique prefix so signatures cannot
// be reused in a different context.

/// Domain separation prefix for pubsub message signatures.
pub const MESSAGE_SIGNATURE_DOMAIN: &[u8] = b"meshsub-message-v1:";

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign data with domain separation.
///
/// Prepends the domain prefix to the data before signing.
///
/// # Returns
/// 64-byte Ed25519 signature as a `Vec<u8>`
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature with domain separation.
///
/// Reconstructs the prefixed data and verifies the Ed25519 signature against
/// the claimed signer's identity (public key).
pub fn verify_with_domain(
    identity: &Identity,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(identity.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn domain_signature_round_trip() {
        let keypair = Keypair::generate();
        let identity = keypair.identity();
        let data = b"payload under test";

        let sig = sign_with_domain(&keypair, MESSAGE_SIGNATURE_DOMAIN, data);
        assert_eq!(sig.len(), 64);
        assert!(verify_with_domain(&identity, MESSAGE_SIGNATURE_DOMAIN, data, &sig).is_ok());
    }

    #[test]
    fn wrong_domain_rejected() {
        let keypair = Keypair::generate();
        let identity = keypair.identity();
        let data = b"payload under test";

        let sig = sign_with_domain(&keypair, MESSAGE_SIGNATURE_DOMAIN, data);
        assert_eq!(
            verify_with_domain(&identity, b"meshsub-other-v1:", data, &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn tampered_data_rejected() {
        let keypair = Keypair::generate();
        let identity = keypair.identity();

        let sig = sign_with_domain(&keypair, MESSAGE_SIGNATURE_DOMAIN, b"original");
        assert_eq!(
            verify_with_domain(&identity, MESSAGE_SIGNATURE_DOMAIN, b"modified", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn wrong_signer_rejected() {
        let signer = Keypair::generate();
        let other = Keypair::generate();
        let data = b"payload";

        let sig = sign_with_domain(&signer, MESSAGE_SIGNATURE_DOMAIN, data);
        assert_eq!(
            verify_with_domain(&other.identity(), MESSAGE_SIGNATURE_DOMAIN, data, &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures_rejected() {
        let keypair = Keypair::generate();
        let identity = keypair.identity();

        assert_eq!(
            verify_with_domain(&identity, MESSAGE_SIGNATURE_DOMAIN, b"data", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&identity, MESSAGE_SIGNATURE_DOMAIN, b"data", &[0u8; 17]),
            Err(SignatureError::InvalidLength)
        );
    }
}
