//! Ed25519 signatures agents put on messages that leave their node.
//!
//! The signed payload is `author|content|signed_at`, with `signed_at` in
//! epoch seconds. Keys and signatures travel hex-encoded.

use crate::FederationError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Oldest signature accepted, in seconds.
pub const MAX_SIGNATURE_AGE_SECS: i64 = 24 * 60 * 60;

/// How far in the future a signature timestamp may lie, in seconds.
pub const MAX_CLOCK_SKEW_SECS: i64 = 5 * 60;

pub fn canonical_payload(author: &str, content: &str, signed_at: i64) -> String {
    format!("{author}|{content}|{signed_at}")
}

/// Signs a message as `author`. Returns the hex-encoded signature.
pub fn sign_message(key: &SigningKey, author: &str, content: &str, signed_at: i64) -> String {
    let payload = canonical_payload(author, content, signed_at);
    hex::encode(key.sign(payload.as_bytes()).to_bytes())
}

/// Hex encoding of the verifying half of `key`, as served by the key endpoint.
pub fn public_key_hex(key: &SigningKey) -> String {
    hex::encode(key.verifying_key().to_bytes())
}

fn decode_public_key(public_key_hex: &str) -> Result<VerifyingKey, FederationError> {
    let bytes = hex::decode(public_key_hex)
        .map_err(|e| FederationError::InvalidSignature(format!("invalid public key hex: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| FederationError::InvalidSignature("invalid public key length".to_string()))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| FederationError::InvalidSignature(e.to_string()))
}

fn decode_signature(signature_hex: &str) -> Result<Signature, FederationError> {
    let bytes = hex::decode(signature_hex)
        .map_err(|e| FederationError::InvalidSignature(format!("invalid signature hex: {e}")))?;
    let bytes: [u8; 64] = bytes
        .try_into()
        .map_err(|_| FederationError::InvalidSignature("invalid signature length".to_string()))?;
    Ok(Signature::from_bytes(&bytes))
}

/// Checks that `signature_hex` is `author`'s signature over the message.
///
/// `now` is epoch seconds; signatures older than [`MAX_SIGNATURE_AGE_SECS`]
/// or more than [`MAX_CLOCK_SKEW_SECS`] ahead of it are refused.
///
/// # Errors
///
/// [`FederationError::InvalidSignature`] when the timestamp is out of range,
/// the key or signature does not decode, or the signature does not match.
pub fn verify_message(
    public_key_hex: &str,
    author: &str,
    content: &str,
    signed_at: i64,
    signature_hex: &str,
    now: i64,
) -> Result<(), FederationError> {
    if now - signed_at > MAX_SIGNATURE_AGE_SECS {
        return Err(FederationError::InvalidSignature(
            "signature timestamp too old".to_string(),
        ));
    }
    if signed_at - now > MAX_CLOCK_SKEW_SECS {
        return Err(FederationError::InvalidSignature(
            "signature timestamp too far in the future".to_string(),
        ));
    }

    let public_key = decode_public_key(public_key_hex)?;
    let signature = decode_signature(signature_hex)?;
    let payload = canonical_payload(author, content, signed_at);
    public_key
        .verify(payload.as_bytes(), &signature)
        .map_err(|_| FederationError::InvalidSignature(format!("signature does not match {author}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn rejected(result: Result<(), FederationError>) -> String {
        match result {
            Err(FederationError::InvalidSignature(reason)) => reason,
            other => panic!("expected InvalidSignature, got {other:?}"),
        }
    }

    #[test]
    fn signed_message_verifies() {
        let scout = key(1);
        let signature = sign_message(&scout, "scout", "hello", NOW);
        assert_eq!(signature.len(), 128);
        verify_message(&public_key_hex(&scout), "scout", "hello", NOW, &signature, NOW).unwrap();
    }

    #[test]
    fn tampering_breaks_the_signature() {
        let scout = key(1);
        let pk = public_key_hex(&scout);
        let signature = sign_message(&scout, "scout", "hello", NOW);

        rejected(verify_message(&pk, "scout", "hello!", NOW, &signature, NOW));
        rejected(verify_message(&pk, "mallory", "hello", NOW, &signature, NOW));
        rejected(verify_message(&pk, "scout", "hello", NOW + 1, &signature, NOW));

        let forged = sign_message(&key(2), "scout", "hello", NOW);
        rejected(verify_message(&pk, "scout", "hello", NOW, &forged, NOW));
    }

    #[test]
    fn stale_and_future_timestamps_are_refused() {
        let scout = key(1);
        let pk = public_key_hex(&scout);

        let old = NOW - MAX_SIGNATURE_AGE_SECS - 1;
        let signature = sign_message(&scout, "scout", "hello", old);
        assert!(rejected(verify_message(&pk, "scout", "hello", old, &signature, NOW)).contains("old"));

        let ahead = NOW + MAX_CLOCK_SKEW_SECS + 1;
        let signature = sign_message(&scout, "scout", "hello", ahead);
        assert!(rejected(verify_message(&pk, "scout", "hello", ahead, &signature, NOW)).contains("future"));
    }

    #[test]
    fn malformed_inputs_are_rejected_not_panicking() {
        let scout = key(1);
        let signature = sign_message(&scout, "scout", "hello", NOW);
        rejected(verify_message("pk-not-hex", "scout", "hello", NOW, &signature, NOW));
        rejected(verify_message("abcd", "scout", "hello", NOW, &signature, NOW));
        rejected(verify_message(&public_key_hex(&scout), "scout", "hello", NOW, "zz", NOW));
        rejected(verify_message(&public_key_hex(&scout), "scout", "hello", NOW, "abcd", NOW));
    }
}
