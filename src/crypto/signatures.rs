//! ECDSA signing and verification
//!
//! Deterministic (RFC 6979) low-S signatures over SHA-256 of the
//! message. Verification is total: malformed input of any kind returns
//! false rather than an error, and high-S signatures are rejected to
//! close the malleability path.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, Secp256k1, SecretKey};

use super::keys::{parse_public_key, PublicKeyBytes};
use super::{sha256, CryptoError, CryptoResult};

/// Compact signature length in bytes (r || s).
pub const SIGNATURE_LEN: usize = 64;

/// Sign `msg` with the private scalar, returning the 64-byte compact
/// signature.
///
/// The digest is SHA-256 of the message; libsecp256k1 produces
/// deterministic nonces, so the same inputs always yield the same
/// signature, and s is already normalized to the low half of the order.
pub fn sign(secret: &[u8; 32], msg: &[u8]) -> CryptoResult<[u8; SIGNATURE_LEN]> {
    let secp = Secp256k1::new();
    let secret_key =
        SecretKey::from_slice(secret).map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
    let digest = Message::from_digest_slice(&sha256(msg))
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    Ok(secp.sign_ecdsa(&digest, &secret_key).serialize_compact())
}

/// Verify a compact signature over `msg` against a raw public key.
///
/// Returns false for any defect: wrong signature length, a point that
/// is not on the curve, r or s of zero, s above half the curve order,
/// or a digest mismatch. Never panics or errors on attacker input.
pub fn verify(public_key: &PublicKeyBytes, msg: &[u8], signature: &[u8]) -> bool {
    if signature.len() != SIGNATURE_LEN {
        return false;
    }
    let key = match parse_public_key(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };
    let sig = match Signature::from_compact(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    // Reject the malleable high-S encoding outright. normalize_s is a
    // no-op exactly when s is already in the low half.
    let mut normalized = sig;
    normalized.normalize_s();
    if normalized != sig {
        return false;
    }

    let digest = match Message::from_digest_slice(&sha256(msg)) {
        Ok(digest) => digest,
        Err(_) => return false,
    };
    let secp = Secp256k1::new();
    secp.verify_ecdsa(&digest, &sig, &key).is_ok()
}

/// Hex-string convenience used at serialization boundaries.
pub fn verify_hex(public_key: &PublicKeyBytes, msg: &[u8], signature_hex: &str) -> bool {
    match hex::decode(signature_hex) {
        Ok(bytes) => verify(public_key, msg, &bytes),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::KeyPair;

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let pair = KeyPair::generate();
        let msg = b"transfer 12 coins";
        let sig = sign(pair.secret_bytes(), msg).unwrap();
        assert!(verify(pair.public_bytes(), msg, &sig));
    }

    #[test]
    fn test_signatures_deterministic() {
        let pair = KeyPair::generate();
        let msg = b"same message";
        assert_eq!(
            sign(pair.secret_bytes(), msg).unwrap(),
            sign(pair.secret_bytes(), msg).unwrap()
        );
    }

    #[test]
    fn test_tampered_message_fails() {
        let pair = KeyPair::generate();
        let sig = sign(pair.secret_bytes(), b"original").unwrap();
        assert!(!verify(pair.public_bytes(), b"tampered", &sig));
    }

    #[test]
    fn test_every_flipped_signature_bit_fails() {
        let pair = KeyPair::generate();
        let msg = b"bit flip sweep";
        let sig = sign(pair.secret_bytes(), msg).unwrap();

        for byte in 0..SIGNATURE_LEN {
            let mut mutated = sig;
            mutated[byte] ^= 0x01;
            assert!(
                !verify(pair.public_bytes(), msg, &mutated),
                "flip at byte {byte} accepted"
            );
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let signer = KeyPair::generate();
        let other = KeyPair::generate();
        let msg = b"who signed this";
        let sig = sign(signer.secret_bytes(), msg).unwrap();
        assert!(!verify(other.public_bytes(), msg, &sig));
    }

    #[test]
    fn test_malformed_signatures_return_false() {
        let pair = KeyPair::generate();
        let msg = b"malformed cases";

        assert!(!verify(pair.public_bytes(), msg, &[]));
        assert!(!verify(pair.public_bytes(), msg, &[0u8; 63]));
        assert!(!verify(pair.public_bytes(), msg, &[0u8; 65]));
        assert!(!verify(pair.public_bytes(), msg, &[0u8; 64]));

        // r = 0 with a plausible s
        let mut zero_r = [0u8; 64];
        zero_r[32..].copy_from_slice(&sign(pair.secret_bytes(), msg).unwrap()[32..]);
        assert!(!verify(pair.public_bytes(), msg, &zero_r));

        assert!(!verify_hex(pair.public_bytes(), msg, "not hex"));
    }

    #[test]
    fn test_high_s_rejected() {
        // Curve order n of secp256k1.
        let n_bytes: [u8; 32] =
            hex::decode("fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141")
                .unwrap()
                .try_into()
                .unwrap();

        let pair = KeyPair::generate();
        let msg = b"high s";
        let sig = sign(pair.secret_bytes(), msg).unwrap();
        assert!(verify(pair.public_bytes(), msg, &sig));

        // Forge the malleated twin: s' = n - s. Same r, still a valid
        // curve equation, but the encoding we must refuse.
        let mut s = [0u8; 32];
        s.copy_from_slice(&sig[32..]);
        let mut high_s = [0u8; 32];
        let mut borrow = 0i16;
        for i in (0..32).rev() {
            let diff = n_bytes[i] as i16 - s[i] as i16 - borrow;
            if diff < 0 {
                high_s[i] = (diff + 256) as u8;
                borrow = 1;
            } else {
                high_s[i] = diff as u8;
                borrow = 0;
            }
        }
        let mut malleated = sig;
        malleated[32..].copy_from_slice(&high_s);
        assert!(!verify(pair.public_bytes(), msg, &malleated));
    }

    #[test]
    fn test_empty_and_binary_messages() {
        let pair = KeyPair::generate();

        let sig = sign(pair.secret_bytes(), b"").unwrap();
        assert!(verify(pair.public_bytes(), b"", &sig));

        let binary: Vec<u8> = (0u16..256).map(|b| b as u8).collect();
        let sig = sign(pair.secret_bytes(), &binary).unwrap();
        assert!(verify(pair.public_bytes(), &binary, &sig));
    }
}
