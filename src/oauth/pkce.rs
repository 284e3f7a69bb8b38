//! PKCE (RFC 7636) verifier/challenge pairs and state tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// The only challenge method this client sends.
pub const CHALLENGE_METHOD: &str = "S256";

/// A code verifier and its S256 challenge.
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// Fresh verifier of 64 unreserved characters from two v4 UUIDs.
    pub fn generate() -> Self {
        let verifier = format!("{}{}", random_hex(), random_hex());
        let challenge = challenge_for(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

/// `BASE64URL(SHA256(verifier))` without padding.
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Unguessable one-time state token for the authorization request.
pub fn generate_state() -> String {
    format!("{}{}", random_hex(), random_hex())
}

fn random_hex() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc7636_appendix_b_vector() {
        assert_eq!(
            challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_generated_pair_is_consistent() {
        let pair = PkcePair::generate();
        assert_eq!(pair.verifier.len(), 64);
        assert_eq!(pair.challenge, challenge_for(&pair.verifier));
        assert!(!pair.challenge.contains('='));
    }

    #[test]
    fn test_state_tokens_are_unique() {
        let a = generate_state();
        let b = generate_state();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
    }
}
