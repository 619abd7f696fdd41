//! PKCE (RFC 7636) code verifier/challenge generation. S256 only — plain is
//! not offered since every upstream worth talking to supports S256.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = Self::challenge_for(&verifier);
        Self { verifier, challenge }
    }

    fn challenge_for(verifier: &str) -> String {
        let digest = Sha256::digest(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }
}

/// Opaque CSRF state parameter, one per flow attempt.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifier_and_challenge_are_distinct_and_deterministic() {
        let pair = PkcePair::generate();
        assert_ne!(pair.verifier, pair.challenge);
        assert_eq!(PkcePair::challenge_for(&pair.verifier), pair.challenge);
    }

    #[test]
    fn state_values_are_not_trivially_repeated() {
        let a = generate_state();
        let b = generate_state();
        assert_ne!(a, b);
    }
}
