//! OAuth state tokens and PKCE (RFC 7636) verifier/challenge pairs.
//!
//! Everything here is pure; callers persist the generated values on the
//! OAuth state row.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use sha2::{Digest, Sha256};

const STATE_BYTES: usize = 32;
const VERIFIER_BYTES: usize = 64;

/// Generate a URL-safe state token carrying 256 bits of entropy (43 characters).
pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::thread_rng().fill(&mut bytes);

    URL_SAFE_NO_PAD.encode(bytes)
}

/// PKCE code verifier (random string).
#[derive(Clone, PartialEq, Eq)]
pub struct CodeVerifier(String);

impl CodeVerifier {
    /// Generate a new random verifier of 86 characters, inside the 43..=128 range of RFC 7636.
    pub fn generate() -> Self {
        let mut bytes = [0u8; VERIFIER_BYTES];
        rand::thread_rng().fill(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// S256 challenge for this verifier.
    pub fn challenge(&self) -> String {
        code_challenge(&self.0)
    }
}

impl std::fmt::Debug for CodeVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CodeVerifier([REDACTED])")
    }
}

/// URL-safe base64 (no padding) of SHA-256 over the verifier.
pub fn code_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_url_safe(value: &str) -> bool {
        value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    #[test]
    fn state_is_url_safe_and_unique() {
        let first = generate_state();
        let second = generate_state();

        assert_ne!(first, second);
        assert_eq!(first.len(), 43);
        assert!(is_url_safe(&first));
    }

    #[test]
    fn verifier_length_is_within_rfc_bounds() {
        let verifier = CodeVerifier::generate();

        assert_eq!(verifier.as_str().len(), 86);
        assert!((43..=128).contains(&verifier.as_str().len()));
        assert!(is_url_safe(verifier.as_str()));
    }

    #[test]
    fn challenge_matches_rfc_7636_appendix_b() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

        assert_eq!(
            code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn challenge_is_deterministic() {
        let verifier = CodeVerifier("abc123".repeat(8));

        assert_eq!(verifier.challenge(), verifier.challenge());
        assert_eq!(verifier.challenge(), code_challenge(verifier.as_str()));
        assert_ne!(verifier.challenge(), CodeVerifier::generate().challenge());
    }

    #[test]
    fn debug_output_hides_verifier() {
        let verifier = CodeVerifier("super-secret-verifier".to_string());

        assert!(!format!("{:?}", verifier).contains("super-secret"));
    }
}
