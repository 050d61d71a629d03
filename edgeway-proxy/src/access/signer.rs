//! HMAC signing of playback URLs and caller identities.

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Hex characters kept from the MAC for a URL token.
pub const TOKEN_LEN: usize = 16;
/// Hex characters kept from the MAC for an identity handle.
pub const HANDLE_LEN: usize = 8;

/// Signs `(path, credential, expiry)` triples and derives identity handles.
#[derive(Clone)]
pub struct UrlSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").finish_non_exhaustive()
    }
}

impl UrlSigner {
    /// Create a signer keyed with `secret`.
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, InvalidLength> {
        Ok(Self {
            mac: HmacSha256::new_from_slice(secret.as_ref())?,
        })
    }

    fn truncated_mac(&self, message: &[u8], len: usize) -> String {
        let mut mac = self.mac.clone();
        mac.update(message);
        let mut digest = hex::encode(mac.finalize().into_bytes());
        digest.truncate(len);
        digest
    }

    /// The token for `path` requested by `credential`, valid until `expires`.
    pub fn token(&self, path: &str, credential: &str, expires: i64) -> String {
        let message = format!("{path}:{credential}:{expires}");
        self.truncated_mac(message.as_bytes(), TOKEN_LEN)
    }

    /// The opaque handle that stands in for `credential` in client URLs.
    pub fn identity_handle(&self, credential: &str) -> String {
        self.truncated_mac(credential.as_bytes(), HANDLE_LEN)
    }

    /// Recompute the token and compare it with `presented` in constant time.
    pub fn token_matches(
        &self,
        path: &str,
        credential: &str,
        expires: i64,
        presented: &str,
    ) -> bool {
        let expected = self.token(path, credential, expires);
        expected.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> UrlSigner {
        UrlSigner::new("test-secret").unwrap()
    }

    #[test]
    fn token_and_handle_lengths() {
        let signer = signer();
        let token = signer.token("/internal/a.mkv", "key", 1_700_000_000);
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(signer.identity_handle("key").len(), HANDLE_LEN);
    }

    #[test]
    fn tokens_are_deterministic() {
        let signer = signer();
        assert_eq!(
            signer.token("/internal/a.mkv", "key", 10),
            signer.token("/internal/a.mkv", "key", 10)
        );
        assert_eq!(signer.identity_handle("key"), signer.identity_handle("key"));
    }

    #[test]
    fn every_input_is_bound() {
        let signer = signer();
        let token = signer.token("/internal/a.mkv", "key", 10);
        assert!(signer.token_matches("/internal/a.mkv", "key", 10, &token));
        assert!(!signer.token_matches("/internal/b.mkv", "key", 10, &token));
        assert!(!signer.token_matches("/internal/a.mkv", "other", 10, &token));
        assert!(!signer.token_matches("/internal/a.mkv", "key", 11, &token));
        assert!(!signer.token_matches("/internal/a.mkv", "key", 10, &token[..15]));
    }

    #[test]
    fn matches_known_vector() {
        // HMAC-SHA256("test-secret", "/p:k:1")
        let signer = signer();
        let mut mac = HmacSha256::new_from_slice(b"test-secret").unwrap();
        mac.update(b"/p:k:1");
        let full = hex::encode(mac.finalize().into_bytes());
        assert_eq!(signer.token("/p", "k", 1), full[..TOKEN_LEN]);
    }

    #[test]
    fn different_secrets_disagree() {
        let a = UrlSigner::new("one").unwrap();
        let b = UrlSigner::new("two").unwrap();
        assert_ne!(a.token("/p", "k", 1), b.token("/p", "k", 1));
    }
}
