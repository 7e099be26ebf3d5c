use axum::http::{HeaderMap, header};
use rand::RngCore;
use subtle::ConstantTimeEq;

/// 256-bit per-instance secret gating every request to a [`crate::file_server::ProjectFileServer`].
///
/// Tokens are never persisted (spec §4.1 Data model, §9 "Ephemeral token
/// storage") and never logged; only their presence/absence is logged on
/// auth failure.
#[derive(Clone)]
pub struct AccessToken([u8; 32]);

impl AccessToken {
    /// Mint a fresh, cryptographically random token.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// ASCII-hex representation used in URLs and the `Authorization` header
    /// (spec §6: "Tokens are ASCII hex, 64 characters").
    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Constant-time comparison against a hex string extracted from a
    /// request. Differing lengths are still compared against a
    /// length-matched dummy buffer so the comparison path does not branch
    /// on the attacker-controlled input length (spec §4.2).
    pub fn matches(&self, candidate: &str) -> bool {
        let expected = self.as_hex();
        let expected_bytes = expected.as_bytes();
        let candidate_bytes = candidate.as_bytes();

        if candidate_bytes.len() == expected_bytes.len() {
            bool::from(candidate_bytes.ct_eq(expected_bytes))
        } else {
            // Still perform a same-cost comparison against a padded dummy
            // of the expected length, then unconditionally report failure.
            let mut padded = vec![0u8; expected_bytes.len()];
            let take = candidate_bytes.len().min(padded.len());
            padded[..take].copy_from_slice(&candidate_bytes[..take]);
            let _ = bool::from(padded.as_slice().ct_eq(expected_bytes));
            false
        }
    }
}

/// Extracts the bearer token from a request's `Authorization` header or
/// `token` query parameter (spec §4.2, §6).
pub fn extract_token(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(auth_val) = headers.get(header::AUTHORIZATION) {
        if let Ok(auth_str) = auth_val.to_str() {
            if let Some(rest) = auth_str.strip_prefix("Bearer ") {
                return Some(rest.trim().to_string());
            }
        }
    }

    if let Some(q) = query {
        for (k, v) in url::form_urlencoded::parse(q.as_bytes()) {
            if k == "token" {
                return Some(v.into_owned());
            }
        }
    }

    None
}
