//! Shared-secret viewer authentication.
//!
//! Viewers prove knowledge of `[auth] token` either with a `?token=` query
//! parameter on the WebSocket upgrade or with an `auth` message as the first
//! frame (the only option for connections arriving through the relay).

/// Shared secret, compared in constant time.
#[derive(Clone)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Whether `provided` equals the configured token.
    pub fn verify(&self, provided: &str) -> bool {
        constant_time_eq(self.0.as_bytes(), provided.as_bytes())
    }

    /// The compiled-in placeholder is still in use.
    pub fn is_default(&self) -> bool {
        self.0 == "change-me"
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(..)")
    }
}

/// Constant-time byte comparison.
///
/// Work is proportional to `expected.len()` only, so response timing reveals
/// neither the matching prefix nor the secret's length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let len_diff = u8::from(expected.len() != provided.len());
    let diff = expected.iter().enumerate().fold(len_diff, |acc, (i, e)| {
        acc | (e ^ provided.get(i).copied().unwrap_or(!e))
    });
    diff == 0
}
