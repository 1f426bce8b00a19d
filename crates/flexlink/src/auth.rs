//! Authentication collaborator used by the SmartLink listener.
//!
//! Acquiring a SmartLink identity token (the OAuth login against the
//! vendor's identity provider) lives outside this crate. The listener only
//! needs something that turns a credential into a token.

use async_trait::async_trait;

use flexlink_core::{Error, Result};

/// Turns a credential into a SmartLink identity token.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Obtain a token for `credential`.
    ///
    /// Failures are reported as [`Error::Authentication`].
    async fn authenticate(&self, credential: &str) -> Result<String>;
}

/// Authenticator for a token that was issued ahead of time.
///
/// The credential is ignored; the stored token is returned as-is.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl Authenticator for StaticToken {
    async fn authenticate(&self, _credential: &str) -> Result<String> {
        if self.token.trim().is_empty() {
            return Err(Error::Authentication("no token configured".into()));
        }
        Ok(self.token.clone())
    }
}

/// Authenticator that treats the credential itself as the token.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl Authenticator for PassThrough {
    async fn authenticate(&self, credential: &str) -> Result<String> {
        if credential.trim().is_empty() {
            return Err(Error::Authentication("empty credential".into()));
        }
        Ok(credential.to_string())
    }
}
