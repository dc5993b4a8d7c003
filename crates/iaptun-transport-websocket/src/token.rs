//! Access token sources

use async_trait::async_trait;

use crate::error::RelayResult;

/// Supplies the bearer token sent with every relay handshake
#[async_trait]
pub trait TokenSource: Send + Sync + std::fmt::Debug {
    async fn access_token(&self) -> RelayResult<String>;
}

/// Token that never changes (e.g. passed on the command line)
#[derive(Clone)]
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

// Keep the token out of logs
impl std::fmt::Debug for StaticTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenSource")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> RelayResult<String> {
        Ok(self.token.clone())
    }
}
