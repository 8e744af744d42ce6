use async_trait::async_trait;

use crate::errors::SDKError;
use crate::types::{Request, Response};

/// A model backend. `name` is the key the client registers it under.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// One non-streaming completion. Rate limits must surface as
    /// `SDKError::RateLimit` so callers can retry them.
    async fn complete(&self, request: Request) -> Result<Response, SDKError>;
}
