use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::context::RequestContext;
use crate::errors::GatewayError;
use crate::security::Credentials;
use crate::stream::ChunkDelta;

/// One open upstream stream. Lazy, finite, non-restartable; dropping it
/// releases the underlying connection.
///
/// `Err(GatewayError::Protocol(_))` items are per-delta and the stream may
/// continue after them; any other error ends the attempt.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChunkDelta, GatewayError>> + Send>>;

/// Where and how to reach one provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub provider_key: String,
    pub base_url: String,
}

impl Endpoint {
    pub fn new(provider_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            provider_key: provider_key.into(),
            base_url: base_url.into(),
        }
    }

    /// The base URL to use with these credentials.
    pub fn resolve<'a>(&'a self, credentials: &'a Credentials) -> &'a str {
        credentials.endpoint_override().unwrap_or(&self.base_url)
    }
}

/// Opens upstream streams. Implemented over HTTP in production and by a
/// scripted double in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_stream(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        request: &RequestContext,
    ) -> Result<ChunkStream, GatewayError>;
}
