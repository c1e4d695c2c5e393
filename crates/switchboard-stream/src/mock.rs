use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;

use switchboard_core::{
    ChunkDelta, ChunkStream, Credentials, Endpoint, FinishReason, GatewayError, RequestContext,
    Transport,
};

type Item = Result<ChunkDelta, GatewayError>;

/// Pre-programmed upstream behavior for deterministic tests.
#[derive(Clone, Debug)]
pub enum ScriptedResponse {
    /// Yield these items, then end.
    Stream(Vec<Item>),
    /// Fail `open_stream` itself.
    Error(GatewayError),
    /// Yield these items, each after a delay.
    Slow(Duration, Vec<Item>),
    /// Yield these items, then never produce anything again.
    Stall(Vec<Item>),
    /// Wait a duration before opening.
    Delay(Duration, Box<ScriptedResponse>),
}

impl ScriptedResponse {
    /// A text reply terminated by a stop finish reason.
    pub fn text(text: &str) -> Self {
        Self::Stream(vec![
            Ok(ChunkDelta::text(text)),
            Ok(ChunkDelta::finish(FinishReason::Stop)),
        ])
    }

    pub fn deltas(deltas: Vec<ChunkDelta>) -> Self {
        Self::Stream(deltas.into_iter().map(Ok).collect())
    }

    pub fn fail(error: GatewayError) -> Self {
        Self::Error(error)
    }

    /// Yield `deltas` successfully, then fail mid-stream.
    pub fn fail_after(deltas: Vec<ChunkDelta>, error: GatewayError) -> Self {
        let mut items: Vec<Item> = deltas.into_iter().map(Ok).collect();
        items.push(Err(error));
        Self::Stream(items)
    }

    pub fn delayed(delay: Duration, inner: ScriptedResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// One recorded `open_stream` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedCall {
    pub provider_key: String,
    pub base_url: String,
    pub secret: String,
    pub model_id: String,
}

/// Transport double keyed by credential secret.
///
/// Responses scripted for a secret are consumed in order; once exhausted the
/// shared fallback queue is used, then a non-retryable error.
#[derive(Default)]
pub struct ScriptedTransport {
    by_secret: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    fallback: Mutex<VecDeque<ScriptedResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, secret: &str, responses: Vec<ScriptedResponse>) -> Self {
        self.by_secret
            .lock()
            .entry(secret.to_string())
            .or_default()
            .extend(responses);
        self
    }

    pub fn fallback(self, responses: Vec<ScriptedResponse>) -> Self {
        self.fallback.lock().extend(responses);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Secrets in the order they were used.
    pub fn secrets_used(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.secret.clone()).collect()
    }

    fn next_response(&self, secret: &str) -> Option<ScriptedResponse> {
        let scripted = self
            .by_secret
            .lock()
            .get_mut(secret)
            .and_then(VecDeque::pop_front);
        scripted.or_else(|| self.fallback.lock().pop_front())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open_stream(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        request: &RequestContext,
    ) -> Result<ChunkStream, GatewayError> {
        let secret = credentials.secret().to_string();
        self.calls.lock().push(RecordedCall {
            provider_key: endpoint.provider_key.clone(),
            base_url: endpoint.resolve(credentials).to_string(),
            secret: secret.clone(),
            model_id: request.model_id.clone(),
        });

        let Some(mut response) = self.next_response(&secret) else {
            return Err(GatewayError::Upstream {
                status: 400,
                message: format!("no scripted response for {secret}"),
            });
        };

        // Unrolled so nested delays need no recursive async.
        loop {
            match response {
                ScriptedResponse::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    response = *inner;
                }
                ScriptedResponse::Error(error) => return Err(error),
                ScriptedResponse::Stream(items) => return Ok(Box::pin(stream::iter(items))),
                ScriptedResponse::Slow(delay, items) => {
                    return Ok(Box::pin(stream::iter(items).then(move |item| async move {
                        tokio::time::sleep(delay).await;
                        item
                    })))
                }
                ScriptedResponse::Stall(items) => {
                    return Ok(Box::pin(stream::iter(items).chain(stream::pending())))
                }
            }
        }
    }
}
