use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Future, Stream};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use tracing::{debug, instrument, warn};

use switchboard_core::{
    ChunkDelta, ChunkStream, Credentials, Endpoint, GatewayError, RequestContext, Transport,
    TransportKind,
};

use crate::dialect::{Decoded, Dialect, DialectDecoder};
use crate::sse::{SseEvent, SseFramer};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Per-provider wire settings.
#[derive(Clone, Debug)]
pub struct HttpProvider {
    pub dialect: Dialect,
    pub idle_timeout: Duration,
}

impl Default for HttpProvider {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            idle_timeout: SSE_IDLE_TIMEOUT,
        }
    }
}

/// Streams chat completions over HTTP + SSE.
pub struct HttpTransport {
    client: Client,
    providers: HashMap<String, HttpProvider>,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| GatewayError::transport(TransportKind::Connect, e.to_string()))?;
        Ok(Self {
            client,
            providers: HashMap::new(),
        })
    }

    pub fn with_provider(mut self, provider_key: impl Into<String>, provider: HttpProvider) -> Self {
        self.providers.insert(provider_key.into(), provider);
        self
    }

    fn provider(&self, provider_key: &str) -> HttpProvider {
        self.providers.get(provider_key).cloned().unwrap_or_else(|| {
            debug!(provider = provider_key, "no wire settings, using defaults");
            HttpProvider::default()
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip_all, fields(provider = %endpoint.provider_key, model = %request.model_id))]
    async fn open_stream(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
        request: &RequestContext,
    ) -> Result<ChunkStream, GatewayError> {
        let provider = self.provider(&endpoint.provider_key);
        let url = format!(
            "{}{}",
            endpoint.resolve(credentials).trim_end_matches('/'),
            provider.dialect.path()
        );

        let mut req = self
            .client
            .post(&url)
            .header("accept", "text/event-stream")
            .json(&provider.dialect.request_body(request));
        for (name, value) in provider.dialect.auth_headers(credentials) {
            req = req.header(name, value);
        }

        let resp = req.send().await.map_err(classify_send_error)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let retry_after = parse_retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            let error = GatewayError::from_status(status, &body, retry_after);
            warn!(status, kind = error.error_kind(), "upstream rejected request");
            return Err(error);
        }

        Ok(Box::pin(SseDeltaStream::with_idle_timeout(
            resp.bytes_stream(),
            provider.dialect.decoder(),
            provider.idle_timeout,
        )))
    }
}

fn classify_send_error(e: reqwest::Error) -> GatewayError {
    let kind = if e.is_timeout() {
        TransportKind::Timeout
    } else if e.is_connect() {
        TransportKind::Connect
    } else {
        TransportKind::Read
    };
    GatewayError::transport(kind, e.to_string())
}

/// `Retry-After` in delta-seconds. HTTP-date values, negatives and values
/// too large for a `Duration` are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = raw.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Wraps a response byte stream and yields decoded deltas.
/// If no bytes arrive within `idle_duration`, yields a timeout error and ends.
struct SseDeltaStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    framer: SseFramer,
    decoder: DialectDecoder,
    pending: VecDeque<Result<ChunkDelta, GatewayError>>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    done: bool,
}

impl SseDeltaStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
        decoder: DialectDecoder,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            framer: SseFramer::new(),
            decoder,
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            done: false,
        }
    }

    fn decode_all(&mut self, events: Vec<SseEvent>) {
        for event in events {
            if self.done {
                return;
            }
            match self.decoder.decode(&event) {
                Ok(Decoded::Delta(delta)) => self.pending.push_back(Ok(delta)),
                Ok(Decoded::Ignore) => {}
                Ok(Decoded::Done) => self.done = true,
                Err(error) => {
                    if !error.is_protocol() {
                        self.done = true;
                    }
                    self.pending.push_back(Err(error));
                }
            }
        }
    }
}

impl Stream for SseDeltaStream {
    type Item = Result<ChunkDelta, GatewayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);

                    let events = self.framer.push(&bytes);
                    self.decode_all(events);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(GatewayError::transport(
                        TransportKind::Read,
                        e.to_string(),
                    ))));
                }
                Poll::Ready(None) => {
                    let trailing: Vec<SseEvent> = self.framer.finish().into_iter().collect();
                    self.decode_all(trailing);
                    self.done = true;
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.done = true;
                        return Poll::Ready(Some(Err(GatewayError::transport(
                            TransportKind::Timeout,
                            format!("idle timeout after {}s", self.idle_duration.as_secs()),
                        ))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use reqwest::header::HeaderValue;
    use switchboard_core::FinishReason;

    fn ok_bytes(chunks: &[&str]) -> Vec<Result<Bytes, reqwest::Error>> {
        chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn decodes_openai_chunks_split_mid_event() {
        let chunks = ok_bytes(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel",
            "lo\"}}]}\n\ndata: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"after done\"}}]}\n\n",
        ]);
        let stream = SseDeltaStream::with_idle_timeout(
            futures::stream::iter(chunks),
            Dialect::OpenaiChat.decoder(),
            SSE_IDLE_TIMEOUT,
        );
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &ChunkDelta::text("Hello"));
        assert_eq!(
            items[1].as_ref().unwrap(),
            &ChunkDelta::finish(FinishReason::Stop)
        );
    }

    #[tokio::test]
    async fn protocol_errors_do_not_end_the_stream() {
        let chunks = ok_bytes(&[
            "data: {broken\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n",
        ]);
        let stream = SseDeltaStream::with_idle_timeout(
            futures::stream::iter(chunks),
            Dialect::OpenaiChat.decoder(),
            SSE_IDLE_TIMEOUT,
        );
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].as_ref().unwrap_err().is_protocol());
        assert_eq!(items[1].as_ref().unwrap(), &ChunkDelta::text("ok"));
    }

    #[tokio::test]
    async fn in_band_error_ends_the_stream() {
        let chunks = ok_bytes(&[
            "data: {\"error\":{\"message\":\"quota\",\"code\":\"insufficient_quota\"}}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n\n",
        ]);
        let stream = SseDeltaStream::with_idle_timeout(
            futures::stream::iter(chunks),
            Dialect::OpenaiChat.decoder(),
            SSE_IDLE_TIMEOUT,
        );
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].as_ref().unwrap_err().permits_failover());
    }

    #[tokio::test]
    async fn trailing_event_without_blank_line() {
        let chunks = ok_bytes(&["data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}"]);
        let stream = SseDeltaStream::with_idle_timeout(
            futures::stream::iter(chunks),
            Dialect::OpenaiChat.decoder(),
            SSE_IDLE_TIMEOUT,
        );
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), &ChunkDelta::text("tail"));
    }

    #[tokio::test]
    async fn idle_timeout_fires_when_no_data() {
        tokio::time::pause();

        let byte_stream = futures::stream::pending::<Result<Bytes, reqwest::Error>>();
        let mut stream = Box::pin(SseDeltaStream::with_idle_timeout(
            byte_stream,
            Dialect::OpenaiChat.decoder(),
            Duration::from_secs(5),
        ));

        tokio::time::advance(Duration::from_secs(6)).await;

        let item = stream.next().await;
        assert!(
            matches!(
                &item,
                Some(Err(GatewayError::Transport {
                    kind: TransportKind::Timeout,
                    message
                })) if message.contains("idle timeout")
            ),
            "expected idle timeout, got: {item:?}"
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn idle_timeout_resets_on_data() {
        tokio::time::pause();

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, reqwest::Error>>(16);
        let mut stream = Box::pin(SseDeltaStream::with_idle_timeout(
            tokio_stream::wrappers::ReceiverStream::new(rx),
            Dialect::OpenaiChat.decoder(),
            Duration::from_secs(5),
        ));

        tx.send(Ok(Bytes::from("data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\n")))
            .await
            .unwrap();
        assert!(stream.next().await.unwrap().is_ok());

        tokio::time::advance(Duration::from_secs(4)).await;

        tx.send(Ok(Bytes::from("data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n\n")))
            .await
            .unwrap();
        assert!(stream.next().await.unwrap().is_ok());

        drop(tx);
        let item = stream.next().await;
        assert!(item.is_none(), "expected stream end, got: {item:?}");
    }

    #[test]
    fn retry_after_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(12)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn retry_after_out_of_range_is_ignored() {
        let mut headers = HeaderMap::new();
        for raw in ["1e30", "-5", "NaN", "inf", "abc"] {
            headers.insert(RETRY_AFTER, HeaderValue::from_static(raw));
            assert_eq!(parse_retry_after(&headers), None, "{raw}");
        }

        headers.insert(RETRY_AFTER, HeaderValue::from_static("1.5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn unknown_provider_uses_defaults() {
        let transport = HttpTransport::new(CONNECT_TIMEOUT)
            .unwrap()
            .with_provider(
                "claude",
                HttpProvider {
                    dialect: Dialect::AnthropicMessages,
                    idle_timeout: Duration::from_secs(30),
                },
            );
        assert_eq!(transport.provider("claude").dialect, Dialect::AnthropicMessages);
        assert_eq!(transport.provider("other").dialect, Dialect::OpenaiChat);
        assert_eq!(transport.provider("other").idle_timeout, SSE_IDLE_TIMEOUT);
    }
}
