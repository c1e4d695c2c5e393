//! Request orchestration: select accounts, open streams, normalize, fail over.
//!
//! One request is a strictly sequential walk over the candidate list:
//!
//! ```text
//! SelectAccount → OpenAttempt → Streaming → Success
//!                      │             │
//!                      └──── retryable failure (load balancing on) ──→ next candidate
//! ```
//!
//! An attempt that has already forwarded events is committed; a failure after
//! that point propagates instead of replaying output on another account.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use switchboard_core::{
    Account, AccountId, Credentials, Endpoint, GatewayError, RequestContext, RequestId,
    ResponseEvent, Transport, TransportKind, Usage,
};
use switchboard_stream::{StreamNormalizer, ThinkingTags, CONNECT_TIMEOUT, SSE_IDLE_TIMEOUT};
use switchboard_telemetry::{names, MetricsRecorder};

use crate::registry::AccountRegistry;
use crate::rotation::RotationState;
use crate::selector::AccountSelector;

/// How requests for one provider are routed.
#[derive(Clone, Debug)]
pub struct ProviderRoute {
    pub endpoint: Endpoint,
    pub load_balance: bool,
    pub thinking_tags: ThinkingTags,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl ProviderRoute {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            load_balance: false,
            thinking_tags: ThinkingTags::default(),
            connect_timeout: CONNECT_TIMEOUT,
            idle_timeout: SSE_IDLE_TIMEOUT,
        }
    }

    pub fn with_load_balance(mut self, load_balance: bool) -> Self {
        self.load_balance = load_balance;
        self
    }

    pub fn with_thinking_tags(mut self, tags: ThinkingTags) -> Self {
        self.thinking_tags = tags;
        self
    }

    pub fn with_timeouts(mut self, connect: Duration, idle: Duration) -> Self {
        self.connect_timeout = connect;
        self.idle_timeout = idle;
        self
    }
}

/// Summary of a request that completed with an `End` event.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestOutcome {
    pub request_id: RequestId,
    pub account_id: AccountId,
    /// Network attempts made, including the successful one.
    pub attempts: u32,
    /// Whether the request was served by an account other than the first
    /// candidate.
    pub failed_over: bool,
    pub usage: Option<Usage>,
}

/// Terminal failure of a request, carrying the last classified error.
#[derive(Debug, thiserror::Error)]
#[error("request {request_id} to {provider_key}/{model_id} failed after {attempts} attempt(s): {source}")]
pub struct RequestFailure {
    pub request_id: RequestId,
    pub provider_key: String,
    pub model_id: String,
    pub account_id: Option<AccountId>,
    pub attempts: u32,
    pub source: GatewayError,
}

impl RequestFailure {
    pub fn error(&self) -> &GatewayError {
        &self.source
    }

    pub fn is_cancelled(&self) -> bool {
        self.source.is_cancelled()
    }
}

struct AttemptError {
    error: GatewayError,
    committed: bool,
}

impl AttemptError {
    fn uncommitted(error: GatewayError) -> Self {
        Self {
            error,
            committed: false,
        }
    }
}

pub struct Orchestrator {
    registry: Arc<dyn AccountRegistry>,
    transport: Arc<dyn Transport>,
    rotation: Arc<RotationState>,
    selector: AccountSelector,
    routes: HashMap<String, ProviderRoute>,
    metrics: Arc<MetricsRecorder>,
}

impl Orchestrator {
    pub fn new(registry: Arc<dyn AccountRegistry>, transport: Arc<dyn Transport>) -> Self {
        let rotation = Arc::new(RotationState::new());
        Self {
            selector: AccountSelector::new(Arc::clone(&registry), Arc::clone(&rotation)),
            registry,
            transport,
            rotation,
            routes: HashMap::new(),
            metrics: Arc::new(MetricsRecorder::new()),
        }
    }

    pub fn with_route(mut self, provider_key: impl Into<String>, route: ProviderRoute) -> Self {
        self.routes.insert(provider_key.into(), route);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub fn rotation(&self) -> &RotationState {
        &self.rotation
    }

    /// Serve one request, forwarding every normalized event to `on_event` as
    /// soon as it is produced.
    #[instrument(
        skip_all,
        fields(request_id = %context.request_id, provider = %context.provider_key, model = %context.model_id)
    )]
    pub async fn handle_request<F>(
        &self,
        context: &RequestContext,
        mut on_event: F,
    ) -> Result<RequestOutcome, RequestFailure>
    where
        F: FnMut(ResponseEvent) + Send,
    {
        let provider = context.provider_key.as_str();
        self.metrics
            .counter_inc(names::REQUESTS_TOTAL, &[("provider", provider)], 1);

        let mut attempts = 0u32;
        let mut last_account: Option<AccountId> = None;
        let result = self
            .run(context, &mut on_event, &mut attempts, &mut last_account)
            .await;

        result.map_err(|source| {
            if source.is_cancelled() {
                info!(attempts, "request cancelled");
                self.metrics
                    .counter_inc(names::REQUESTS_CANCELLED_TOTAL, &[("provider", provider)], 1);
            } else {
                warn!(attempts, error = %source, kind = source.error_kind(), "request failed");
                self.metrics.counter_inc(
                    names::REQUESTS_FAILED_TOTAL,
                    &[("provider", provider), ("kind", source.error_kind())],
                    1,
                );
            }
            RequestFailure {
                request_id: context.request_id.clone(),
                provider_key: context.provider_key.clone(),
                model_id: context.model_id.clone(),
                account_id: last_account,
                attempts,
                source,
            }
        })
    }

    async fn run<F>(
        &self,
        context: &RequestContext,
        on_event: &mut F,
        attempts: &mut u32,
        last_account: &mut Option<AccountId>,
    ) -> Result<RequestOutcome, GatewayError>
    where
        F: FnMut(ResponseEvent) + Send,
    {
        let provider = context.provider_key.as_str();
        if context.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }

        let Some(route) = self.routes.get(provider) else {
            warn!("no route configured for provider");
            return Err(GatewayError::NoAvailableAccounts {
                provider: provider.to_string(),
            });
        };

        let candidates = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => return Err(GatewayError::Cancelled),
            candidates = self.selector.candidates(provider, &context.model_id, route.load_balance) => candidates?,
        };
        let Some(first) = candidates.first().map(|a| a.id.clone()) else {
            return Err(GatewayError::NoAvailableAccounts {
                provider: provider.to_string(),
            });
        };

        let mut last_error: Option<GatewayError> = None;
        let mut credential_miss: Option<GatewayError> = None;

        for account in &candidates {
            let Some(credentials) = self.resolve_credentials(context, account).await? else {
                self.metrics
                    .counter_inc(names::CREDENTIAL_MISSES_TOTAL, &[("provider", provider)], 1);
                credential_miss = Some(GatewayError::auth(format!(
                    "no usable credentials for account {}",
                    account.id
                )));
                continue;
            };

            if *attempts > 0 {
                self.metrics
                    .counter_inc(names::FAILOVERS_TOTAL, &[("provider", provider)], 1);
            }
            *attempts += 1;
            *last_account = Some(account.id.clone());
            self.metrics.counter_inc(
                names::ATTEMPTS_TOTAL,
                &[("provider", provider), ("account", account.id.as_str())],
                1,
            );

            let started = Instant::now();
            let result = self
                .attempt(route, &credentials, context, on_event)
                .await;
            self.metrics.histogram_observe(
                names::ATTEMPT_DURATION_MS,
                &[("provider", provider)],
                started.elapsed().as_secs_f64() * 1000.0,
            );

            match result {
                Ok(usage) => {
                    self.rotation.record(provider, &context.model_id, &account.id);
                    let failed_over = account.id != first;
                    if failed_over {
                        info!(account = %account.id, "switched account, updating sticky assignment");
                        self.registry
                            .set_sticky_assignment(provider, &context.model_id, &account.id)
                            .await;
                    }
                    debug!(account = %account.id, attempts = *attempts, "request complete");
                    return Ok(RequestOutcome {
                        request_id: context.request_id.clone(),
                        account_id: account.id.clone(),
                        attempts: *attempts,
                        failed_over,
                        usage,
                    });
                }
                Err(AttemptError { error, committed }) => {
                    if error.is_cancelled() {
                        return Err(error);
                    }
                    self.record_account_failure(&account.id, &error).await;

                    if committed || !route.load_balance || !error.permits_failover() {
                        return Err(error);
                    }
                    info!(
                        account = %account.id,
                        kind = error.error_kind(),
                        error = %error,
                        "attempt failed, trying next account"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(last_error
            .or(credential_miss)
            .unwrap_or(GatewayError::NoAvailableAccounts {
                provider: provider.to_string(),
            }))
    }

    /// `Ok(None)` is a soft failure: skip the account without counting an
    /// attempt. Only cancellation is surfaced as an error.
    async fn resolve_credentials(
        &self,
        context: &RequestContext,
        account: &Account,
    ) -> Result<Option<Credentials>, GatewayError> {
        let resolved = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => return Err(GatewayError::Cancelled),
            resolved = self.registry.get_credentials(&account.id) => resolved,
        };
        match resolved {
            Ok(Some(credentials)) => Ok(Some(credentials)),
            Ok(None) => {
                debug!(account = %account.id, "credentials unavailable, skipping account");
                Ok(None)
            }
            Err(error) => {
                warn!(account = %account.id, error = %error, "credential lookup failed, skipping account");
                Ok(None)
            }
        }
    }

    async fn record_account_failure(&self, account_id: &AccountId, error: &GatewayError) {
        match error {
            GatewayError::Quota { retry_after, .. } => {
                self.registry
                    .record_quota_exhausted(account_id, *retry_after)
                    .await;
            }
            GatewayError::Auth { .. } => self.registry.mark_expired(account_id).await,
            _ => {}
        }
    }

    /// One account, one stream. The stream is dropped before returning.
    async fn attempt<F>(
        &self,
        route: &ProviderRoute,
        credentials: &Credentials,
        context: &RequestContext,
        on_event: &mut F,
    ) -> Result<Option<Usage>, AttemptError>
    where
        F: FnMut(ResponseEvent) + Send,
    {
        let open = tokio::time::timeout(
            route.connect_timeout,
            self.transport
                .open_stream(&route.endpoint, credentials, context),
        );
        let mut stream = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => {
                return Err(AttemptError::uncommitted(GatewayError::Cancelled));
            }
            opened = open => match opened {
                Ok(Ok(stream)) => stream,
                Ok(Err(error)) => return Err(AttemptError::uncommitted(error)),
                Err(_) => {
                    return Err(AttemptError::uncommitted(GatewayError::transport(
                        TransportKind::Timeout,
                        format!("connect timeout after {}s", route.connect_timeout.as_secs()),
                    )));
                }
            },
        };

        let mut normalizer = StreamNormalizer::new(route.thinking_tags.clone());
        loop {
            let next = tokio::select! {
                biased;
                _ = context.cancel.cancelled() => {
                    return Err(AttemptError {
                        error: GatewayError::Cancelled,
                        committed: normalizer.has_emitted(),
                    });
                }
                next = tokio::time::timeout(route.idle_timeout, stream.next()) => next,
            };

            let item = match next {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => {
                    return Err(AttemptError {
                        error: GatewayError::transport(
                            TransportKind::Timeout,
                            format!("idle timeout after {}s", route.idle_timeout.as_secs()),
                        ),
                        committed: normalizer.has_emitted(),
                    });
                }
            };

            match item {
                Ok(delta) => {
                    for event in normalizer.push(&delta) {
                        on_event(event);
                    }
                }
                Err(GatewayError::Protocol(message)) => {
                    warn!(%message, "skipping malformed delta");
                    self.metrics.counter_inc(
                        names::PROTOCOL_ERRORS_TOTAL,
                        &[("provider", route.endpoint.provider_key.as_str())],
                        1,
                    );
                }
                Err(error) => {
                    return Err(AttemptError {
                        error,
                        committed: normalizer.has_emitted(),
                    });
                }
            }
        }
        drop(stream);

        for event in normalizer.finish() {
            on_event(event);
        }
        Ok(normalizer.state().usage)
    }
}
