//! The request pipeline.
//!
//! Warmup → auth → rate limits → concurrency → selection loop → forward →
//! bill → record. Retryable upstream failures re-enter selection with the
//! failed `(provider, endpoint)` excluded; billing happens on the billing
//! task, never on the client's critical path for streams.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use relay_core::classify::{Outcome, RuleEngine};
use relay_core::overrides::apply_overrides;
use relay_core::warmup::{WARMUP_TAG, match_warmup};
use relay_middleware::ConcurrencyToken;
use relay_types::{
    ActiveSession, ApiKey, CacheTtlPreference, ChainReason, LedgerEntry, MessageRequestRecord,
    Provider, ProviderChainItem, ProviderType, RelayError, ResetConfig, Scope, SessionStatus,
    SystemSettings, TokenUsage, User,
};

use crate::auth::{authenticate, bearer_token};
use crate::router::{Selection, SelectorInputs, select};
use crate::server::error::error_response;
use crate::sse::SseUsageScanner;
use crate::state::AppState;
use crate::warmup::{blocked_reason, synthesize};

const FIVE_HOURS_MS: u64 = 5 * 3600 * 1000;
const ONE_DAY_MS: u64 = 24 * 3600 * 1000;

/// The parsed ingress request handed to the pipeline.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Parsed JSON body.
    pub body: Value,
    /// `Accept` header.
    pub accept: Option<String>,
    /// `Authorization` header.
    pub authorization: Option<String>,
    /// Raw `x-api-key` header.
    pub x_api_key: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
    /// Caller-supplied session correlation id.
    pub session_id: Option<String>,
    /// Ingress path, recorded in the request log.
    pub endpoint: String,
}

/// Concurrency tokens held for the request lifetime.
#[derive(Default)]
struct TokenSet {
    tokens: Vec<ConcurrencyToken>,
}

impl TokenSet {
    fn push(&mut self, token: ConcurrencyToken) {
        self.tokens.push(token);
    }

    async fn release(self) {
        for token in self.tokens {
            token.release().await;
        }
    }
}

fn quota_error(scope: Scope, decision: relay_types::LimitDecision) -> RelayError {
    let period = decision.period.clone().unwrap_or_default();
    let retry_after_ms = match decision.reset_at {
        Some(at) => u64::try_from((at - Utc::now()).num_milliseconds().max(0)).ok(),
        None => match period.as_str() {
            "5h" => Some(FIVE_HOURS_MS),
            "24h" => Some(ONE_DAY_MS),
            _ => None,
        },
    };
    RelayError::QuotaExceeded {
        scope,
        reason: decision.reason.unwrap_or_default(),
        current: decision.current.unwrap_or_default(),
        limit: decision.limit.unwrap_or_default(),
        period,
        reset_at: decision.reset_at,
        retry_after_ms,
    }
}

/// Run the full pipeline for one `/v1/messages` request.
pub async fn dispatch(state: &AppState, inbound: InboundRequest) -> Response {
    let started = Instant::now();
    let now = Utc::now();
    let _gauge = state.enter();

    // Wire-format checks fail fast, before any ledger row exists.
    let Some(model) = inbound
        .body
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        return error_response(&RelayError::protocol("missing or non-string `model`"));
    };
    if !inbound.body.get("messages").is_some_and(Value::is_array) {
        return error_response(&RelayError::protocol("missing `messages` array"));
    }
    let accept = inbound.accept.as_deref();
    let is_streaming = inbound
        .body
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || accept.is_some_and(|a| a.contains("text/event-stream"));

    let Some(secret) = bearer_token(inbound.authorization.as_deref(), inbound.x_api_key.as_deref())
    else {
        return error_response(&RelayError::unauthenticated("missing bearer key"));
    };
    let (user, key) = match authenticate(state, &secret).await {
        Ok(pair) => pair,
        Err(err) => return error_response(&err),
    };

    let session_id = inbound
        .session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let settings = state.settings();
    if settings.warmup_interception_enabled
        && let Some(probe) = match_warmup(&inbound.body, accept)
    {
        return answer_warmup(
            state, &settings, &user, &key, &inbound, &probe, &session_id, started,
        )
        .await;
    }

    // User and key cost caps; the provider cap is a selection filter.
    let scope_checks = [
        (Scope::User, user.id.to_string(), &user.caps, &user.reset),
        (Scope::Key, key.key_hash.clone(), &key.caps, &key.reset),
    ];
    for (scope, id, caps, reset) in scope_checks {
        match state.limits.check_cost_limits(&id, scope, caps, reset, now).await {
            Ok(decision) if decision.allowed => {}
            Ok(decision) => return error_response(&quota_error(scope, decision)),
            Err(err) => return error_response(&err),
        }
    }

    let mut tokens = TokenSet::default();
    if let Some(cap) = user.caps.limit_concurrent_sessions {
        match state
            .limits
            .check_concurrency(&user.id.to_string(), Scope::User, cap)
            .await
        {
            Ok(token) => tokens.push(token),
            Err(err) => return error_response(&err),
        }
    }
    if let Some(cap) = key.caps.limit_concurrent_sessions {
        match state
            .limits
            .check_concurrency(&key.key_hash, Scope::Key, cap)
            .await
        {
            Ok(token) => tokens.push(token),
            Err(err) => {
                tokens.release().await;
                return error_response(&err);
            }
        }
    }

    let session_provider = state
        .sessions
        .provider_for(&session_id)
        .await
        .unwrap_or_default();

    let rules = state.rules.engine().await;
    let snapshot = state.registry.load();
    let key_groups: Vec<String> = key.groups().iter().map(|g| (*g).to_string()).collect();

    let deadline = (settings.request_deadline_ms > 0)
        .then(|| started + Duration::from_millis(settings.request_deadline_ms));
    let mut excluded: Vec<(i64, i64)> = Vec::new();
    let mut chain: Vec<ProviderChainItem> = Vec::new();
    let mut last_err = RelayError::no_candidates("no selection attempt made");
    let max_attempts = settings.max_retry_attempts.max(1);

    for attempt in 0..max_attempts {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            last_err = RelayError::RequestDeadline;
            break;
        }
        let inputs = SelectorInputs {
            snapshot: &snapshot,
            key_groups: key_groups.iter().map(String::as_str).collect(),
            session_provider,
            excluded: &excluded,
            now: Utc::now(),
        };
        let selection = match select(&inputs, &state.limits, &state.breakers).await {
            Ok(selection) => selection,
            Err(err) => {
                last_err = err;
                break;
            }
        };
        if attempt == 0 {
            chain.push(selection.chain_item.clone());
        }

        let mut body = inbound.body.clone();
        if let Some(audit) = apply_overrides(&selection.provider, &mut body)
            && audit.changed
        {
            tracing::debug!(provider = %selection.provider.name, changes = audit.changes.len(), "applied parameter overrides");
        }

        match forward(state, &selection, &body, is_streaming, key.cache_ttl).await {
            Ok(upstream) => {
                let mut item = ProviderChainItem::new(
                    selection.provider.name.clone(),
                    if attempt == 0 {
                        ChainReason::RequestSuccess
                    } else {
                        ChainReason::RetrySuccess
                    },
                );
                item.status_code = Some(upstream.status());
                item.cost_multiplier = Some(selection.provider.cost_multiplier);
                chain.push(item);

                let ctx = FinishCtx {
                    state: state.clone(),
                    user_id: user.id,
                    user_reset: user.reset.clone(),
                    key_id: key.id,
                    key_hash: key.key_hash.clone(),
                    key_reset: key.reset.clone(),
                    provider: Arc::clone(&selection.provider),
                    endpoint_id: selection.endpoint.id,
                    model: model.clone(),
                    session_id: session_id.clone(),
                    endpoint_path: inbound.endpoint.clone(),
                    user_agent: inbound.user_agent.clone(),
                    request_body: inbound.body.clone(),
                    is_streaming,
                    chain,
                    started,
                };
                return match upstream {
                    Upstream::Buffered {
                        status,
                        body,
                        usage,
                    } => finish_buffered(ctx, tokens, status, body, usage).await,
                    Upstream::Streaming { response } => {
                        finish_streaming(ctx, tokens, response)
                    }
                };
            }
            Err(err) => {
                let (status, message) = failure_parts(&err);
                let outcome = rules_outcome(&rules, status, &message);
                state
                    .breakers
                    .record_outcome(selection.endpoint.id, outcome, Utc::now())
                    .await;

                let reason = match outcome {
                    Outcome::ConcurrentLimited => ChainReason::ConcurrentLimitFailed,
                    Outcome::FatalFailure => {
                        if status.is_some_and(|s| (400..500).contains(&s)) {
                            ChainReason::ClientErrorNonRetryable
                        } else {
                            ChainReason::SystemError
                        }
                    }
                    _ => ChainReason::RetryFailed,
                };
                let mut item =
                    ProviderChainItem::new(selection.provider.name.clone(), reason);
                item.status_code = status;
                item.error_message = Some(message);
                chain.push(item);

                last_err = err;
                if !outcome.is_retryable() {
                    break;
                }
                excluded.push((selection.provider.id, selection.endpoint.id));
            }
        }
    }

    tokens.release().await;
    let status = last_err.status_code();
    let error_body = serde_json::json!({
        "code": last_err.code(),
        "message": last_err.to_string(),
    });
    record_request(
        state,
        MessageRequestRecord {
            id: 0,
            session_id,
            created_at: Utc::now(),
            user_id: Some(user.id),
            key_id: Some(key.id),
            model: Some(model),
            endpoint: inbound.endpoint.clone(),
            is_streaming,
            status_code: status,
            error_body: Some(error_body),
            usage: TokenUsage::default(),
            user_agent: inbound.user_agent.clone(),
            final_provider_id: None,
            provider_chain: chain,
            duration_ms: started.elapsed().as_millis() as u64,
        },
    )
    .await;
    error_response(&last_err)
}

fn rules_outcome(rules: &RuleEngine, status: Option<u16>, message: &str) -> Outcome {
    rules.classify(status, message)
}

fn failure_parts(err: &RelayError) -> (Option<u16>, String) {
    match err {
        RelayError::Upstream { status, msg, .. } => (*status, msg.clone()),
        other => (None, other.to_string()),
    }
}

enum Upstream {
    Buffered {
        status: u16,
        body: String,
        usage: TokenUsage,
    },
    Streaming {
        response: reqwest::Response,
    },
}

impl Upstream {
    fn status(&self) -> u16 {
        match self {
            Self::Buffered { status, .. } => *status,
            Self::Streaming { response } => response.status().as_u16(),
        }
    }
}

fn upstream_url(endpoint_url: &str) -> String {
    format!("{}/v1/messages", endpoint_url.trim_end_matches('/'))
}

fn apply_credentials(
    builder: reqwest::RequestBuilder,
    provider: &Provider,
) -> reqwest::RequestBuilder {
    match provider.provider_type {
        ProviderType::Claude => builder
            .header("x-api-key", provider.credential.clone())
            .header("anthropic-version", "2023-06-01"),
        ProviderType::ClaudeAuth => builder
            .bearer_auth(provider.credential.clone())
            .header("anthropic-version", "2023-06-01"),
        _ => builder.bearer_auth(provider.credential.clone()),
    }
}

async fn with_deadline<T>(
    timeout_ms: u64,
    provider: &str,
    phase: &str,
    fut: impl Future<Output = Result<T, RelayError>>,
) -> Result<T, RelayError> {
    if timeout_ms == 0 {
        return fut.await;
    }
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::provider_timeout(provider, phase)),
    }
}

fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body)
        && let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
    {
        return message.to_string();
    }
    body.chars().take(512).collect()
}

async fn forward(
    state: &AppState,
    selection: &Selection,
    body: &Value,
    is_streaming: bool,
    cache_ttl: CacheTtlPreference,
) -> Result<Upstream, RelayError> {
    let provider = &selection.provider;
    let name = provider.name.clone();
    let url = upstream_url(&selection.endpoint.url);
    let mut builder = state.http.post(&url).json(body);
    builder = apply_credentials(builder, provider);
    // The key's prompt-cache preference rides along on Anthropic dialects;
    // 5m is the upstream default and needs no opt-in header.
    if cache_ttl == CacheTtlPreference::OneHour
        && matches!(
            provider.provider_type,
            ProviderType::Claude | ProviderType::ClaudeAuth
        )
    {
        builder = builder.header("anthropic-beta", "extended-cache-ttl-2025-04-11");
    }

    if is_streaming {
        builder = builder.header(header::ACCEPT, "text/event-stream");
        let send = async {
            builder
                .send()
                .await
                .map_err(|err| RelayError::upstream(&name, None, err.to_string(), true))
        };
        let response = with_deadline(
            provider.timeouts.first_byte_timeout_streaming_ms,
            &name,
            "first_byte",
            send,
        )
        .await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            let message = extract_error_message(&text);
            return Err(RelayError::upstream(
                &name,
                Some(status),
                message,
                status >= 500 || status == 429,
            ));
        }
        Ok(Upstream::Streaming { response })
    } else {
        let exchange = async {
            let response = builder
                .send()
                .await
                .map_err(|err| RelayError::upstream(&name, None, err.to_string(), true))?;
            let status = response.status().as_u16();
            let text = response
                .text()
                .await
                .map_err(|err| RelayError::upstream(&name, Some(status), err.to_string(), true))?;
            Ok((status, text))
        };
        let (status, text) = with_deadline(
            provider.timeouts.request_timeout_non_streaming_ms,
            &name,
            "request",
            exchange,
        )
        .await?;
        if !(200..300).contains(&status) {
            let message = extract_error_message(&text);
            return Err(RelayError::upstream(
                &name,
                Some(status),
                message,
                status >= 500 || status == 429,
            ));
        }
        let usage = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("usage").cloned())
            .and_then(|u| serde_json::from_value::<TokenUsage>(u).ok())
            .unwrap_or_default();
        Ok(Upstream::Buffered {
            status,
            body: text,
            usage,
        })
    }
}

/// Everything the success paths need to bill and record.
struct FinishCtx {
    state: AppState,
    user_id: i64,
    user_reset: ResetConfig,
    key_id: i64,
    key_hash: String,
    key_reset: ResetConfig,
    provider: Arc<Provider>,
    endpoint_id: i64,
    model: String,
    session_id: String,
    endpoint_path: String,
    user_agent: Option<String>,
    request_body: Value,
    is_streaming: bool,
    chain: Vec<ProviderChainItem>,
    started: Instant,
}

impl FinishCtx {
    /// Billed cost for `usage`: raw model rate × the provider multiplier.
    fn cost(&self, usage: &TokenUsage) -> Decimal {
        self.state.pricing.cost(&self.model, usage) * self.provider.cost_multiplier
    }
}

/// Append the billable ledger row and fan the cost out to the counters.
/// Failures are logged; the client response is already committed.
async fn bill(ctx: &FinishCtx, usage: &TokenUsage, is_success: bool) {
    let cost = ctx.cost(usage);
    let created_at = Utc::now();
    let entry = LedgerEntry {
        id: 0,
        created_at,
        user_id: ctx.user_id,
        key_hash: ctx.key_hash.clone(),
        final_provider_id: ctx.provider.id,
        cost_usd: cost,
        duration_ms: ctx.started.elapsed().as_millis() as u64,
        is_success,
        blocked_by: None,
        blocked_reason: None,
    };
    match ctx.state.writer.append(entry).await {
        Ok(ledger_id) => {
            let tracked = relay_middleware::TrackedCost {
                ledger_id,
                created_at,
                cost,
                user_id: ctx.user_id,
                user_reset: ctx.user_reset.clone(),
                key_hash: ctx.key_hash.clone(),
                key_reset: ctx.key_reset.clone(),
                provider_id: ctx.provider.id,
                provider_reset: ctx.provider.reset.clone(),
            };
            if let Err(err) = ctx.state.limits.track_cost(&tracked).await {
                tracing::warn!(ledger_id, %err, "counter fan-out failed; ledger remains source of truth");
            }
        }
        Err(err) => {
            tracing::error!(%err, user_id = ctx.user_id, "billable row lost after queue retry");
        }
    }
}

async fn capture_session(ctx: &FinishCtx, response_body: Option<String>, status: SessionStatus) {
    let session = ActiveSession {
        session_id: ctx.session_id.clone(),
        request_sequence: 0,
        started_at: Utc::now(),
        headers: std::collections::BTreeMap::new(),
        request_body: Some(ctx.request_body.clone()),
        response_body,
        response_headers: std::collections::BTreeMap::new(),
        status,
        provider_id: Some(ctx.provider.id),
    };
    if let Err(err) = ctx.state.sessions.put(session).await {
        tracing::warn!(%err, "session capture failed");
    }
}

async fn record_request(state: &AppState, record: MessageRequestRecord) {
    if let Err(err) = state.ledger.record_message_request(&record).await {
        tracing::warn!(%err, "request log write failed");
    }
}

async fn finish_buffered(
    ctx: FinishCtx,
    tokens: TokenSet,
    status: u16,
    body: String,
    usage: TokenUsage,
) -> Response {
    bill(&ctx, &usage, true).await;
    ctx.state
        .breakers
        .record_outcome(ctx.endpoint_id, Outcome::Success, Utc::now())
        .await;
    capture_session(&ctx, Some(body.clone()), SessionStatus::Completed).await;
    record_request(
        &ctx.state,
        MessageRequestRecord {
            id: 0,
            session_id: ctx.session_id.clone(),
            created_at: Utc::now(),
            user_id: Some(ctx.user_id),
            key_id: Some(ctx.key_id),
            model: Some(ctx.model.clone()),
            endpoint: ctx.endpoint_path.clone(),
            is_streaming: ctx.is_streaming,
            status_code: status,
            error_body: None,
            usage,
            user_agent: ctx.user_agent.clone(),
            final_provider_id: Some(ctx.provider.id),
            provider_chain: ctx.chain.clone(),
            duration_ms: ctx.started.elapsed().as_millis() as u64,
        },
    )
    .await;
    tokens.release().await;

    let session_header =
        HeaderValue::from_str(&ctx.session_id).unwrap_or(HeaderValue::from_static("invalid"));
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-relay-session-id", session_header)
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn finish_streaming(ctx: FinishCtx, tokens: TokenSet, response: reqwest::Response) -> Response {
    let status = response.status().as_u16();
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let session_header =
        HeaderValue::from_str(&ctx.session_id).unwrap_or(HeaderValue::from_static("invalid"));

    tokio::spawn(pump_stream(ctx, tokens, response, tx));

    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-relay-session-id", session_header)
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Relay upstream chunks to the client while scanning SSE frames for usage.
/// Enforces the streaming-idle timeout; bills only when the upstream
/// confirmed completion (`message_stop`), so cancelled streams cost
/// nothing.
async fn pump_stream(
    mut ctx: FinishCtx,
    tokens: TokenSet,
    response: reqwest::Response,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let idle_ms = ctx.provider.timeouts.streaming_idle_timeout_ms;
    let mut scanner = SseUsageScanner::new();
    let mut stream = response.bytes_stream();
    let mut client_gone = false;
    let mut stream_error: Option<RelayError> = None;

    loop {
        let next = if idle_ms > 0 {
            match tokio::time::timeout(Duration::from_millis(idle_ms), stream.next()).await {
                Ok(next) => next,
                Err(_) => {
                    stream_error = Some(RelayError::provider_timeout(&ctx.provider.name, "idle"));
                    break;
                }
            }
        } else {
            stream.next().await
        };
        match next {
            Some(Ok(chunk)) => {
                scanner.feed(&chunk);
                if tx.send(Ok(chunk)).await.is_err() {
                    client_gone = true;
                    break;
                }
            }
            Some(Err(err)) => {
                stream_error = Some(RelayError::upstream(
                    &ctx.provider.name,
                    None,
                    err.to_string(),
                    true,
                ));
                break;
            }
            None => break,
        }
    }
    drop(tx);

    let completed = scanner.completed;
    let outcome = if stream_error.is_some() {
        Outcome::RetryableFailure
    } else {
        Outcome::Success
    };
    ctx.state
        .breakers
        .record_outcome(ctx.endpoint_id, outcome, Utc::now())
        .await;

    if client_gone {
        let mut item =
            ProviderChainItem::new(ctx.provider.name.clone(), ChainReason::SystemError);
        item.error_message = Some("client disconnected mid-stream".to_string());
        ctx.chain.push(item);
    } else if let Some(err) = &stream_error {
        let mut item =
            ProviderChainItem::new(ctx.provider.name.clone(), ChainReason::RetryFailed);
        item.error_message = Some(err.to_string());
        ctx.chain.push(item);
    }

    if completed {
        bill(&ctx, &scanner.usage, true).await;
    }
    let session_status = if completed {
        SessionStatus::Completed
    } else {
        SessionStatus::Aborted
    };
    capture_session(&ctx, None, session_status).await;
    record_request(
        &ctx.state,
        MessageRequestRecord {
            id: 0,
            session_id: ctx.session_id.clone(),
            created_at: Utc::now(),
            user_id: Some(ctx.user_id),
            key_id: Some(ctx.key_id),
            model: Some(ctx.model.clone()),
            endpoint: ctx.endpoint_path.clone(),
            is_streaming: ctx.is_streaming,
            status_code: 200,
            error_body: None,
            usage: scanner.usage,
            user_agent: ctx.user_agent.clone(),
            final_provider_id: Some(ctx.provider.id),
            provider_chain: ctx.chain.clone(),
            duration_ms: ctx.started.elapsed().as_millis() as u64,
        },
    )
    .await;
    tokens.release().await;
}

/// Answer a matched warmup probe locally: synthetic response, session
/// capture, zero-cost blocked ledger row, request log with a warmup chain
/// item. Never billable.
#[allow(clippy::too_many_arguments)]
async fn answer_warmup(
    state: &AppState,
    settings: &SystemSettings,
    user: &User,
    key: &ApiKey,
    inbound: &InboundRequest,
    probe: &relay_core::warmup::WarmupProbe,
    session_id: &str,
    started: Instant,
) -> Response {
    let message_id = format!("msg_warmup_{}", uuid::Uuid::new_v4().simple());
    let synthetic = synthesize(probe, &message_id);

    let session = ActiveSession {
        session_id: session_id.to_string(),
        request_sequence: 0,
        started_at: Utc::now(),
        headers: std::collections::BTreeMap::new(),
        request_body: Some(inbound.body.clone()),
        response_body: Some(synthetic.body.clone()),
        response_headers: std::collections::BTreeMap::from([(
            "content-type".to_string(),
            synthetic.content_type.to_string(),
        )]),
        status: SessionStatus::Completed,
        provider_id: None,
    };
    if let Err(err) = state.sessions.put(session).await {
        tracing::warn!(%err, "warmup session capture failed");
    }

    let entry = LedgerEntry {
        id: 0,
        created_at: Utc::now(),
        user_id: user.id,
        key_hash: key.key_hash.clone(),
        final_provider_id: 0,
        cost_usd: Decimal::ZERO,
        duration_ms: started.elapsed().as_millis() as u64,
        is_success: true,
        blocked_by: Some(WARMUP_TAG.to_string()),
        blocked_reason: Some(blocked_reason(&settings.service_tag)),
    };
    if let Err(err) = state.writer.append(entry).await {
        tracing::warn!(%err, "warmup ledger row failed");
    }

    let mut item = ProviderChainItem::new(
        settings.service_tag.clone(),
        ChainReason::WarmupIntercepted,
    );
    item.status_code = Some(200);
    record_request(
        state,
        MessageRequestRecord {
            id: 0,
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            user_id: Some(user.id),
            key_id: Some(key.id),
            model: Some(probe.model.clone()),
            endpoint: inbound.endpoint.clone(),
            is_streaming: probe.stream,
            status_code: 200,
            error_body: None,
            usage: TokenUsage::default(),
            user_agent: inbound.user_agent.clone(),
            final_provider_id: Some(0),
            provider_chain: vec![item],
            duration_ms: started.elapsed().as_millis() as u64,
        },
    )
    .await;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, synthetic.content_type)
        .header(
            "x-relay-session-id",
            HeaderValue::from_str(session_id).unwrap_or(HeaderValue::from_static("invalid")),
        )
        .body(Body::from(synthetic.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
