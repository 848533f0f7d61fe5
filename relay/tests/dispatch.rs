mod helpers;

use std::time::Duration;

use helpers::{endpoint, harness, provider, register_principal};
use httpmock::prelude::*;
use relay::dispatch::{InboundRequest, dispatch};
use relay_types::{BreakerPhase, ChainReason, ResetMode};
use rust_decimal::Decimal;
use serde_json::{Value, json};

fn inbound(secret: &str, body: Value) -> InboundRequest {
    InboundRequest {
        body,
        accept: None,
        authorization: Some(format!("Bearer {secret}")),
        x_api_key: None,
        user_agent: Some("relay-tests/1.0".into()),
        session_id: None,
        endpoint: "/v1/messages".into(),
    }
}

fn chat_body() -> Value {
    json!({
        "model": "claude-sonnet-4-20250514",
        "max_tokens": 1024,
        "messages": [{ "role": "user", "content": "explain lifetimes" }]
    })
}

async fn read_body(response: axum::response::Response) -> (u16, Value) {
    let status = response.status().as_u16();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn wait_for_rows(ledger: &relay_mock::MemoryLedger, count: usize) {
    for _ in 0..200 {
        if ledger.rows().len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("ledger never reached {count} rows");
}

#[tokio::test]
async fn proxies_and_bills_a_buffered_request() {
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/messages");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "id": "msg_1",
                    "type": "message",
                    "content": [{ "type": "text", "text": "..." }],
                    "usage": { "input_tokens": 1000, "output_tokens": 2000 }
                }));
        })
        .await;

    let h = harness(
        vec![provider(1, "primary", 0, 100)],
        vec![endpoint(11, 1, &upstream.base_url())],
    );
    let secret = register_principal(&h, 1, 1);

    let response = dispatch(&h.state, inbound(&secret, chat_body())).await;
    let (status, body) = read_body(response).await;
    assert_eq!(status, 200);
    assert_eq!(body["id"], "msg_1");
    mock.assert_async().await;

    // Billing: one ledger row at the sonnet rate, counters fanned out.
    let rows = h.ledger.rows();
    assert_eq!(rows.len(), 1);
    let expected = Decimal::new(33, 3); // 1000×$3 + 2000×$15 per MTok
    assert_eq!(rows[0].cost_usd, expected);
    assert!(rows[0].is_success);
    assert!(rows[0].blocked_by.is_none());
    assert_eq!(rows[0].final_provider_id, 1);
    assert_eq!(
        h.counters.fixed_value("user:1:cost_daily_0000"),
        Some(expected)
    );
    assert_eq!(
        h.counters.fixed_value("provider:1:cost_monthly"),
        Some(expected)
    );

    // Request log carries the decision chain.
    let requests = h.ledger.requests();
    assert_eq!(requests.len(), 1);
    let reasons: Vec<ChainReason> = requests[0]
        .provider_chain
        .iter()
        .map(|i| i.reason)
        .collect();
    assert_eq!(
        reasons,
        vec![ChainReason::InitialSelection, ChainReason::RequestSuccess]
    );
    assert_eq!(requests[0].usage.input_tokens, 1000);
    assert_eq!(requests[0].final_provider_id, Some(1));
}

#[tokio::test]
async fn cost_multiplier_scales_billing() {
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/messages");
            then.status(200).json_body(json!({
                "usage": { "input_tokens": 1000, "output_tokens": 2000 }
            }));
        })
        .await;

    let mut discounted = provider(1, "discounted", 0, 100);
    discounted.cost_multiplier = Decimal::new(5, 1); // 0.5
    let h = harness(vec![discounted], vec![endpoint(11, 1, &upstream.base_url())]);
    let secret = register_principal(&h, 1, 1);

    let response = dispatch(&h.state, inbound(&secret, chat_body())).await;
    assert_eq!(response.status().as_u16(), 200);
    let rows = h.ledger.rows();
    assert_eq!(rows[0].cost_usd, Decimal::new(165, 4)); // 0.033 × 0.5
}

#[tokio::test]
async fn retries_on_5xx_and_fails_over() {
    let bad = MockServer::start_async().await;
    bad.mock_async(|when, then| {
        when.method(POST).path("/v1/messages");
        then.status(503).json_body(json!({
            "error": { "type": "overloaded_error", "message": "overloaded" }
        }));
    })
    .await;
    let good = MockServer::start_async().await;
    good.mock_async(|when, then| {
        when.method(POST).path("/v1/messages");
        then.status(200).json_body(json!({
            "id": "msg_2",
            "usage": { "input_tokens": 10, "output_tokens": 10 }
        }));
    })
    .await;

    let h = harness(
        vec![provider(1, "flaky", 0, 100), provider(2, "stable", 5, 100)],
        vec![endpoint(11, 1, &bad.base_url()), endpoint(12, 2, &good.base_url())],
    );
    let secret = register_principal(&h, 1, 1);

    let response = dispatch(&h.state, inbound(&secret, chat_body())).await;
    let (status, body) = read_body(response).await;
    assert_eq!(status, 200);
    assert_eq!(body["id"], "msg_2");

    let requests = h.ledger.requests();
    let reasons: Vec<ChainReason> = requests[0]
        .provider_chain
        .iter()
        .map(|i| i.reason)
        .collect();
    assert_eq!(
        reasons,
        vec![
            ChainReason::InitialSelection,
            ChainReason::RetryFailed,
            ChainReason::RetrySuccess,
        ]
    );
    assert_eq!(requests[0].final_provider_id, Some(2));

    // The failed endpoint took one breaker hit; the serving one is clean.
    assert_eq!(h.state.breakers.state(11).await.consecutive_failures, 1);
    assert_eq!(h.state.breakers.state(12).await.consecutive_failures, 0);
    // Billing went to the provider that actually served.
    assert_eq!(h.ledger.rows()[0].final_provider_id, 2);
}

#[tokio::test]
async fn client_errors_do_not_retry_or_bill() {
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/messages");
            then.status(400).json_body(json!({
                "error": { "type": "invalid_request_error", "message": "bad tool schema" }
            }));
        })
        .await;

    let h = harness(
        vec![provider(1, "only", 0, 100), provider(2, "never", 5, 100)],
        vec![
            endpoint(11, 1, &upstream.base_url()),
            endpoint(12, 2, "https://unreachable.invalid"),
        ],
    );
    let secret = register_principal(&h, 1, 1);

    let response = dispatch(&h.state, inbound(&secret, chat_body())).await;
    let (status, body) = read_body(response).await;
    assert_eq!(status, 400);
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("bad tool schema")
    );
    assert_eq!(mock.hits_async().await, 1);

    // No billable row; the 4xx left the breaker untouched.
    assert!(h.ledger.rows().is_empty());
    assert_eq!(h.state.breakers.state(11).await.consecutive_failures, 0);

    let requests = h.ledger.requests();
    let reasons: Vec<ChainReason> = requests[0]
        .provider_chain
        .iter()
        .map(|i| i.reason)
        .collect();
    assert_eq!(
        reasons,
        vec![
            ChainReason::InitialSelection,
            ChainReason::ClientErrorNonRetryable,
        ]
    );
}

#[tokio::test]
async fn quota_denial_is_a_429_with_the_window_details() {
    let h = harness(
        vec![provider(1, "p", 0, 100)],
        vec![endpoint(11, 1, "https://never-called.invalid")],
    );
    let secret = register_principal(&h, 1, 1);
    {
        let mut users = h.principals.users.lock().unwrap();
        let user = users.get_mut(&1).unwrap();
        user.caps.limit_daily_usd = Some(Decimal::from(10));
        user.reset.daily_reset_mode = ResetMode::Rolling;
    }
    h.counters.seed_rolling(
        "user:1:cost_daily_rolling",
        &[(7, chrono::Utc::now().timestamp_millis(), Decimal::from(11))],
    );

    let response = dispatch(&h.state, inbound(&secret, chat_body())).await;
    let (status, body) = read_body(response).await;
    assert_eq!(status, 429);
    assert_eq!(body["error"]["code"], "quota_exceeded");
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("User 日消费上限已达到 (11.0000/10)")
    );
    assert_eq!(body["error"]["details"]["period"], "24h");
    assert!(body["error"]["retryAfterMs"].is_u64());
    assert!(h.ledger.rows().is_empty());
}

#[tokio::test]
async fn concurrency_cap_denies_with_429() {
    let h = harness(
        vec![provider(1, "p", 0, 100)],
        vec![endpoint(11, 1, "https://never-called.invalid")],
    );
    let secret = register_principal(&h, 1, 1);
    {
        let mut users = h.principals.users.lock().unwrap();
        users.get_mut(&1).unwrap().caps.limit_concurrent_sessions = Some(1);
    }
    // Hold the single slot.
    let _held = h
        .state
        .limits
        .check_concurrency("1", relay_types::Scope::User, 1)
        .await
        .unwrap();

    let response = dispatch(&h.state, inbound(&secret, chat_body())).await;
    let (status, body) = read_body(response).await;
    assert_eq!(status, 429);
    assert_eq!(body["error"]["code"], "concurrency_limit");
}

#[tokio::test]
async fn unknown_key_is_unauthenticated() {
    let h = harness(vec![], vec![]);
    let response = dispatch(&h.state, inbound("sk-not-registered", chat_body())).await;
    let (status, body) = read_body(response).await;
    assert_eq!(status, 401);
    assert_eq!(body["error"]["code"], "unauthenticated");
}

#[tokio::test]
async fn malformed_body_is_a_protocol_error_without_a_ledger_row() {
    let h = harness(vec![], vec![]);
    let secret = register_principal(&h, 1, 1);
    let response = dispatch(&h.state, inbound(&secret, json!({ "messages": [] }))).await;
    let (status, body) = read_body(response).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "invalid_request");
    assert!(h.ledger.rows().is_empty());
    assert!(h.ledger.requests().is_empty());
}

#[tokio::test]
async fn warmup_probe_is_answered_locally_with_a_blocked_row() {
    let h = harness(
        vec![provider(1, "p", 0, 100)],
        vec![endpoint(11, 1, "https://never-called.invalid")],
    );
    let secret = register_principal(&h, 1, 1);
    let probe = json!({
        "model": "claude-3-5-haiku-20241022",
        "max_tokens": 1,
        "messages": [{ "role": "user", "content": "quota" }]
    });

    let response = dispatch(&h.state, inbound(&secret, probe)).await;
    let (status, body) = read_body(response).await;
    assert_eq!(status, 200);
    assert_eq!(body["type"], "message");
    assert_eq!(body["content"][0]["text"], "OK");

    wait_for_rows(&h.ledger, 1).await;
    let rows = h.ledger.rows();
    assert_eq!(rows[0].cost_usd, Decimal::ZERO);
    assert_eq!(rows[0].blocked_by.as_deref(), Some("anthropic_warmup"));
    assert_eq!(rows[0].final_provider_id, 0);
    let reason = rows[0].blocked_reason.as_ref().unwrap();
    assert_eq!(reason["type"], "anthropic_warmup");
    assert_eq!(reason["skippedUpstream"], true);

    // Never counted toward billing.
    assert_eq!(h.counters.fixed_value("user:1:cost_daily_0000"), None);

    let requests = h.ledger.requests();
    assert_eq!(requests[0].provider_chain[0].reason, ChainReason::WarmupIntercepted);
}

#[tokio::test]
async fn streaming_warmup_probe_gets_sse_frames() {
    let h = harness(vec![], vec![]);
    let secret = register_principal(&h, 1, 1);
    let mut request = inbound(
        &secret,
        json!({
            "model": "claude-3-5-haiku-20241022",
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "quota" }]
        }),
    );
    request.accept = Some("text/event-stream".into());

    let response = dispatch(&h.state, request).await;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("event: message_start"));
    assert!(text.contains("event: message_stop"));
}

#[tokio::test]
async fn streams_bytes_through_and_bills_from_sse_usage() {
    let frames = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":1000,\"output_tokens\":0}}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"usage\":{\"input_tokens\":1000,\"output_tokens\":2000}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/messages");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(frames);
        })
        .await;

    let h = harness(
        vec![provider(1, "p", 0, 100)],
        vec![endpoint(11, 1, &upstream.base_url())],
    );
    let secret = register_principal(&h, 1, 1);
    let mut request = inbound(&secret, chat_body());
    request.body["stream"] = json!(true);

    let response = dispatch(&h.state, request).await;
    assert_eq!(response.status().as_u16(), 200);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("message_stop"));

    // The pump bills after the stream drains.
    wait_for_rows(&h.ledger, 1).await;
    let rows = h.ledger.rows();
    assert_eq!(rows[0].cost_usd, Decimal::new(33, 3));
    let requests = h.ledger.requests();
    assert!(requests[0].is_streaming);
    assert_eq!(requests[0].usage.output_tokens, 2000);
}

#[tokio::test]
async fn repeated_failures_open_the_breaker_and_then_503() {
    let upstream = MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(POST).path("/v1/messages");
            then.status(500).body("upstream exploded");
        })
        .await;

    let h = harness(
        vec![provider(1, "only", 0, 100)],
        vec![endpoint(11, 1, &upstream.base_url())],
    );
    let secret = register_principal(&h, 1, 1);

    for _ in 0..3 {
        let response = dispatch(&h.state, inbound(&secret, chat_body())).await;
        assert!(response.status().is_server_error());
    }
    assert_eq!(h.state.breakers.state(11).await.phase, BreakerPhase::Open);

    let response = dispatch(&h.state, inbound(&secret, chat_body())).await;
    let (status, body) = read_body(response).await;
    assert_eq!(status, 503);
    assert_eq!(body["error"]["code"], "no_available_provider");
}
