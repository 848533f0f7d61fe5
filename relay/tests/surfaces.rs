//! Unit coverage for the orchestrator's pure surfaces: SSE scanning, bearer
//! parsing, warmup synthesis, and snapshot publication.

use relay::auth::{bearer_token, hash_secret};
use relay::snapshot::{ProviderSnapshot, SnapshotRegistry};
use relay::sse::SseUsageScanner;
use relay::warmup::synthesize;
use relay_core::warmup::WarmupProbe;
use relay_middleware::EndpointDirectory;
use relay_types::ProviderEndpoint;

#[test]
fn scanner_accumulates_usage_across_split_chunks() {
    let mut scanner = SseUsageScanner::new();
    // Frames arrive fragmented mid-line; the scanner buffers partial lines.
    scanner.feed(b"event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tok");
    scanner.feed(b"ens\":500,\"output_tokens\":0}}}\n\n");
    assert_eq!(scanner.usage.input_tokens, 500);
    assert!(!scanner.completed);

    scanner.feed(
        b"data: {\"type\":\"message_delta\",\"usage\":{\"input_tokens\":500,\"output_tokens\":42}}\n",
    );
    assert_eq!(scanner.usage.output_tokens, 42);

    scanner.feed(b"data: {\"type\":\"message_stop\"}\n");
    assert!(scanner.completed);
}

#[test]
fn scanner_ignores_non_data_lines_and_malformed_json() {
    let mut scanner = SseUsageScanner::new();
    scanner.feed(b"event: ping\n: comment line\ndata: not-json\n\n");
    assert_eq!(scanner.usage.input_tokens, 0);
    assert!(!scanner.completed);
}

#[test]
fn bearer_parsing_accepts_both_header_forms() {
    assert_eq!(
        bearer_token(Some("Bearer sk-abc"), None).as_deref(),
        Some("sk-abc")
    );
    assert_eq!(
        bearer_token(Some("bearer  sk-abc "), None).as_deref(),
        Some("sk-abc")
    );
    // Raw x-api-key is accepted when no Authorization header parses.
    assert_eq!(bearer_token(None, Some("sk-raw")).as_deref(), Some("sk-raw"));
    assert_eq!(bearer_token(Some("Basic zzz"), None), None);
}

#[test]
fn secret_hashing_is_stable_hex_sha256() {
    let hash = hash_secret("sk-test");
    assert_eq!(hash.len(), 64);
    assert_eq!(hash, hash_secret("sk-test"));
    assert_ne!(hash, hash_secret("sk-test2"));
}

#[test]
fn warmup_synthesis_shapes() {
    let json = synthesize(
        &WarmupProbe {
            model: "claude-3-5-haiku-20241022".into(),
            stream: false,
        },
        "msg_test",
    );
    assert_eq!(json.content_type, "application/json");
    let value: serde_json::Value = serde_json::from_str(&json.body).unwrap();
    assert_eq!(value["stop_reason"], "end_turn");
    assert_eq!(value["model"], "claude-3-5-haiku-20241022");

    let sse = synthesize(
        &WarmupProbe {
            model: "claude-3-5-haiku-20241022".into(),
            stream: true,
        },
        "msg_test",
    );
    assert_eq!(sse.content_type, "text/event-stream");
    // The frame sequence is a valid minimal stream the client can parse.
    for event in [
        "message_start",
        "content_block_start",
        "content_block_delta",
        "content_block_stop",
        "message_delta",
        "message_stop",
    ] {
        assert!(sse.body.contains(&format!("event: {event}")), "{event}");
    }
    // And the scanner itself confirms completion on it.
    let mut scanner = SseUsageScanner::new();
    scanner.feed(sse.body.as_bytes());
    assert!(scanner.completed);
}

fn endpoint(id: i64) -> ProviderEndpoint {
    ProviderEndpoint {
        id,
        provider_id: 1,
        url: "https://a".into(),
        is_enabled: true,
        sort_order: 0,
        last_probe_ok: None,
        last_probe_latency_ms: None,
    }
}

#[tokio::test]
async fn probe_results_republish_the_snapshot() {
    let registry = SnapshotRegistry::new(ProviderSnapshot::new(vec![], vec![endpoint(9)]));
    let before = registry.load();
    assert_eq!(before.all_endpoints()[0].last_probe_ok, None);

    registry.record_probe(9, true, Some(42)).await;

    let after = registry.load();
    let updated = &after.all_endpoints()[0];
    assert_eq!(updated.last_probe_ok, Some(true));
    assert_eq!(updated.last_probe_latency_ms, Some(42));
    // The pre-update snapshot is immutable; readers holding it see the old
    // view, never a torn one.
    assert_eq!(before.all_endpoints()[0].last_probe_ok, None);
}
