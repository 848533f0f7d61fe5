use relay_core::match_warmup;
use serde_json::json;

#[test]
fn matches_plain_string_probe() {
    let body = json!({
        "model": "claude-3-5-haiku-20241022",
        "max_tokens": 1,
        "messages": [{ "role": "user", "content": "quota" }]
    });
    let probe = match_warmup(&body, None).expect("probe");
    assert_eq!(probe.model, "claude-3-5-haiku-20241022");
    assert!(!probe.stream);
}

#[test]
fn matches_single_text_block_probe() {
    let body = json!({
        "model": "claude-haiku-4-5",
        "max_tokens": 1,
        "stream": true,
        "messages": [{
            "role": "user",
            "content": [{ "type": "text", "text": "quota" }]
        }]
    });
    let probe = match_warmup(&body, None).expect("probe");
    assert!(probe.stream);
}

#[test]
fn accept_header_alone_forces_streaming() {
    let body = json!({
        "model": "claude-3-5-haiku-20241022",
        "messages": [{ "role": "user", "content": "quota" }]
    });
    let probe = match_warmup(&body, Some("text/event-stream")).expect("probe");
    assert!(probe.stream);
}

#[test]
fn rejects_models_outside_the_allowlist() {
    let body = json!({
        "model": "claude-sonnet-4",
        "max_tokens": 1,
        "messages": [{ "role": "user", "content": "quota" }]
    });
    assert!(match_warmup(&body, None).is_none());
}

#[test]
fn rejects_real_conversations() {
    let multi = json!({
        "model": "claude-3-5-haiku-20241022",
        "messages": [
            { "role": "user", "content": "quota" },
            { "role": "assistant", "content": "hello" }
        ]
    });
    assert!(match_warmup(&multi, None).is_none());

    let real_text = json!({
        "model": "claude-3-5-haiku-20241022",
        "messages": [{ "role": "user", "content": "summarize this file" }]
    });
    assert!(match_warmup(&real_text, None).is_none());

    let big_budget = json!({
        "model": "claude-3-5-haiku-20241022",
        "max_tokens": 4096,
        "messages": [{ "role": "user", "content": "quota" }]
    });
    assert!(match_warmup(&big_budget, None).is_none());
}
