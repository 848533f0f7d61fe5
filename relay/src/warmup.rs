//! Synthetic warmup responses.

use relay_core::warmup::{WARMUP_TAG, WarmupProbe};
use serde_json::{Value, json};

/// A locally synthesized warmup answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupResponse {
    /// Response body: a JSON message or a full SSE frame sequence.
    pub body: String,
    /// `application/json` or `text/event-stream`.
    pub content_type: &'static str,
}

fn message_json(probe: &WarmupProbe, message_id: &str) -> Value {
    json!({
        "id": message_id,
        "type": "message",
        "role": "assistant",
        "model": probe.model,
        "content": [{ "type": "text", "text": "OK" }],
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": { "input_tokens": 1, "output_tokens": 1 }
    })
}

/// Build the fixed response for a matched probe, in the shape the caller
/// asked for.
#[must_use]
pub fn synthesize(probe: &WarmupProbe, message_id: &str) -> WarmupResponse {
    if !probe.stream {
        return WarmupResponse {
            body: message_json(probe, message_id).to_string(),
            content_type: "application/json",
        };
    }

    let start = json!({
        "type": "message_start",
        "message": {
            "id": message_id,
            "type": "message",
            "role": "assistant",
            "model": probe.model,
            "content": [],
            "stop_reason": null,
            "usage": { "input_tokens": 1, "output_tokens": 0 }
        }
    });
    let frames = [
        ("message_start", start),
        (
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": { "type": "text", "text": "" }
            }),
        ),
        (
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": 0,
                "delta": { "type": "text_delta", "text": "OK" }
            }),
        ),
        (
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": 0 }),
        ),
        (
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": "end_turn", "stop_sequence": null },
                "usage": { "output_tokens": 1 }
            }),
        ),
        ("message_stop", json!({ "type": "message_stop" })),
    ];
    let mut body = String::new();
    for (event, payload) in frames {
        body.push_str(&format!("event: {event}\ndata: {payload}\n\n"));
    }
    WarmupResponse {
        body,
        content_type: "text/event-stream",
    }
}

/// `blocked_reason` recorded on the zero-cost ledger row.
#[must_use]
pub fn blocked_reason(service_tag: &str) -> Value {
    json!({
        "type": WARMUP_TAG,
        "interceptedBy": service_tag,
        "skippedUpstream": true
    })
}
