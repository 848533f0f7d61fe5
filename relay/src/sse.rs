//! Incremental SSE frame scanning for the streaming pass-through.
//!
//! Bytes flow to the client untouched; the scanner only watches `data:`
//! lines for usage blocks and the terminal `message_stop` frame, which
//! gates billing for cancelled streams.

use relay_types::TokenUsage;
use serde_json::Value;

/// Accumulates usage across `message_start`/`message_delta` frames.
#[derive(Debug, Default)]
pub struct SseUsageScanner {
    buf: String,
    /// Best-known token counts so far.
    pub usage: TokenUsage,
    /// Whether `message_stop` was seen.
    pub completed: bool,
}

impl SseUsageScanner {
    /// A fresh scanner.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one upstream chunk. Partial lines are buffered across calls.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        while let Some(newline) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=newline).collect();
            self.scan_line(line.trim_end());
        }
    }

    fn scan_line(&mut self, line: &str) {
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let Ok(value) = serde_json::from_str::<Value>(data.trim()) else {
            return;
        };
        match value.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(usage) = value
                    .get("message")
                    .and_then(|m| m.get("usage"))
                    .and_then(|u| serde_json::from_value::<TokenUsage>(u.clone()).ok())
                {
                    self.usage.merge(&usage);
                }
            }
            Some("message_delta") => {
                if let Some(usage) = value
                    .get("usage")
                    .and_then(|u| serde_json::from_value::<TokenUsage>(u.clone()).ok())
                {
                    self.usage.merge(&usage);
                }
            }
            Some("message_stop") => {
                self.completed = true;
            }
            _ => {}
        }
    }
}
