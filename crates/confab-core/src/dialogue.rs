//! Dialogue client: send a transcript plus history, collect a streamed reply.
//!
//! The chat backend answers with a server-sent-event body. Each line is either
//! `data: {"delta": "..."}` (a reply fragment), `data: {"error": "..."}` (an
//! inline error that aborts the turn) or `data: [DONE]` (end of stream).
//! Fragments are accumulated into one reply string; the caller speaks the
//! whole reply at once.

use crate::history::ConversationTurn;
use futures::StreamExt;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from a dialogue exchange.
#[derive(Error, Debug)]
pub enum DialogueError {
    #[error("dialogue request failed: {0}")]
    Http(String),

    #[error("dialogue backend returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("dialogue stream error: {0}")]
    Stream(String),

    #[error("dialogue backend returned an empty reply")]
    Empty,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DialogueRequest<'a> {
    user_text: &'a str,
    history: &'a [ConversationTurn],
}

/// One parsed SSE line.
#[derive(Debug, PartialEq)]
enum SsePayload {
    Delta(String),
    Done,
    Skip,
}

/// Splits the byte stream into lines before any UTF-8 decoding. Chunk
/// boundaries fall anywhere, including inside a multi-byte character, so
/// decoding must only ever see complete lines.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line it closed.
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&raw).trim().to_string());
        }
        lines
    }

    /// The unterminated tail once the stream is over, if any.
    fn flush(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).trim().to_string())
        }
    }
}

/// Client for the streamed chat endpoint.
pub struct DialogueClient {
    endpoint: String,
    api_key: Option<String>,
    idle_timeout: Duration,
    client: reqwest::Client,
}

impl DialogueClient {
    /// Create a client for the given endpoint. `api_key` adds bearer auth.
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    /// Override the idle-chunk timeout (the stream itself is unbounded, but
    /// every individual chunk must arrive within this window).
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Send the user's transcript with recent history and collect the full
    /// streamed reply.
    pub async fn send(
        &self,
        user_text: &str,
        history: &[ConversationTurn],
    ) -> Result<String, DialogueError> {
        let request = DialogueRequest { user_text, history };
        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| DialogueError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DialogueError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut reply = String::new();

        loop {
            let next = tokio::time::timeout(self.idle_timeout, stream.next())
                .await
                .map_err(|_| DialogueError::Stream("idle-chunk timeout".to_string()))?;
            let chunk = match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(DialogueError::Http(e.to_string())),
                // Stream ended without an explicit [DONE]; accept what we have.
                None => break,
            };
            for line in lines.feed(&chunk) {
                match parse_sse_line(&line)? {
                    SsePayload::Delta(fragment) => reply.push_str(&fragment),
                    SsePayload::Done => {
                        debug!("dialogue stream complete ({} chars)", reply.len());
                        return finish(reply);
                    }
                    SsePayload::Skip => {}
                }
            }
        }

        // A final line without a trailing newline still counts.
        if let Some(line) = lines.flush() {
            match parse_sse_line(&line)? {
                SsePayload::Delta(fragment) => reply.push_str(&fragment),
                SsePayload::Done => return finish(reply),
                SsePayload::Skip => {}
            }
        }
        warn!("dialogue stream closed without end-of-stream marker");
        finish(reply)
    }
}

fn finish(reply: String) -> Result<String, DialogueError> {
    let reply = reply.trim().to_string();
    if reply.is_empty() {
        Err(DialogueError::Empty)
    } else {
        Ok(reply)
    }
}

fn parse_sse_line(line: &str) -> Result<SsePayload, DialogueError> {
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(SsePayload::Skip);
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(SsePayload::Done);
    }
    let value: serde_json::Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => {
            debug!("skipping malformed dialogue fragment: {}", payload);
            return Ok(SsePayload::Skip);
        }
    };
    if let Some(message) = value.get("error").and_then(|e| e.as_str()) {
        return Err(DialogueError::Stream(message.to_string()));
    }
    if let Some(delta) = value.get("delta").and_then(|d| d.as_str()) {
        return Ok(SsePayload::Delta(delta.to_string()));
    }
    Ok(SsePayload::Skip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_delta_fragments() {
        let parsed = parse_sse_line(r#"data: {"delta": "hello "}"#).unwrap();
        assert_eq!(parsed, SsePayload::Delta("hello ".to_string()));
    }

    #[test]
    fn parses_done_marker() {
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SsePayload::Done);
    }

    #[test]
    fn inline_error_aborts_turn() {
        let result = parse_sse_line(r#"data: {"error": "upstream overloaded"}"#);
        assert!(matches!(result, Err(DialogueError::Stream(msg)) if msg.contains("overloaded")));
    }

    #[test]
    fn non_data_lines_are_skipped() {
        assert_eq!(parse_sse_line("").unwrap(), SsePayload::Skip);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SsePayload::Skip);
        assert_eq!(parse_sse_line("event: ping").unwrap(), SsePayload::Skip);
    }

    #[test]
    fn malformed_json_is_skipped() {
        assert_eq!(parse_sse_line("data: {not json").unwrap(), SsePayload::Skip);
    }

    #[test]
    fn multibyte_character_split_across_chunks_stays_intact() {
        let line = "data: {\"delta\": \"caf\u{e9} ok\"}\n".as_bytes().to_vec();
        // é is two bytes in UTF-8; cut between them.
        let cut = line.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut buffer = LineBuffer::new();
        assert!(buffer.feed(&line[..cut]).is_empty());
        let lines = buffer.feed(&line[cut..]);
        assert_eq!(lines.len(), 1);
        assert_eq!(
            parse_sse_line(&lines[0]).unwrap(),
            SsePayload::Delta("caf\u{e9} ok".to_string())
        );
    }

    #[test]
    fn unterminated_final_line_is_not_dropped() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.feed(b"data: {\"delta\": \"tail\"}").is_empty());
        let line = buffer.flush().expect("tail kept");
        assert_eq!(
            parse_sse_line(&line).unwrap(),
            SsePayload::Delta("tail".to_string())
        );
    }

    #[test]
    fn one_chunk_may_close_several_lines() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.feed(b"data: {\"delta\": \"a\"}\ndata: {\"delta\": \"b\"}\ndata: [DONE]\n");
        assert_eq!(lines.len(), 3);
        assert_eq!(parse_sse_line(&lines[2]).unwrap(), SsePayload::Done);
    }

    #[test]
    fn empty_reply_is_an_error() {
        assert!(matches!(finish("  ".to_string()), Err(DialogueError::Empty)));
        assert_eq!(finish(" hi ".to_string()).unwrap(), "hi");
    }

    #[test]
    fn request_serializes_camel_case() {
        let history = vec![ConversationTurn::user("hey")];
        let req = DialogueRequest {
            user_text: "what's up",
            history: &history,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"userText\""));
        assert!(json.contains("\"history\""));
        assert!(json.contains("\"user\""));
    }
}
