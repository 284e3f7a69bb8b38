//! Server-sent-event parser shared by the SSE and streaming-HTTP transports.
//!
//! Splits a byte stream on blank-line boundaries and yields one
//! [`SseEvent`] per `event:`/`data:` block.

use std::pin::Pin;

use futures::stream::{self, Stream, StreamExt};

use super::super::errors::McpError;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, if any. MCP uses `endpoint` and `message`.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

impl SseEvent {
    /// Whether this event carries a JSON-RPC message.
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// Parse a raw byte stream into SSE events.
pub fn sse_events<S, B, E>(
    bytes: S,
    server: String,
) -> impl Stream<Item = Result<SseEvent, McpError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let byte_stream: Pin<Box<S>> = Box::pin(bytes);

    stream::unfold(
        (byte_stream, Vec::<u8>::new(), server, false),
        |(mut byte_stream, mut buffer, server, done)| async move {
            if done {
                return None;
            }
            loop {
                // Blocks end at ASCII newlines, so a complete block never
                // splits a multi-byte character.
                if let Some((block_end, next_start)) = event_boundary(&buffer) {
                    let block = String::from_utf8_lossy(&buffer[..block_end]).into_owned();
                    buffer.drain(..next_start);

                    match parse_event(&block) {
                        Some(event) => return Some((Ok(event), (byte_stream, buffer, server, false))),
                        None => continue, // comment or keep-alive
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(bytes.as_ref()),
                    Some(Err(e)) => {
                        let err = McpError::TransportError {
                            server: server.clone(),
                            reason: format!("event stream read error: {e}"),
                        };
                        return Some((Err(err), (byte_stream, buffer, server, true)));
                    }
                    None => {
                        // Flush a trailing event that had no blank line.
                        let rest = String::from_utf8_lossy(&std::mem::take(&mut buffer)).into_owned();
                        return parse_event(rest.trim_end())
                            .map(|event| (Ok(event), (byte_stream, buffer, server, true)));
                    }
                }
            }
        },
    )
}

/// Find the first blank line. Returns where the block before it ends and
/// where the next block starts. Accepts `\n` and `\r\n` line endings.
fn event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut line_start = 0;
    for (i, byte) in buffer.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        let line = &buffer[line_start..i];
        if line.is_empty() || line == b"\r" {
            return Some((line_start, i + 1));
        }
        line_start = i + 1;
    }
    None
}

/// Parse one event block. Returns `None` for blocks without data.
pub fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
    })
}
