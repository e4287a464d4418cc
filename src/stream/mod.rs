//! Server-sent event stream decoding
//!
//! Turns the body of a chat completions response into a lazy sequence of
//! [`Packet`]s. The request is only sent on first poll and the sequence is not
//! restartable. Bytes are buffered until a full line is available, so a chunk
//! boundary may fall inside a line or inside a multi-byte character.

use std::pin::Pin;

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::oneshot;

/// Comment line some gateways emit to keep the connection warm.
pub const KEEP_ALIVE_MARKER: &str = ": OPENROUTER PROCESSING";

const DATA_PREFIX: &str = "data: ";
const DONE_MARKER: &str = "[DONE]";

/// Minimal streaming unit decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Incremental text fragment.
    Data(String),
    /// End of stream.
    Done,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream request failed: {0}")]
    Request(reqwest::Error),

    #[error("stream open failed with status {status}: {body}")]
    Open {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("stream read failed: {0}")]
    Read(reqwest::Error),

    #[error("malformed stream packet: {0}")]
    MalformedPacket(String),
}

pub type PacketStream = Pin<Box<dyn Stream<Item = Result<Packet, StreamError>> + Send>>;

/// Aborts the underlying read loop. After [`StreamCancel::disconnect`] the
/// stream emits one graceful [`Packet::Done`] and never reads again.
#[derive(Debug)]
pub struct StreamCancel {
    tx: Option<oneshot::Sender<()>>,
}

impl StreamCancel {
    pub(crate) fn new(tx: oneshot::Sender<()>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disconnect(&mut self) -> bool {
        self.tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

/// Open a packet stream over a prepared request.
///
/// The request is sent on first poll. A non-success status or a send failure
/// is a fatal open error raised before any packet. A body that ends without a
/// `[DONE]` terminator simply ends the sequence.
pub fn connect(request: reqwest::RequestBuilder) -> (PacketStream, StreamCancel) {
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

    let stream = try_stream! {
        let response = open_response(request).await?;

        enum Step<T> {
            Disconnect,
            // Cancel handle dropped without disconnecting; keep reading.
            HandleGone,
            Read(T),
        }

        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut cancellable = true;

        'read: loop {
            let step = tokio::select! {
                result = &mut cancel_rx, if cancellable => match result {
                    Ok(()) => Step::Disconnect,
                    Err(_) => Step::HandleGone,
                },
                chunk = body.next() => Step::Read(chunk),
            };

            match step {
                Step::Disconnect => {
                    tracing::debug!("stream disconnected");
                    yield Packet::Done;
                    break 'read;
                }
                Step::HandleGone => cancellable = false,
                Step::Read(None) => break 'read,
                Step::Read(Some(chunk)) => {
                    let bytes = chunk.map_err(StreamError::Read)?;
                    buffer.extend_from_slice(&bytes);
                    for line in drain_lines(&mut buffer) {
                        match parse_line(&line)? {
                            Some(Packet::Done) => {
                                yield Packet::Done;
                                break 'read;
                            }
                            Some(packet) => yield packet,
                            None => {}
                        }
                    }
                }
            }
        }
    };

    (Box::pin(stream), StreamCancel::new(cancel_tx))
}

/// Send the request and validate the response status before any read.
async fn open_response(request: reqwest::RequestBuilder) -> Result<reqwest::Response, StreamError> {
    let response = request.send().await.map_err(StreamError::Request)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StreamError::Open { status, body });
    }
    tracing::debug!(%status, "stream opened");
    Ok(response)
}

/// Incremental chat completions chunk, `choices[0].delta.content`.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Split complete lines off the front of `buffer`, leaving any partial line
/// (including a partially received multi-byte character) for the next chunk.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.is_empty() {
            continue;
        }
        lines.push(String::from_utf8_lossy(&line).into_owned());
    }
    lines
}

/// Decode one line. `Ok(None)` means the line carries no packet: keep-alive
/// comments, unknown line shapes and deltas without content are all skipped.
fn parse_line(line: &str) -> Result<Option<Packet>, StreamError> {
    if line == KEEP_ALIVE_MARKER {
        tracing::trace!("skipping keep-alive line");
        return Ok(None);
    }

    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };

    if payload == DONE_MARKER {
        return Ok(Some(Packet::Done));
    }

    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|e| StreamError::MalformedPacket(format!("{e}: {payload}")))?;

    match chunk.choices.into_iter().next() {
        Some(choice) => Ok(choice.delta.content.map(Packet::Data)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert_eq!(
            parse_line(line).unwrap(),
            Some(Packet::Data("Hi".to_string()))
        );
    }

    #[test]
    fn test_parse_done_line() {
        assert_eq!(parse_line("data: [DONE]").unwrap(), Some(Packet::Done));
    }

    #[test]
    fn test_keep_alive_is_dropped() {
        assert_eq!(parse_line(KEEP_ALIVE_MARKER).unwrap(), None);
    }

    #[test]
    fn test_unknown_line_shapes_are_ignored() {
        assert_eq!(parse_line("event: ping").unwrap(), None);
        assert_eq!(parse_line("id: 42").unwrap(), None);
        assert_eq!(parse_line("random noise").unwrap(), None);
    }

    #[test]
    fn test_delta_without_content_is_skipped() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_line(line).unwrap(), None);

        let finished = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert_eq!(parse_line(finished).unwrap(), None);
    }

    #[test]
    fn test_empty_choices_is_skipped() {
        let line = r#"data: {"choices":[]}"#;
        assert_eq!(parse_line(line).unwrap(), None);
    }

    #[test]
    fn test_unparsable_payload_is_malformed() {
        let result = parse_line("data: {not json");
        assert!(matches!(result, Err(StreamError::MalformedPacket(_))));
    }

    #[test]
    fn test_drain_lines_keeps_partial_line() {
        let mut buffer = b"data: a\ndata: b".to_vec();
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec!["data: a".to_string()]);
        assert_eq!(buffer, b"data: b");

        buffer.extend_from_slice(b"\n");
        assert_eq!(drain_lines(&mut buffer), vec!["data: b".to_string()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_lines_strips_carriage_return_and_blanks() {
        let mut buffer = b"one\r\n\r\ntwo\n".to_vec();
        assert_eq!(
            drain_lines(&mut buffer),
            vec!["one".to_string(), "two".to_string()]
        );
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        // "é" is 0xC3 0xA9; the chunk boundary falls between the two bytes.
        let mut buffer = Vec::new();
        buffer.extend_from_slice(b"caf\xC3");
        assert!(drain_lines(&mut buffer).is_empty());

        buffer.extend_from_slice(b"\xA9\n");
        assert_eq!(drain_lines(&mut buffer), vec!["café".to_string()]);
    }
}
