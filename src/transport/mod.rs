//! Conversation transport
//!
//! Builds the chat completions request and hands framing to the stream
//! decoder. Exposed as a trait so the store can be driven by a simulated
//! packet source in tests.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::conversation::Role;
use crate::stream::{self, PacketStream, StreamCancel};

/// Keys extra options may not override; the protocol owns these.
const PROTECTED_KEYS: [&str; 3] = ["stream", "message", "model"];

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not implemented: {0}")]
    Unsupported(&'static str),
}

/// One history entry as it appears on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMessage {
    pub role: Role,
    pub content: String,
}

/// A live packet sequence plus the handle that aborts it.
pub struct StreamHandle {
    pub packets: PacketStream,
    pub cancel: StreamCancel,
}

#[async_trait]
pub trait ConversationTransport: Send + Sync {
    /// Open a streaming completion for the given history. The request itself
    /// is issued lazily by the returned packet stream.
    fn send_conversation_stream(
        &self,
        model: &str,
        messages: Vec<RequestMessage>,
        extra_options: Map<String, Value>,
    ) -> Result<StreamHandle, TransportError>;

    /// Non-streaming completion. No current transport implements this.
    async fn send_conversation(
        &self,
        model: &str,
        messages: Vec<RequestMessage>,
    ) -> Result<String, TransportError>;
}

/// Production transport speaking the OpenAI-compatible SSE protocol.
pub struct SseTransport {
    client: Client,
    endpoint: String,
    token: String,
}

impl SseTransport {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl ConversationTransport for SseTransport {
    fn send_conversation_stream(
        &self,
        model: &str,
        messages: Vec<RequestMessage>,
        extra_options: Map<String, Value>,
    ) -> Result<StreamHandle, TransportError> {
        tracing::debug!(%model, message_count = messages.len(), "opening conversation stream");

        let body = build_body(model, &messages, extra_options);
        let request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body);

        let (packets, cancel) = stream::connect(request);
        Ok(StreamHandle { packets, cancel })
    }

    async fn send_conversation(
        &self,
        _model: &str,
        _messages: Vec<RequestMessage>,
    ) -> Result<String, TransportError> {
        Err(TransportError::Unsupported("non-streaming conversation send"))
    }
}

/// `{model, messages, stream: true}` merged with caller extras. Protected
/// keys are inserted last so extras can never override them.
fn build_body(
    model: &str,
    messages: &[RequestMessage],
    extra_options: Map<String, Value>,
) -> Value {
    let mut body = Map::new();
    for (key, value) in extra_options {
        if PROTECTED_KEYS.contains(&key.as_str()) {
            continue;
        }
        body.insert(key, value);
    }
    body.insert("model".to_string(), json!(model));
    body.insert("messages".to_string(), json!(messages));
    body.insert("stream".to_string(), json!(true));
    Value::Object(body)
}
