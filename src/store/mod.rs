//! Conversation store
//!
//! Owns every conversation and message, orchestrates transport and pacing for
//! each send, and implements the reply-chain mutation contract. The store is
//! an explicit object: collaborators are injected, so tests run against a
//! simulated transport and in-memory storage.
//!
//! Every mutation is applied in place under a lock, bumps a revision counter
//! renderers can watch, and persists the whole serialized state to durable
//! storage under [`STORE_KEY`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{oneshot, watch};

use crate::chain::{self, ChainError};
use crate::conversation::{Conversation, ConversationOptions, Message, MessageStatus, OptionsPatch};
use crate::pacing;
use crate::storage::{StateStorage, StorageError};
use crate::stream::StreamError;
use crate::transport::{ConversationTransport, RequestMessage, StreamHandle, TransportError};

/// Fixed storage key the serialized state lives under.
pub const STORE_KEY: &str = "conversation-store";

/// Bumped whenever the persisted layout changes; a mismatch on restore
/// discards the payload.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreState {
    pub active_conversation_id: Option<String>,
    pub conversations: HashMap<String, Conversation>,
}

#[derive(Debug, Deserialize)]
struct PersistedState {
    version: u32,
    state: StoreState,
}

/// Borrowing twin of [`PersistedState`] so persisting never clones the state.
#[derive(Serialize)]
struct PersistedStateRef<'a> {
    version: u32,
    state: &'a StoreState,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no active conversation")]
    NoActiveConversation,

    #[error("conversation '{0}' is not held locally")]
    UnknownConversation(String),

    #[error("message '{0}' not found in the active conversation")]
    MessageNotFound(String),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("send task stopped before signalling completion")]
    SendInterrupted,
}

/// How a send settled when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Finished,
    Cancelled,
}

/// Handle to one in-flight send: the completion signal and the cancel switch.
pub struct SendHandle {
    user_message_id: String,
    assistant_message_id: String,
    completion: oneshot::Receiver<Result<SendOutcome, StoreError>>,
    cancel: Option<oneshot::Sender<()>>,
}

impl SendHandle {
    pub fn user_message_id(&self) -> &str {
        &self.user_message_id
    }

    pub fn assistant_message_id(&self) -> &str {
        &self.assistant_message_id
    }

    /// Request cancellation. Returns `true` if the signal reached the send
    /// task. Streamed content is kept; the assistant message ends up
    /// `cancelled`.
    pub fn cancel(&mut self) -> bool {
        self.cancel
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    /// Wait for the send to settle. Cancel-safe; settles exactly once.
    pub async fn wait(&mut self) -> Result<SendOutcome, StoreError> {
        (&mut self.completion)
            .await
            .unwrap_or(Err(StoreError::SendInterrupted))
    }
}

#[derive(Clone)]
pub struct ChatStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: Mutex<StoreState>,
    storage: Arc<dyn StateStorage>,
    transport: Arc<dyn ConversationTransport>,
    revision: watch::Sender<u64>,
}

impl ChatStore {
    pub fn new(transport: Arc<dyn ConversationTransport>, storage: Arc<dyn StateStorage>) -> Self {
        Self::with_state(transport, storage, StoreState::default())
    }

    /// Restore persisted state from storage, starting empty when nothing
    /// usable is found.
    pub async fn restore(
        transport: Arc<dyn ConversationTransport>,
        storage: Arc<dyn StateStorage>,
    ) -> Result<Self, StoreError> {
        let state = match storage.get(STORE_KEY).await? {
            Some(raw) => match serde_json::from_str::<PersistedState>(&raw) {
                Ok(persisted) if persisted.version == SCHEMA_VERSION => persisted.state,
                Ok(persisted) => {
                    tracing::warn!(
                        version = persisted.version,
                        expected = SCHEMA_VERSION,
                        "discarding persisted state with unexpected schema version"
                    );
                    StoreState::default()
                }
                Err(e) => {
                    tracing::warn!(error = %e, "discarding unreadable persisted state");
                    StoreState::default()
                }
            },
            None => StoreState::default(),
        };

        Ok(Self::with_state(transport, storage, state))
    }

    fn with_state(
        transport: Arc<dyn ConversationTransport>,
        storage: Arc<dyn StateStorage>,
        state: StoreState,
    ) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(state),
                storage,
                transport,
                revision,
            }),
        }
    }

    /// Revision counter bumped on every mutation; the rendering layer's
    /// change signal.
    pub fn watch_revision(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Reuse the active conversation while it is still empty, otherwise
    /// create and activate a fresh one. Returns the conversation to use for
    /// the next send.
    pub async fn create_conversation(
        &self,
        overrides: Option<OptionsPatch>,
    ) -> Result<String, StoreError> {
        {
            let state = self.inner.state.lock().unwrap();
            if let Some(active_id) = &state.active_conversation_id {
                if let Some(active) = state.conversations.get(active_id) {
                    if active.is_empty() {
                        return Ok(active_id.clone());
                    }
                }
            }
        }

        let id = self
            .mutate(|state| {
                let mut options = ConversationOptions::default();
                if let Some(patch) = &overrides {
                    patch.apply(&mut options);
                }
                let conversation = Conversation::new(options);
                let id = conversation.conversation_id.clone();
                state.active_conversation_id = Some(id.clone());
                state.conversations.insert(id.clone(), conversation);
                id
            })
            .await?;

        tracing::debug!(conversation_id = %id, "created conversation");
        Ok(id)
    }

    /// Append a user turn, open the model stream and drive the paced reply
    /// into an assistant message from a background task.
    pub async fn send_message(&self, content: &str) -> Result<SendHandle, StoreError> {
        struct Prepared {
            conversation_id: String,
            user_message_id: String,
            model: String,
            history: Vec<RequestMessage>,
            extras: Map<String, Value>,
        }

        // Append the user turn; the request history is the resolved chain
        // including it.
        let prepared = self
            .mutate(|state| -> Result<Prepared, StoreError> {
                let active_id = state
                    .active_conversation_id
                    .clone()
                    .ok_or(StoreError::NoActiveConversation)?;
                let conversation = state
                    .conversations
                    .get_mut(&active_id)
                    .ok_or(StoreError::NoActiveConversation)?;

                let mut history: Vec<RequestMessage> =
                    chain::resolve_order(&conversation.messages)?
                        .into_iter()
                        .map(|m| RequestMessage {
                            role: m.role,
                            content: m.content.clone(),
                        })
                        .collect();

                let user = Message::user(conversation.next_reply_id(), content);
                history.push(RequestMessage {
                    role: user.role,
                    content: user.content.clone(),
                });
                let user_message_id = user.message_id.clone();
                conversation.append_message(user);

                Ok(Prepared {
                    conversation_id: active_id,
                    user_message_id,
                    model: conversation.options.model.clone(),
                    history,
                    extras: options_to_extras(&conversation.options),
                })
            })
            .await??;

        let stream_handle = self.inner.transport.send_conversation_stream(
            &prepared.model,
            prepared.history,
            prepared.extras,
        )?;

        // Assistant placeholder replying to the user turn.
        let assistant_message_id = self
            .mutate(|state| {
                let conversation = state
                    .conversations
                    .get_mut(&prepared.conversation_id)
                    .expect("conversation created above still present");
                let placeholder = Message::assistant_placeholder(conversation.next_reply_id());
                let id = placeholder.message_id.clone();
                conversation.append_message(placeholder);
                id
            })
            .await?;

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(drive_send(
            self.clone(),
            prepared.conversation_id,
            assistant_message_id.clone(),
            stream_handle,
            cancel_rx,
            done_tx,
        ));

        Ok(SendHandle {
            user_message_id: prepared.user_message_id,
            assistant_message_id,
            completion: done_rx,
            cancel: Some(cancel_tx),
        })
    }

    /// Switch the active conversation. An id not held locally is an error;
    /// fetching unknown conversations remotely is out of scope.
    pub async fn set_active_conversation(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.mutate(|state| -> Result<(), StoreError> {
            if !state.conversations.contains_key(conversation_id) {
                return Err(StoreError::UnknownConversation(conversation_id.to_string()));
            }
            state.active_conversation_id = Some(conversation_id.to_string());
            Ok(())
        })
        .await?
    }

    /// Shallow-merge the given option keys; no-op for an unknown conversation.
    pub async fn update_conversation_options(
        &self,
        conversation_id: &str,
        patch: OptionsPatch,
    ) -> Result<(), StoreError> {
        self.mutate(|state| {
            if let Some(conversation) = state.conversations.get_mut(conversation_id) {
                patch.apply(&mut conversation.options);
            }
        })
        .await?;
        Ok(())
    }

    /// Remove the message and everything ordered at or after it from the
    /// active conversation. No-op when there is no active conversation or the
    /// id is not part of its chain.
    pub async fn remove_after_message(&self, message_id: &str) -> Result<(), StoreError> {
        self.mutate(|state| -> Result<(), StoreError> {
            let Some(active_id) = state.active_conversation_id.clone() else {
                return Ok(());
            };
            let Some(conversation) = state.conversations.get_mut(&active_id) else {
                return Ok(());
            };

            let (removed, new_tail) = {
                let order = chain::resolve_order(&conversation.messages)?;
                let Some(index) = order.iter().position(|m| m.message_id == message_id) else {
                    return Ok(());
                };
                let removed: Vec<String> =
                    order[index..].iter().map(|m| m.message_id.clone()).collect();
                let new_tail = (index > 0).then(|| order[index - 1].message_id.clone());
                (removed, new_tail)
            };

            for id in &removed {
                conversation.messages.remove(id);
            }
            conversation.tail = new_tail;
            conversation.updated_at = chrono::Utc::now();
            tracing::debug!(count = removed.len(), "removed chain suffix");
            Ok(())
        })
        .await?
    }

    /// Look up a message in the active conversation only.
    pub fn get_message(&self, message_id: &str) -> Option<Message> {
        let state = self.inner.state.lock().unwrap();
        let conversation = state
            .conversations
            .get(state.active_conversation_id.as_deref()?)?;
        conversation.get_message(message_id).cloned()
    }

    /// Snapshot of the active conversation.
    pub fn active_conversation(&self) -> Option<Conversation> {
        let state = self.inner.state.lock().unwrap();
        state
            .conversations
            .get(state.active_conversation_id.as_deref()?)
            .cloned()
    }

    /// Chain-resolved messages of the active conversation, root to tail.
    pub fn active_messages(&self) -> Result<Vec<Message>, StoreError> {
        let state = self.inner.state.lock().unwrap();
        let Some(active_id) = state.active_conversation_id.as_deref() else {
            return Ok(Vec::new());
        };
        let Some(conversation) = state.conversations.get(active_id) else {
            return Ok(Vec::new());
        };
        let order = chain::resolve_order(&conversation.messages)?;
        Ok(order.into_iter().cloned().collect())
    }

    /// Snapshot of the whole store state.
    pub fn snapshot(&self) -> StoreState {
        self.inner.state.lock().unwrap().clone()
    }

    /// Redo the turn that produced `message_id`: truncate from its parent
    /// (inclusive) and resend the parent's content.
    pub async fn regenerate_message(&self, message_id: &str) -> Result<SendHandle, StoreError> {
        let message = self
            .get_message(message_id)
            .ok_or_else(|| StoreError::MessageNotFound(message_id.to_string()))?;
        let parent = self
            .get_message(&message.reply_id)
            .ok_or_else(|| StoreError::MessageNotFound(message.reply_id.clone()))?;

        self.remove_after_message(&parent.message_id).await?;
        self.send_message(&parent.content).await
    }

    /// Replace the turn at `message_id`: truncate from it (inclusive) and
    /// send the new content.
    pub async fn edit_and_resend(
        &self,
        message_id: &str,
        content: &str,
    ) -> Result<SendHandle, StoreError> {
        if self.get_message(message_id).is_none() {
            return Err(StoreError::MessageNotFound(message_id.to_string()));
        }
        self.remove_after_message(message_id).await?;
        self.send_message(content).await
    }

    /// Apply a mutation, bump the revision and persist the new snapshot.
    async fn mutate<R>(&self, op: impl FnOnce(&mut StoreState) -> R) -> Result<R, StorageError> {
        let (result, snapshot) = {
            let mut state = self.inner.state.lock().unwrap();
            let result = op(&mut state);
            let snapshot = serde_json::to_string(&PersistedStateRef {
                version: SCHEMA_VERSION,
                state: &state,
            })
            .expect("store state serializes to JSON");
            (result, snapshot)
        };

        self.inner.revision.send_modify(|revision| *revision += 1);
        self.inner.storage.set(STORE_KEY, &snapshot).await?;
        Ok(result)
    }

    /// Hot-path variant for streamed mutations: a failed bookkeeping write
    /// must not fail the generation, so storage errors are only logged.
    async fn mutate_streamed(&self, op: impl FnOnce(&mut StoreState)) {
        if let Err(e) = self.mutate(op).await {
            tracing::warn!(error = %e, "failed to persist streamed mutation");
        }
    }

    async fn append_streamed_char(&self, conversation_id: &str, message_id: &str, c: char) {
        self.mutate_streamed(|state| {
            let Some(conversation) = state.conversations.get_mut(conversation_id) else {
                return;
            };
            let Some(message) = conversation.get_message_mut(message_id) else {
                return;
            };
            message.content.push(c);
            if message.status == MessageStatus::Loading {
                message.status = MessageStatus::Generating;
            }
        })
        .await;
    }

    async fn mark_status(&self, conversation_id: &str, message_id: &str, status: MessageStatus) {
        self.mutate_streamed(|state| {
            let Some(conversation) = state.conversations.get_mut(conversation_id) else {
                return;
            };
            let Some(message) = conversation.get_message_mut(message_id) else {
                return;
            };
            message.status = status;
        })
        .await;
    }
}

/// Background task driving one send: pace the packet stream into the
/// assistant message and settle the completion signal exactly once.
async fn drive_send(
    store: ChatStore,
    conversation_id: String,
    assistant_id: String,
    stream_handle: StreamHandle,
    mut cancel_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<Result<SendOutcome, StoreError>>,
) {
    let StreamHandle {
        packets,
        cancel: mut transport_cancel,
    } = stream_handle;

    let chars = pacing::pace_characters(packets, pacing::DEFAULT_TICK);
    futures::pin_mut!(chars);

    enum Event {
        Cancelled,
        // Cancel side of the handle dropped; the send runs to completion.
        HandleGone,
        Char(Option<Result<char, StreamError>>),
    }

    let mut cancellable = true;
    let outcome = loop {
        let event = tokio::select! {
            result = &mut cancel_rx, if cancellable => match result {
                Ok(()) => Event::Cancelled,
                Err(_) => Event::HandleGone,
            },
            item = chars.next() => Event::Char(item),
        };

        match event {
            Event::Cancelled => {
                transport_cancel.disconnect();
                store
                    .mark_status(&conversation_id, &assistant_id, MessageStatus::Cancelled)
                    .await;
                tracing::debug!(message_id = %assistant_id, "send cancelled");
                break Ok(SendOutcome::Cancelled);
            }
            Event::HandleGone => cancellable = false,
            Event::Char(Some(Ok(c))) => {
                store
                    .append_streamed_char(&conversation_id, &assistant_id, c)
                    .await;
            }
            Event::Char(Some(Err(e))) => {
                store
                    .mark_status(&conversation_id, &assistant_id, MessageStatus::Failed)
                    .await;
                tracing::warn!(message_id = %assistant_id, error = %e, "send failed");
                break Err(StoreError::from(e));
            }
            Event::Char(None) => {
                store
                    .mark_status(&conversation_id, &assistant_id, MessageStatus::Finish)
                    .await;
                break Ok(SendOutcome::Finished);
            }
        }
    };

    let _ = done_tx.send(outcome);
}

/// Conversation options as extra request fields; the transport strips the
/// protocol-owned keys.
fn options_to_extras(options: &ConversationOptions) -> Map<String, Value> {
    match serde_json::to_value(options) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}
