//! Quill - streaming chat engine
//!
//! Multi-turn conversations against an OpenAI-compatible streaming endpoint:
//! the SSE reply is decoded into text increments, paced into a steady typing
//! cadence, and committed character by character into a reply-chained message
//! history that persists across restarts.
//!
//! The pieces, leaves first:
//!
//! - [`stream`] decodes the response body into [`stream::Packet`]s
//! - [`transport`] builds the request and owns the wire protocol
//! - [`pacing`] smooths packet bursts into one character per tick
//! - [`store`] owns all conversation state and the mutation contract
//! - [`chain`] recovers message order from the reply links

pub mod chain;
pub mod config;
pub mod conversation;
pub mod ids;
pub mod pacing;
pub mod storage;
pub mod store;
pub mod stream;
pub mod transport;

pub use chain::{resolve_order, ChainError};
pub use config::Config;
pub use conversation::{
    Conversation, ConversationOptions, Message, MessageStatus, OptionsPatch, Role,
};
pub use storage::{MemoryStorage, SqliteStorage, StateStorage};
pub use store::{ChatStore, SendHandle, SendOutcome, StoreError};
pub use transport::{ConversationTransport, SseTransport};
