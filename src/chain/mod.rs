//! Reply-chain resolution
//!
//! A conversation stores its messages unordered; total order is recovered by
//! following the reply links from the root (empty `reply_id`) to the tail.
//! Malformed link graphs are reported as typed errors instead of looping or
//! panicking, so callers can still render the usable prefix.

use std::collections::HashMap;

use thiserror::Error;

use crate::conversation::Message;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("conversation has no root message (empty replyId)")]
    MissingRoot,

    #[error("two messages reply to '{reply_id}'")]
    ForkedChain { reply_id: String },

    #[error("no message replies to '{message_id}' but the chain is not exhausted")]
    BrokenChain { message_id: String },
}

/// Resolve the total root-to-tail order of a message arena.
///
/// Deterministic and idempotent for a fixed input; an empty arena resolves to
/// an empty order. A cycle surfaces as [`ChainError::BrokenChain`] because the
/// walk from the root can never reach the full message count.
pub fn resolve_order(messages: &HashMap<String, Message>) -> Result<Vec<&Message>, ChainError> {
    if messages.is_empty() {
        return Ok(Vec::new());
    }

    let mut by_reply: HashMap<&str, &Message> = HashMap::with_capacity(messages.len());
    for message in messages.values() {
        if by_reply.insert(message.reply_id.as_str(), message).is_some() {
            return Err(ChainError::ForkedChain {
                reply_id: message.reply_id.clone(),
            });
        }
    }

    let root = *by_reply.get("").ok_or(ChainError::MissingRoot)?;

    let mut order = Vec::with_capacity(messages.len());
    order.push(root);
    while order.len() < messages.len() {
        let last = order[order.len() - 1];
        match by_reply.get(last.message_id.as_str()) {
            Some(&next) => order.push(next),
            None => {
                return Err(ChainError::BrokenChain {
                    message_id: last.message_id.clone(),
                })
            }
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{MessageStatus, Role};

    fn message(id: &str, reply_id: &str) -> Message {
        Message {
            message_id: id.to_string(),
            reply_id: reply_id.to_string(),
            role: Role::User,
            content: format!("content of {id}"),
            status: MessageStatus::Finish,
        }
    }

    fn arena(messages: Vec<Message>) -> HashMap<String, Message> {
        messages
            .into_iter()
            .map(|m| (m.message_id.clone(), m))
            .collect()
    }

    #[test]
    fn test_resolves_shuffled_input() {
        let messages = arena(vec![
            message("c", "b"),
            message("a", ""),
            message("b", "a"),
        ]);

        let order = resolve_order(&messages).unwrap();
        assert_eq!(order.len(), 3);
        assert_eq!(order[0].message_id, "a");
        assert_eq!(order[1].message_id, "b");
        assert_eq!(order[2].message_id, "c");
    }

    #[test]
    fn test_link_properties() {
        let messages = arena(vec![
            message("a", ""),
            message("b", "a"),
            message("c", "b"),
            message("d", "c"),
        ]);

        let order = resolve_order(&messages).unwrap();
        assert_eq!(order.len(), messages.len());
        assert_eq!(order[0].reply_id, "");
        for pair in order.windows(2) {
            assert_eq!(pair[1].reply_id, pair[0].message_id);
        }
    }

    #[test]
    fn test_idempotent() {
        let messages = arena(vec![message("a", ""), message("b", "a")]);

        let first: Vec<String> = resolve_order(&messages)
            .unwrap()
            .iter()
            .map(|m| m.message_id.clone())
            .collect();
        let second: Vec<String> = resolve_order(&messages)
            .unwrap()
            .iter()
            .map(|m| m.message_id.clone())
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_arena() {
        let empty = HashMap::new();
        let order = resolve_order(&empty).unwrap();
        assert!(order.is_empty());
    }

    #[test]
    fn test_missing_root() {
        let messages = arena(vec![message("b", "a"), message("c", "b")]);
        assert_eq!(resolve_order(&messages), Err(ChainError::MissingRoot));
    }

    #[test]
    fn test_forked_chain() {
        let messages = arena(vec![
            message("a", ""),
            message("b", "a"),
            message("c", "a"),
        ]);
        assert_eq!(
            resolve_order(&messages),
            Err(ChainError::ForkedChain {
                reply_id: "a".to_string()
            })
        );
    }

    #[test]
    fn test_broken_link() {
        let messages = arena(vec![message("a", ""), message("c", "missing")]);
        assert_eq!(
            resolve_order(&messages),
            Err(ChainError::BrokenChain {
                message_id: "a".to_string()
            })
        );
    }

    #[test]
    fn test_detached_cycle() {
        // Root exists but two messages reply to each other off the path.
        let messages = arena(vec![
            message("a", ""),
            message("x", "y"),
            message("y", "x"),
        ]);
        assert_eq!(
            resolve_order(&messages),
            Err(ChainError::BrokenChain {
                message_id: "a".to_string()
            })
        );
    }
}
