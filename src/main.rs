//! Quill - terminal chat client
//!
//! Thin REPL over the engine: reads a line, streams the paced reply to the
//! terminal. `/new` starts a conversation, `/retry` regenerates the last
//! failed reply, `/quit` exits.

use std::io::Write as _;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quill_chat::{
    ChatStore, Config, MessageStatus, Role, SendHandle, SendOutcome, SqliteStorage, SseTransport,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quill_chat=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let token = config
        .api_token
        .clone()
        .context("QUILL_API_TOKEN is not set")?;

    let storage = Arc::new(SqliteStorage::new(&config.data_dir.join("quill.db")).await?);
    let transport = Arc::new(SseTransport::new(config.endpoint.clone(), token));
    let store = ChatStore::restore(transport, storage).await?;
    match store.active_conversation() {
        Some(conversation) if !conversation.is_empty() => {
            println!("(resuming '{}', {} messages)", conversation.label, conversation.message_count());
        }
        _ => {
            store.create_conversation(None).await?;
        }
    }

    println!("quill - /new starts a conversation, /retry regenerates, /quit exits");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/new" => {
                store.create_conversation(None).await?;
                println!("(new conversation)");
            }
            "/retry" => {
                let failed = store.active_messages()?.into_iter().rev().find(|m| {
                    m.role == Role::Assistant && m.status == MessageStatus::Failed
                });
                match failed {
                    Some(message) => {
                        let handle = store.regenerate_message(&message.message_id).await?;
                        render_reply(&store, handle).await?;
                    }
                    None => println!("(nothing to retry)"),
                }
            }
            input => {
                let handle = store.send_message(input).await?;
                render_reply(&store, handle).await?;
            }
        }
    }

    Ok(())
}

/// Print the assistant reply as it streams. Rendering only reads store
/// snapshots, driven by the revision watch.
async fn render_reply(store: &ChatStore, mut handle: SendHandle) -> anyhow::Result<()> {
    let assistant_id = handle.assistant_message_id().to_string();
    let mut revision = store.watch_revision();
    let mut printed = 0;

    let outcome = loop {
        tokio::select! {
            outcome = handle.wait() => break outcome,
            result = revision.changed() => {
                if result.is_err() {
                    break handle.wait().await;
                }
                printed = print_new_chars(store, &assistant_id, printed)?;
            }
        }
    };

    print_new_chars(store, &assistant_id, printed)?;
    println!();

    match outcome {
        Ok(SendOutcome::Finished) => {}
        Ok(SendOutcome::Cancelled) => println!("(cancelled)"),
        Err(e) => println!("(failed: {e} - /retry to regenerate)"),
    }
    Ok(())
}

fn print_new_chars(
    store: &ChatStore,
    assistant_id: &str,
    printed: usize,
) -> anyhow::Result<usize> {
    let Some(message) = store.get_message(assistant_id) else {
        return Ok(printed);
    };
    let chars: Vec<char> = message.content.chars().collect();
    if chars.len() > printed {
        let suffix: String = chars[printed..].iter().collect();
        print!("{suffix}");
        std::io::stdout().flush()?;
    }
    Ok(chars.len().max(printed))
}
