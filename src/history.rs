//! Conversation-context reconstruction.
//!
//! A triggering message plus its chain of reply back-references is the only
//! conversation state this system has: the chat platform owns the messages,
//! we walk them. [`HistoryBuilder`] turns that chain into a bounded, ordered
//! turn sequence ready for a generation call.
//!
//! The walk is an iterative traversal over an externally owned, potentially
//! inconsistent store: any link may have been deleted since the reply was
//! written, so resolution failures truncate the history instead of failing
//! the whole operation.

use crate::providers::ChatMessage;
use async_trait::async_trait;
use regex::Regex;

/// An opaque pointer to one message in the platform's store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub channel_id: String,
    pub message_id: String,
}

/// A message resolved from the store.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    /// The message this one replies to, if any.
    pub reference: Option<MessageRef>,
}

/// Read-only access to the platform's message store.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Resolve a back-reference. `Ok(None)` means the message no longer
    /// exists (deleted/expired); `Err` is a transport failure.
    async fn resolve(&self, reference: &MessageRef) -> anyhow::Result<Option<StoredMessage>>;
}

pub struct HistoryBuilder {
    max_depth: usize,
}

impl HistoryBuilder {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
        }
    }

    /// Reconstruct the conversation ending at `origin`.
    ///
    /// Walks the reply chain backwards, newest to oldest, prepending one
    /// cleaned turn per message: mention markers stripped, surrounding
    /// whitespace trimmed, author classified as assistant when it is the
    /// bot's own identity (`self_id`). Stops at the depth bound or at the
    /// first unresolvable reference, whichever comes first; partial
    /// context is acceptable. The last turn is always `origin` itself.
    pub async fn build(
        &self,
        store: &dyn MessageStore,
        origin: &StoredMessage,
        mention: &Regex,
        self_id: &str,
    ) -> Vec<ChatMessage> {
        let mut turns: Vec<ChatMessage> = Vec::new();
        let mut current = origin.clone();

        for _ in 0..self.max_depth {
            turns.insert(0, clean_turn(&current, mention, self_id));

            let Some(reference) = current.reference.clone() else {
                break;
            };

            match store.resolve(&reference).await {
                Ok(Some(message)) => current = message,
                Ok(None) => {
                    tracing::warn!(
                        message_id = %reference.message_id,
                        "Referenced message not found; truncating history"
                    );
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        message_id = %reference.message_id,
                        "Failed to resolve referenced message: {e}; truncating history"
                    );
                    break;
                }
            }
        }

        turns
    }
}

fn clean_turn(message: &StoredMessage, mention: &Regex, self_id: &str) -> ChatMessage {
    let content = mention.replace_all(&message.content, " ");
    let content = content.trim();

    if message.author_id == self_id {
        ChatMessage::assistant(content)
    } else {
        ChatMessage::user(content)
    }
}

/// The mention-marker pattern for a bot user id: `<@ID>` or `<@!ID>`.
pub fn mention_pattern(bot_user_id: &str) -> Regex {
    // The id is numeric, so no escaping is needed; fall back to a
    // never-matching pattern rather than panicking on a malformed id.
    Regex::new(&format!("<@!?{bot_user_id}>"))
        .unwrap_or_else(|_| Regex::new(r"\z.").expect("static pattern"))
}
