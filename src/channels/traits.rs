use crate::history::{MessageStore, StoredMessage};
use async_trait::async_trait;

/// An inbound event from a channel's message stream.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub message: StoredMessage,
    /// Whether the bot's own identity was mentioned in the message.
    pub mentions_me: bool,
}

/// A resolved channel on the chat platform.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub id: String,
    pub name: Option<String>,
}

/// Core channel trait — implement for any messaging platform.
///
/// Resolution of reply back-references comes from the [`MessageStore`]
/// supertrait; everything here is the write/side-effect surface. Send and
/// reply operations must only be invoked from the chat run-loop (directly
/// by the event handler, or via a dispatched action).
#[async_trait]
pub trait Channel: MessageStore {
    /// Human-readable channel name.
    fn name(&self) -> &str;

    /// The bot's own user id, fetched once and cached.
    async fn identify(&self) -> anyhow::Result<String>;

    /// Whether `author_id` is the bot's own identity.
    fn is_self(&self, author_id: &str) -> bool;

    /// Send a message to a channel.
    async fn send(&self, channel_id: &str, text: &str) -> anyhow::Result<()>;

    /// Reply to a specific message in its channel (threaded reply).
    async fn reply(&self, channel_id: &str, message_id: &str, text: &str) -> anyhow::Result<()>;

    /// Look up a channel. `Ok(None)` means it does not exist.
    async fn get_channel(&self, channel_id: &str) -> anyhow::Result<Option<ChannelInfo>>;

    /// Signal that the bot is composing a response. Implementations repeat
    /// the indicator as their platform requires until `stop_typing`.
    async fn start_typing(&self, _channel_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Stop any active typing indicator.
    async fn stop_typing(&self, _channel_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Check if the channel is healthy.
    async fn health_check(&self) -> bool {
        true
    }

    /// Start listening for incoming messages (long-running).
    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelEvent>) -> anyhow::Result<()>;
}
