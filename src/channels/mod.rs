//! Channel runtime: the chat run-loop and its event handler.
//!
//! One task owns the conversation side of the bot. It drains two queues
//! (inbound channel events from the listener, dispatched jobs from the
//! HTTP gateway) and executes them one at a time, so every touch of the
//! chat client's send surface is serialized on this loop. The gateway never
//! calls chat-send directly; it goes through [`crate::dispatch::Dispatcher`].

pub mod discord;
pub mod traits;

pub use discord::DiscordChannel;
pub use traits::{Channel, ChannelEvent, ChannelInfo};

use crate::dispatch::JobReceiver;
use crate::generator::Generator;
use crate::history::HistoryBuilder;
use crate::util::truncate_with_ellipsis;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Fixed user-visible reply when anything fails after mention detection.
const APOLOGY_REPLY: &str = "Sorry, something went wrong while handling that message.";

/// Queue depth for inbound channel events.
pub const EVENT_QUEUE_DEPTH: usize = 64;

/// Everything the event handler needs, constructed once at startup.
pub struct ChatRuntime {
    pub channel: Arc<dyn Channel>,
    pub generator: Arc<Generator>,
    pub system_prompt: String,
    pub history: HistoryBuilder,
    pub mention: Regex,
    pub self_id: String,
}

impl ChatRuntime {
    /// Drive the chat run-loop until both queues close.
    ///
    /// Events and dispatched jobs are handled strictly one at a time: a
    /// suspended generation call keeps its place in line, so nothing else
    /// touches the channel until it resolves.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<ChannelEvent>,
        mut jobs: JobReceiver,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                job = jobs.recv() => match job {
                    Some(job) => job().await,
                    None => break,
                },
            }
        }
    }

    /// Handle one inbound event: mention gate, then context → generation →
    /// threaded reply. Failures after the mention gate surface as a fixed
    /// apology, never as silence.
    async fn handle_event(&self, event: ChannelEvent) {
        if !event.mentions_me {
            return;
        }

        let message = &event.message;
        tracing::info!(
            author = %message.author_id,
            channel = %message.channel_id,
            "Mention: {}",
            truncate_with_ellipsis(&message.content, 80)
        );

        if let Err(e) = self.channel.start_typing(&message.channel_id).await {
            tracing::debug!("Failed to start typing: {e}");
        }

        let history = self
            .history
            .build(self.channel.as_ref(), message, &self.mention, &self.self_id)
            .await;

        let outcome = self.generator.generate(&history, &self.system_prompt).await;

        let _ = self.channel.stop_typing(&message.channel_id).await;

        let reply_text = match outcome {
            Ok(text) => {
                tracing::info!("Reply: {}", truncate_with_ellipsis(&text, 80));
                text
            }
            Err(e) => {
                tracing::error!("Generation failed: {e:#}");
                APOLOGY_REPLY.to_string()
            }
        };

        if let Err(e) = self
            .channel
            .reply(&message.channel_id, &message.id, &reply_text)
            .await
        {
            tracing::error!("Failed to reply in channel {}: {e}", message.channel_id);
        }
    }
}

/// Run a channel listener forever, restarting it with exponential backoff
/// when it errors or exits. Stops once the event queue is closed.
pub fn spawn_supervised_listener(
    channel: Arc<dyn Channel>,
    tx: mpsc::Sender<ChannelEvent>,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            let result = channel.listen(tx.clone()).await;

            if tx.is_closed() {
                break;
            }

            match result {
                Ok(()) => {
                    tracing::warn!("Channel {} exited unexpectedly; restarting", channel.name());
                    backoff = initial_backoff_secs.max(1);
                }
                Err(e) => {
                    tracing::error!("Channel {} error: {e}; restarting", channel.name());
                }
            }

            tokio::time::sleep(Duration::from_secs(backoff)).await;
            // Double backoff AFTER sleeping so the first retry uses the
            // initial interval.
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}
