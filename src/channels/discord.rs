use super::traits::{Channel, ChannelEvent, ChannelInfo};
use crate::history::{MessageRef, MessageStore, StoredMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::OnceLock;
use tokio_tungstenite::tungstenite::Message;

const API_BASE: &str = "https://discord.com/api/v10";

/// Discord's maximum message length for regular messages.
const MAX_MESSAGE_LEN: usize = 2000;

/// How often the typing indicator is re-posted while active.
const TYPING_REFRESH_SECS: u64 = 8;

/// Gateway intents: GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT | DIRECT_MESSAGES.
const GATEWAY_INTENTS: u64 = 37377;

/// Discord channel — REST for message operations, Gateway WebSocket for the
/// real-time event stream.
pub struct DiscordChannel {
    bot_token: String,
    client: reqwest::Client,
    bot_user_id: OnceLock<String>,
    typing_handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DiscordChannel {
    pub fn new(bot_token: String) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
            bot_user_id: OnceLock::new(),
            typing_handle: parking_lot::Mutex::new(None),
        }
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    async fn post_message(&self, channel_id: &str, body: serde_json::Value) -> anyhow::Result<()> {
        let url = format!("{API_BASE}/channels/{channel_id}/messages");
        let resp = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err = resp
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read response body: {e}>"));
            anyhow::bail!("Discord send message failed ({status}): {err}");
        }
        Ok(())
    }
}

/// Split a message into chunks that respect Discord's length limit,
/// preferring newline and word boundaries.
fn split_message(message: &str) -> Vec<String> {
    if message.len() <= MAX_MESSAGE_LEN {
        return vec![message.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = message;

    while !remaining.is_empty() {
        let chunk_end = if remaining.len() <= MAX_MESSAGE_LEN {
            remaining.len()
        } else {
            let limit = floor_char_boundary(remaining, MAX_MESSAGE_LEN);
            let search_area = &remaining[..limit];

            // Prefer a newline break, unless it sits in the first half.
            if let Some(pos) = search_area.rfind('\n') {
                if pos >= limit / 2 {
                    pos + 1
                } else {
                    search_area.rfind(' ').map_or(limit, |p| p + 1)
                }
            } else if let Some(pos) = search_area.rfind(' ') {
                pos + 1
            } else {
                limit
            }
        };

        chunks.push(remaining[..chunk_end].to_string());
        remaining = &remaining[chunk_end..];
    }

    chunks
}

/// Greatest char boundary at or below `index`.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Parse a MESSAGE_CREATE payload into a [`ChannelEvent`].
///
/// Returns `None` for messages this bot must never react to: its own,
/// other bots' (loop prevention), and empty-content events such as embeds
/// the MESSAGE_CONTENT intent does not cover.
fn parse_message_create(d: &serde_json::Value, bot_user_id: &str) -> Option<ChannelEvent> {
    let author = d.get("author")?;
    let author_id = author.get("id").and_then(|i| i.as_str()).unwrap_or("");
    if author_id == bot_user_id {
        return None;
    }
    if author
        .get("bot")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
    {
        return None;
    }

    let content = d.get("content").and_then(|c| c.as_str()).unwrap_or("");
    if content.is_empty() {
        return None;
    }

    let id = d.get("id").and_then(|i| i.as_str())?.to_string();
    let channel_id = d.get("channel_id").and_then(|c| c.as_str())?.to_string();

    let reference = d.get("message_reference").and_then(|r| {
        let message_id = r.get("message_id").and_then(|m| m.as_str())?;
        let ref_channel = r
            .get("channel_id")
            .and_then(|c| c.as_str())
            .unwrap_or(&channel_id);
        Some(MessageRef {
            channel_id: ref_channel.to_string(),
            message_id: message_id.to_string(),
        })
    });

    let mentions_me = d
        .get("mentions")
        .and_then(|m| m.as_array())
        .is_some_and(|mentions| {
            mentions
                .iter()
                .any(|u| u.get("id").and_then(|i| i.as_str()) == Some(bot_user_id))
        });

    Some(ChannelEvent {
        message: StoredMessage {
            id,
            channel_id,
            author_id: author_id.to_string(),
            content: content.to_string(),
            reference,
        },
        mentions_me,
    })
}

/// Parse a REST message payload into a [`StoredMessage`].
fn parse_stored_message(v: &serde_json::Value) -> Option<StoredMessage> {
    let channel_id = v.get("channel_id").and_then(|c| c.as_str())?.to_string();
    let reference = v.get("message_reference").and_then(|r| {
        let message_id = r.get("message_id").and_then(|m| m.as_str())?;
        let ref_channel = r
            .get("channel_id")
            .and_then(|c| c.as_str())
            .unwrap_or(&channel_id);
        Some(MessageRef {
            channel_id: ref_channel.to_string(),
            message_id: message_id.to_string(),
        })
    });

    Some(StoredMessage {
        id: v.get("id").and_then(|i| i.as_str())?.to_string(),
        channel_id,
        author_id: v
            .get("author")
            .and_then(|a| a.get("id"))
            .and_then(|i| i.as_str())
            .unwrap_or("")
            .to_string(),
        content: v
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string(),
        reference,
    })
}

#[async_trait]
impl MessageStore for DiscordChannel {
    async fn resolve(&self, reference: &MessageRef) -> anyhow::Result<Option<StoredMessage>> {
        let url = format!(
            "{API_BASE}/channels/{}/messages/{}",
            reference.channel_id, reference.message_id
        );
        let resp = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("Discord fetch message failed ({})", resp.status());
        }

        let body: serde_json::Value = resp.json().await?;
        Ok(parse_stored_message(&body))
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn identify(&self) -> anyhow::Result<String> {
        if let Some(id) = self.bot_user_id.get() {
            return Ok(id.clone());
        }

        let resp = self
            .client
            .get(format!("{API_BASE}/users/@me"))
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        if !resp.status().is_success() {
            anyhow::bail!("Discord identity lookup failed ({})", resp.status());
        }

        let body: serde_json::Value = resp.json().await?;
        let id = body
            .get("id")
            .and_then(|i| i.as_str())
            .ok_or_else(|| anyhow::anyhow!("Discord /users/@me returned no id"))?
            .to_string();

        let _ = self.bot_user_id.set(id.clone());
        Ok(id)
    }

    fn is_self(&self, author_id: &str) -> bool {
        self.bot_user_id
            .get()
            .is_some_and(|id| id == author_id && !author_id.is_empty())
    }

    async fn send(&self, channel_id: &str, text: &str) -> anyhow::Result<()> {
        let chunks = split_message(text);

        for (i, chunk) in chunks.iter().enumerate() {
            self.post_message(channel_id, json!({ "content": chunk }))
                .await?;

            // Small delay between chunks to stay under the rate limit.
            if i < chunks.len() - 1 {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
        }

        Ok(())
    }

    async fn reply(&self, channel_id: &str, message_id: &str, text: &str) -> anyhow::Result<()> {
        let chunks = split_message(text);

        for (i, chunk) in chunks.iter().enumerate() {
            // Only the first chunk carries the reply reference; follow-ups
            // land as plain messages underneath it.
            let body = if i == 0 {
                json!({
                    "content": chunk,
                    "message_reference": { "message_id": message_id },
                })
            } else {
                json!({ "content": chunk })
            };
            self.post_message(channel_id, body).await?;

            if i < chunks.len() - 1 {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
        }

        Ok(())
    }

    async fn get_channel(&self, channel_id: &str) -> anyhow::Result<Option<ChannelInfo>> {
        let url = format!("{API_BASE}/channels/{channel_id}");
        let resp = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("Discord fetch channel failed ({})", resp.status());
        }

        let body: serde_json::Value = resp.json().await?;
        Ok(Some(ChannelInfo {
            id: body
                .get("id")
                .and_then(|i| i.as_str())
                .unwrap_or(channel_id)
                .to_string(),
            name: body
                .get("name")
                .and_then(|n| n.as_str())
                .map(str::to_string),
        }))
    }

    async fn start_typing(&self, channel_id: &str) -> anyhow::Result<()> {
        self.stop_typing(channel_id).await?;

        let client = self.client.clone();
        let auth = self.auth_header();
        let channel_id = channel_id.to_string();

        let handle = tokio::spawn(async move {
            let url = format!("{API_BASE}/channels/{channel_id}/typing");
            loop {
                let _ = client
                    .post(&url)
                    .header("Authorization", auth.clone())
                    .send()
                    .await;
                tokio::time::sleep(std::time::Duration::from_secs(TYPING_REFRESH_SECS)).await;
            }
        });

        *self.typing_handle.lock() = Some(handle);
        Ok(())
    }

    async fn stop_typing(&self, _channel_id: &str) -> anyhow::Result<()> {
        if let Some(handle) = self.typing_handle.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!("{API_BASE}/users/@me"))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn listen(&self, tx: tokio::sync::mpsc::Sender<ChannelEvent>) -> anyhow::Result<()> {
        let bot_user_id = self.identify().await?;

        // Get Gateway URL
        let gw_resp: serde_json::Value = self
            .client
            .get(format!("{API_BASE}/gateway/bot"))
            .header("Authorization", self.auth_header())
            .send()
            .await?
            .json()
            .await?;

        let gw_url = gw_resp
            .get("url")
            .and_then(|u| u.as_str())
            .unwrap_or("wss://gateway.discord.gg");

        let ws_url = format!("{gw_url}/?v=10&encoding=json");
        tracing::info!("Discord: connecting to gateway...");

        let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url).await?;
        let (mut write, mut read) = ws_stream.split();

        // Read Hello (opcode 10)
        let hello = read.next().await.ok_or(anyhow::anyhow!("No hello"))??;
        let hello_data: serde_json::Value = serde_json::from_str(&hello.to_string())?;
        let heartbeat_interval = hello_data
            .get("d")
            .and_then(|d| d.get("heartbeat_interval"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(41250);

        // Send Identify (opcode 2)
        let identify = json!({
            "op": 2,
            "d": {
                "token": self.bot_token,
                "intents": GATEWAY_INTENTS,
                "properties": {
                    "os": "linux",
                    "browser": "herald",
                    "device": "herald"
                }
            }
        });
        write.send(Message::Text(identify.to_string().into())).await?;

        tracing::info!("Discord: connected and identified");

        // Last sequence number, for heartbeats. Only touched in the select!
        // loop below, so a plain i64 suffices.
        let mut sequence: i64 = -1;

        // Heartbeat timer sends tick signals; the heartbeat itself is
        // assembled in the select! loop where `sequence` lives.
        let (hb_tx, mut hb_rx) = tokio::sync::mpsc::channel::<()>(1);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(heartbeat_interval));
            loop {
                interval.tick().await;
                if hb_tx.send(()).await.is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                _ = hb_rx.recv() => {
                    let d = if sequence >= 0 { json!(sequence) } else { json!(null) };
                    let hb = json!({"op": 1, "d": d});
                    if write.send(Message::Text(hb.to_string().into())).await.is_err() {
                        break;
                    }
                }
                msg = read.next() => {
                    let msg = match msg {
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Close(_))) | None => break,
                        _ => continue,
                    };

                    let event: serde_json::Value = match serde_json::from_str(&msg) {
                        Ok(e) => e,
                        Err(_) => continue,
                    };

                    if let Some(s) = event.get("s").and_then(serde_json::Value::as_i64) {
                        sequence = s;
                    }

                    let op = event.get("op").and_then(serde_json::Value::as_u64).unwrap_or(0);
                    match op {
                        // Op 1: server requests an immediate heartbeat
                        1 => {
                            let d = if sequence >= 0 { json!(sequence) } else { json!(null) };
                            let hb = json!({"op": 1, "d": d});
                            if write.send(Message::Text(hb.to_string().into())).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        // Op 7: Reconnect
                        7 => {
                            tracing::warn!("Discord: received Reconnect (op 7), closing for restart");
                            break;
                        }
                        // Op 9: Invalid Session
                        9 => {
                            tracing::warn!("Discord: received Invalid Session (op 9), closing for restart");
                            break;
                        }
                        _ => {}
                    }

                    let event_type = event.get("t").and_then(|t| t.as_str()).unwrap_or("");
                    if event_type != "MESSAGE_CREATE" {
                        continue;
                    }

                    let Some(d) = event.get("d") else {
                        continue;
                    };

                    if let Some(channel_event) = parse_message_create(d, &bot_user_id) {
                        if tx.send(channel_event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
