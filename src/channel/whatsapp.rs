//! WhatsApp channel adapter, speaking to a local multidevice bridge's REST
//! API (the shape exposed by the common Go `whatsmeow`-based bridges: a
//! long-poll `/messages` endpoint for inbound events and a `/send` endpoint
//! for outbound).
//!
//! No teacher adapter exists for this provider; the reqwest client and
//! polling-loop shape are grounded on `backend/sandbox.rs`'s own
//! provision-then-poll REST client, the closest in-crate precedent for a
//! "poll a bridge process over HTTP" integration.

use crate::channel::{Channel, ChannelOpts, DedupCache, SendReceipt};
use crate::error::{ChannelError, Result};
use crate::{InboundMessage, Jid, OutboundResponse};

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const WHATSAPP_MESSAGE_CAP: usize = 65_536;

#[derive(Debug, Deserialize)]
struct BridgeMessage {
    id: String,
    chat_id: String,
    sender_id: String,
    sender_name: String,
    text: String,
    timestamp: i64,
    from_me: bool,
}

pub struct WhatsAppChannel {
    bridge_url: String,
    client: reqwest::Client,
    opts: ChannelOpts,
    connected: Arc<AtomicBool>,
    dedup: Arc<DedupCache>,
}

impl WhatsAppChannel {
    pub fn new(bridge_url: impl Into<String>, opts: ChannelOpts) -> Self {
        Self {
            bridge_url: bridge_url.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(35))
                .build()
                .expect("reqwest client construction cannot fail with this configuration"),
            opts,
            connected: Arc::new(AtomicBool::new(false)),
            dedup: Arc::new(DedupCache::with_defaults()),
        }
    }

    fn chat_id(jid: &Jid) -> &str {
        jid.as_str().split_once(':').map(|(_, rest)| rest).unwrap_or(jid.as_str())
    }

    fn poll_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut cursor: Option<String> = None;
            // Tracks whether the previous poll failed, so a subsequent success
            // can be reported as a recovery (re-enqueues chats the scheduler
            // went stale on) rather than routine steady-state polling.
            let mut was_down = false;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            self.connected.store(false, Ordering::SeqCst);
                            return;
                        }
                    }
                    result = self.fetch_batch(cursor.clone()) => {
                        match result {
                            Ok((messages, next_cursor)) => {
                                self.connected.store(true, Ordering::SeqCst);
                                if was_down {
                                    was_down = false;
                                    info!("whatsapp bridge recovered");
                                    (self.opts.on_recovery)("whatsapp").await;
                                }
                                cursor = next_cursor.or(cursor);
                                for message in messages {
                                    if message.from_me {
                                        continue;
                                    }
                                    if !self.dedup.insert_if_new(format!("whatsapp:{}", message.id)) {
                                        continue;
                                    }
                                    let inbound = InboundMessage {
                                        id: message.id,
                                        chat_jid: Jid::new(format!("whatsapp:{}", message.chat_id)),
                                        sender_id: message.sender_id,
                                        sender_name: message.sender_name,
                                        content: message.text,
                                        timestamp: chrono::DateTime::from_timestamp(message.timestamp, 0)
                                            .unwrap_or_else(chrono::Utc::now),
                                        source_timestamp: Some(message.timestamp),
                                        is_from_me: false,
                                        is_bot: false,
                                        metadata: std::collections::HashMap::new(),
                                    };
                                    (self.opts.on_message)(inbound).await;
                                }
                            }
                            Err(error) => {
                                self.connected.store(false, Ordering::SeqCst);
                                was_down = true;
                                warn!(%error, "whatsapp bridge long-poll failed, retrying");
                                tokio::time::sleep(Duration::from_secs(2)).await;
                            }
                        }
                    }
                }
            }
        });
    }

    async fn fetch_batch(&self, cursor: Option<String>) -> anyhow::Result<(Vec<BridgeMessage>, Option<String>)> {
        #[derive(Deserialize)]
        struct Page {
            messages: Vec<BridgeMessage>,
            next_cursor: Option<String>,
        }
        let mut req = self.client.get(format!("{}/messages", self.bridge_url)).query(&[("wait", "30")]);
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }
        let page: Page = req.send().await?.error_for_status()?.json().await?;
        Ok((page.messages, page.next_cursor))
    }
}

#[async_trait]
impl Channel for WhatsAppChannel {
    fn name(&self) -> &'static str {
        "whatsapp"
    }

    async fn connect(&self) -> Result<()> {
        self.client
            .get(format!("{}/health", self.bridge_url))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|source| ChannelError::Other(anyhow::anyhow!(source)))?;
        info!(bridge = %self.bridge_url, "whatsapp bridge reachable");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, jid: &Jid, response: OutboundResponse) -> Result<SendReceipt> {
        let chat_id = Self::chat_id(jid);

        let body = match response {
            OutboundResponse::Text(text) => {
                let chunks = super::split_message(&text, WHATSAPP_MESSAGE_CAP);
                let mut last = None;
                for chunk in chunks {
                    last = Some(self.post_send(chat_id, serde_json::json!({ "type": "text", "text": chunk })).await?);
                }
                return Ok(SendReceipt { timestamp: last });
            }
            OutboundResponse::Reaction { target_timestamp, emoji, .. } => {
                serde_json::json!({ "type": "react", "target_id": target_timestamp, "emoji": emoji })
            }
            OutboundResponse::RemoveReaction { target_timestamp, .. } => {
                serde_json::json!({ "type": "react", "target_id": target_timestamp, "emoji": "" })
            }
            OutboundResponse::Edit { target_timestamp, text, .. } => {
                serde_json::json!({ "type": "edit", "target_id": target_timestamp, "text": text })
            }
            OutboundResponse::Delete { target_timestamp, .. } => {
                serde_json::json!({ "type": "delete", "target_id": target_timestamp })
            }
            OutboundResponse::Poll { question, options } => {
                serde_json::json!({ "type": "poll", "question": question, "options": options })
            }
            OutboundResponse::Typing(on) => {
                serde_json::json!({ "type": "typing", "on": on })
            }
        };
        let timestamp = self.post_send(chat_id, body).await?;
        Ok(SendReceipt { timestamp })
    }
}

impl WhatsAppChannel {
    /// Spawn the bridge's inbound long-poll loop; separate from `connect`
    /// so the orchestrator can wire the shutdown signal once group startup
    /// has resolved which channels are actually in use.
    pub fn spawn_poll_loop(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        self.clone().poll_loop(shutdown);
    }

    async fn post_send(&self, chat_id: &str, mut body: serde_json::Value) -> Result<Option<String>> {
        body["chat_id"] = serde_json::Value::String(chat_id.to_string());
        #[derive(Deserialize)]
        struct SendAck {
            message_id: Option<String>,
        }
        let ack: SendAck = self
            .client
            .post(format!("{}/send", self.bridge_url))
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|source| ChannelError::SendFailed { channel: "whatsapp".to_string(), reason: source.to_string() })?
            .json()
            .await
            .map_err(|source| ChannelError::SendFailed { channel: "whatsapp".to_string(), reason: source.to_string() })?;
        Ok(ack.message_id)
    }
}
