//! Telegram channel adapter.
//!
//! The teacher's own `messaging/telegram.rs` is an unimplemented stub (a
//! `TelegramAdapter` struct with no `Messaging` impl), so this adapter is
//! built from scratch against `teloxide`'s long-polling `Dispatcher`, in the
//! same update-loop style the pack's Discord/Slack adapters use for their
//! own event sources.

use crate::channel::reconnect::{Reconnector, ReconnectPolicy};
use crate::channel::{Channel, ChannelOpts, DedupCache, SendReceipt, TypingLimiter};
use crate::error::{ChannelError, Result};
use crate::{InboundMessage, Jid, OutboundResponse};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageId, ReactionType};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};

const TELEGRAM_MESSAGE_CAP: usize = 4096;

pub struct TelegramChannel {
    bot: Bot,
    opts: ChannelOpts,
    connected: Arc<AtomicBool>,
    shutdown: RwLock<Option<teloxide::dispatching::ShutdownToken>>,
    reconnector: Arc<Reconnector>,
    dedup: Arc<DedupCache>,
    typing_limiter: TypingLimiter,
}

impl TelegramChannel {
    pub fn new(token: impl Into<String>, opts: ChannelOpts) -> Self {
        Self {
            bot: Bot::new(token.into()),
            opts,
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: RwLock::new(None),
            reconnector: Arc::new(Reconnector::new(ReconnectPolicy::default())),
            dedup: Arc::new(DedupCache::with_defaults()),
            typing_limiter: TypingLimiter::with_defaults(),
        }
    }

    /// Spawn the host-owned watchdog that notices the long-poll dispatcher
    /// exiting (teloxide retries individual `getUpdates` calls itself, but a
    /// dispatcher that has fully stopped needs to be rebuilt) and fires
    /// `on_recovery` so the scheduler re-enqueues chats that went stale.
    pub fn spawn_watchdog(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let this = self.clone();
        let connected = self.connected.clone();
        let on_recovery = self.opts.on_recovery.clone();
        let reconnector = self.reconnector.clone();
        tokio::spawn(async move {
            reconnector
                .run(
                    "telegram",
                    move || connected.load(Ordering::SeqCst),
                    move || {
                        let this = this.clone();
                        async move { this.connect().await }
                    },
                    on_recovery,
                    shutdown,
                )
                .await;
        });
    }

    fn parse_jid(jid: &Jid) -> Result<ChatId> {
        jid.as_str()
            .rsplit(':')
            .next()
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(ChatId)
            .ok_or_else(|| ChannelError::Other(anyhow::anyhow!("invalid telegram jid: {jid}")).into())
    }

    fn parse_message_id(raw: &str) -> Result<MessageId> {
        raw.parse::<i32>()
            .map(MessageId)
            .map_err(|_| ChannelError::Other(anyhow::anyhow!("invalid telegram message id: {raw}")).into())
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn connect(&self) -> Result<()> {
        let bot = self.bot.clone();
        let on_message = self.opts.on_message.clone();
        let connected = self.connected.clone();
        let dedup = self.dedup.clone();

        let handler = Update::filter_message().endpoint(
            move |msg: Message| {
                let on_message = on_message.clone();
                let dedup = dedup.clone();
                async move {
                    if msg.from.as_ref().is_some_and(|u| u.is_bot) {
                        return respond(Ok(()));
                    }
                    let Some(text) = msg.text() else { return respond(Ok(())) };
                    if !dedup.insert_if_new(format!("telegram:{}:{}", msg.chat.id.0, msg.id.0)) {
                        return respond(Ok(()));
                    }
                    let sender = msg.from.as_ref();
                    let inbound = InboundMessage {
                        id: msg.id.0.to_string(),
                        chat_jid: Jid::new(format!("telegram:{}", msg.chat.id.0)),
                        sender_id: sender.map(|u| u.id.0.to_string()).unwrap_or_default(),
                        sender_name: sender.map(|u| u.full_name()).unwrap_or_default(),
                        content: text.to_string(),
                        timestamp: chrono::DateTime::from_timestamp(msg.date.timestamp(), 0)
                            .unwrap_or_else(chrono::Utc::now),
                        source_timestamp: Some(msg.date.timestamp()),
                        is_from_me: false,
                        is_bot: false,
                        metadata: std::collections::HashMap::new(),
                    };
                    on_message(inbound).await;
                    respond(Ok(()))
                }
            },
        );

        let mut dispatcher = Dispatcher::builder(bot.clone(), handler).build();
        let shutdown_token = dispatcher.shutdown_token();
        *self.shutdown.write().await = Some(shutdown_token);
        connected.store(true, Ordering::SeqCst);

        tokio::spawn(async move {
            info!("telegram long-poll dispatcher starting");
            dispatcher.dispatch().await;
            connected.store(false, Ordering::SeqCst);
            info!("telegram long-poll dispatcher stopped");
        });

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(token) = self.shutdown.write().await.take() {
            let _ = token.shutdown();
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, jid: &Jid, response: OutboundResponse) -> Result<SendReceipt> {
        let chat_id = Self::parse_jid(jid)?;

        match response {
            OutboundResponse::Text(text) => {
                let mut last_id = None;
                for chunk in super::split_message(&text, TELEGRAM_MESSAGE_CAP) {
                    let sent = self
                        .bot
                        .send_message(chat_id, chunk)
                        .await
                        .map_err(send_failed)?;
                    last_id = Some(sent.id);
                }
                Ok(SendReceipt { timestamp: last_id.map(|id| id.0.to_string()) })
            }
            OutboundResponse::Reaction { target_timestamp, emoji, .. } => {
                let message_id = Self::parse_message_id(&target_timestamp)?;
                self.bot
                    .set_message_reaction(chat_id, message_id)
                    .reaction(vec![ReactionType::Emoji { emoji }])
                    .await
                    .map_err(send_failed)?;
                Ok(SendReceipt::default())
            }
            OutboundResponse::RemoveReaction { target_timestamp, .. } => {
                let message_id = Self::parse_message_id(&target_timestamp)?;
                self.bot
                    .set_message_reaction(chat_id, message_id)
                    .await
                    .map_err(send_failed)?;
                Ok(SendReceipt::default())
            }
            OutboundResponse::Edit { target_timestamp, text, .. } => {
                let message_id = Self::parse_message_id(&target_timestamp)?;
                self.bot
                    .edit_message_text(chat_id, message_id, text)
                    .await
                    .map_err(send_failed)?;
                Ok(SendReceipt::default())
            }
            OutboundResponse::Delete { target_timestamp, .. } => {
                let message_id = Self::parse_message_id(&target_timestamp)?;
                self.bot.delete_message(chat_id, message_id).await.map_err(send_failed)?;
                Ok(SendReceipt::default())
            }
            OutboundResponse::Poll { question, options } => {
                let sent = self
                    .bot
                    .send_poll(chat_id, question, options)
                    .await
                    .map_err(send_failed)?;
                Ok(SendReceipt { timestamp: Some(sent.id.0.to_string()) })
            }
            OutboundResponse::Typing(on) => {
                if on {
                    let _ = self.bot.send_chat_action(chat_id, teloxide::types::ChatAction::Typing).await;
                }
                Ok(SendReceipt::default())
            }
        }
    }

    async fn set_typing(&self, jid: &Jid, typing: bool) -> Result<()> {
        if !typing || !self.typing_limiter.should_send(jid.as_str()) {
            return Ok(());
        }
        let chat_id = Self::parse_jid(jid)?;
        let _ = self.bot.send_chat_action(chat_id, teloxide::types::ChatAction::Typing).await;
        Ok(())
    }
}

fn send_failed(source: impl std::fmt::Display) -> crate::error::Error {
    ChannelError::SendFailed { channel: "telegram".to_string(), reason: source.to_string() }.into()
}

fn respond<T>(result: std::result::Result<T, teloxide::RequestError>) -> std::result::Result<T, teloxide::RequestError> {
    if let Err(error) = &result {
        warn!(%error, "telegram handler returned an error");
    }
    result
}
