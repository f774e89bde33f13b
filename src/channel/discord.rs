//! Discord channel adapter, ported from `messaging/discord.rs`'s serenity
//! client onto this crate's narrower [`Channel`] contract.
//!
//! Where the teacher exposes `respond`/`broadcast`/`send_status`/
//! `fetch_history` against its own `OutboundResponse`/`StatusUpdate` types,
//! this adapter collapses to `send`/`set_typing` against [`OutboundResponse`]
//! — streaming edits, slash commands, and history fetch are out of scope.

use crate::channel::reconnect::{Reconnector, ReconnectPolicy};
use crate::channel::{Channel, ChannelOpts, DedupCache, SendReceipt, TypingLimiter};
use crate::error::{ChannelError, Result};
use crate::{InboundMessage, Jid, OutboundResponse};

use async_trait::async_trait;
use serenity::all::{
    ChannelId, Context, CreatePoll, CreatePollAnswer, EditMessage, EventHandler, GatewayIntents,
    Http, Message, MessageId, Ready, ShardManager,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{error, info, warn};

/// Per-message character cap Discord enforces on a single `Message::content`.
const DISCORD_MESSAGE_CAP: usize = 2000;

pub struct DiscordChannel {
    token: String,
    opts: ChannelOpts,
    http: RwLock<Option<Arc<Http>>>,
    shard_manager: RwLock<Option<Arc<ShardManager>>>,
    /// Maps a chat JID to the last message sent into it, so `Edit`/`Delete`
    /// IPC tasks that reference "the last thing I sent" can resolve.
    last_sent: RwLock<HashMap<String, (ChannelId, MessageId)>>,
    connected: Arc<AtomicBool>,
    reconnector: Arc<Reconnector>,
    dedup: Arc<DedupCache>,
    typing_limiter: TypingLimiter,
    bot_mention: RwLock<Option<String>>,
}

impl DiscordChannel {
    pub fn new(token: impl Into<String>, opts: ChannelOpts) -> Self {
        Self {
            token: token.into(),
            opts,
            http: RwLock::new(None),
            shard_manager: RwLock::new(None),
            last_sent: RwLock::new(HashMap::new()),
            connected: Arc::new(AtomicBool::new(false)),
            reconnector: Arc::new(Reconnector::new(ReconnectPolicy::default())),
            dedup: Arc::new(DedupCache::with_defaults()),
            typing_limiter: TypingLimiter::with_defaults(),
            bot_mention: RwLock::new(None),
        }
    }

    /// Spawn the watchdog that notices a dropped gateway session (serenity
    /// retries the websocket itself, but a fully dead shard manager still
    /// needs a fresh `Client` built from scratch) and run the orchestrator
    /// shutdown signal into it.
    pub fn spawn_watchdog(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let this = self.clone();
        let connected = self.connected.clone();
        let on_recovery = self.opts.on_recovery.clone();
        let reconnector = self.reconnector.clone();
        tokio::spawn(async move {
            reconnector
                .run(
                    "discord",
                    move || connected.load(Ordering::SeqCst),
                    move || {
                        let this = this.clone();
                        async move { this.connect_gateway().await }
                    },
                    on_recovery,
                    shutdown,
                )
                .await;
        });
    }

    async fn connect_gateway(&self) -> Result<()> {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(256);
        let handler = Handler {
            inbound_tx,
            http_slot: Arc::new(RwLock::new(None)),
            connected: self.connected.clone(),
            bot_id: Arc::new(RwLock::new(None)),
        };
        let http_slot = handler.http_slot.clone();

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
            | GatewayIntents::GUILDS;

        let mut client = serenity::Client::builder(&self.token, intents)
            .event_handler(handler)
            .await
            .map_err(|source| ChannelError::Other(anyhow::anyhow!(source)))?;

        *self.http.write().await = Some(client.http.clone());
        *self.shard_manager.write().await = Some(client.shard_manager.clone());

        tokio::spawn(async move {
            if let Err(error) = client.start().await {
                error!(%error, "discord gateway error");
            }
        });

        let on_message = self.opts.on_message.clone();
        let dedup = self.dedup.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                if !dedup.insert_if_new(format!("discord:{}", message.id)) {
                    continue;
                }
                on_message(message).await;
            }
        });

        // Wait for the handler's `ready` callback to populate http_slot,
        // confirming the gateway identify handshake actually completed.
        for _ in 0..50 {
            if http_slot.read().await.is_some() {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        Err(ChannelError::Other(anyhow::anyhow!("discord gateway did not become ready in time")).into())
    }

    async fn http(&self) -> Result<Arc<Http>> {
        self.http
            .read()
            .await
            .clone()
            .ok_or_else(|| ChannelError::Other(anyhow::anyhow!("discord not connected")).into())
    }

    fn channel_id(jid: &Jid) -> Result<ChannelId> {
        jid.as_str()
            .rsplit(':')
            .next()
            .and_then(|id| id.parse::<u64>().ok())
            .map(ChannelId::new)
            .ok_or_else(|| ChannelError::Other(anyhow::anyhow!("invalid discord jid: {jid}")).into())
    }

    async fn remember_sent(&self, jid: &Jid, channel_id: ChannelId, message_id: MessageId) {
        self.last_sent
            .write()
            .await
            .insert(jid.as_str().to_string(), (channel_id, message_id));
    }
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn connect(&self) -> Result<()> {
        self.connect_gateway().await
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(shard_manager) = self.shard_manager.read().await.as_ref() {
            shard_manager.shutdown_all().await;
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("discord channel disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, jid: &Jid, response: OutboundResponse) -> Result<SendReceipt> {
        let http = self.http().await?;
        let channel_id = Self::channel_id(jid)?;

        match response {
            OutboundResponse::Text(text) => {
                let mut last_id = None;
                for chunk in super::split_message(&text, DISCORD_MESSAGE_CAP) {
                    let sent = channel_id
                        .say(&*http, chunk)
                        .await
                        .map_err(|source| ChannelError::SendFailed { channel: "discord".to_string(), reason: source.to_string() })?;
                    last_id = Some(sent.id);
                }
                if let Some(id) = last_id {
                    self.remember_sent(jid, channel_id, id).await;
                    return Ok(SendReceipt { timestamp: Some(id.to_string()) });
                }
                Ok(SendReceipt::default())
            }
            OutboundResponse::Reaction { target_timestamp, emoji, .. } => {
                let message_id = parse_message_id(&target_timestamp)?;
                channel_id
                    .message(&http, message_id)
                    .await
                    .map_err(|source| ChannelError::SendFailed { channel: "discord".to_string(), reason: source.to_string() })?
                    .react(&http, serenity::all::ReactionType::Unicode(emoji))
                    .await
                    .map_err(|source| ChannelError::SendFailed { channel: "discord".to_string(), reason: source.to_string() })?;
                Ok(SendReceipt::default())
            }
            OutboundResponse::RemoveReaction { target_timestamp, emoji, .. } => {
                let message_id = parse_message_id(&target_timestamp)?;
                let message: Message = channel_id
                    .message(&http, message_id)
                    .await
                    .map_err(|source| ChannelError::SendFailed { channel: "discord".to_string(), reason: source.to_string() })?;
                message
                    .delete_reaction_emoji(&http, serenity::all::ReactionType::Unicode(emoji))
                    .await
                    .map_err(|source| ChannelError::SendFailed { channel: "discord".to_string(), reason: source.to_string() })?;
                Ok(SendReceipt::default())
            }
            OutboundResponse::Edit { target_timestamp, text, .. } => {
                let message_id = parse_message_id(&target_timestamp)?;
                channel_id
                    .edit_message(&http, message_id, EditMessage::new().content(text))
                    .await
                    .map_err(|source| ChannelError::SendFailed { channel: "discord".to_string(), reason: source.to_string() })?;
                Ok(SendReceipt::default())
            }
            OutboundResponse::Delete { target_timestamp, .. } => {
                let message_id = parse_message_id(&target_timestamp)?;
                channel_id
                    .delete_message(&http, message_id)
                    .await
                    .map_err(|source| ChannelError::SendFailed { channel: "discord".to_string(), reason: source.to_string() })?;
                Ok(SendReceipt::default())
            }
            OutboundResponse::Poll { question, options } => {
                let answers: Vec<CreatePollAnswer> =
                    options.into_iter().map(CreatePollAnswer::new).collect();
                let poll = CreatePoll::new().question(question).answers(answers);
                channel_id
                    .send_message(&http, serenity::all::CreateMessage::new().poll(poll))
                    .await
                    .map_err(|source| ChannelError::SendFailed { channel: "discord".to_string(), reason: source.to_string() })?;
                Ok(SendReceipt::default())
            }
            OutboundResponse::Typing(_) => Ok(SendReceipt::default()),
        }
    }

    async fn set_typing(&self, jid: &Jid, typing: bool) -> Result<()> {
        if !typing || !self.typing_limiter.should_send(jid.as_str()) {
            return Ok(());
        }
        let http = self.http().await?;
        let channel_id = Self::channel_id(jid)?;
        let _ = channel_id.broadcast_typing(&http).await;
        Ok(())
    }
}

fn parse_message_id(raw: &str) -> Result<MessageId> {
    raw.parse::<u64>()
        .map(MessageId::new)
        .map_err(|_| ChannelError::Other(anyhow::anyhow!("invalid discord message id: {raw}")).into())
}

struct Handler {
    inbound_tx: mpsc::Sender<InboundMessage>,
    http_slot: Arc<RwLock<Option<Arc<Http>>>>,
    connected: Arc<AtomicBool>,
    bot_id: Arc<RwLock<Option<u64>>>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!(bot_name = %ready.user.name, guild_count = ready.guilds.len(), "discord gateway ready");
        *self.http_slot.write().await = Some(ctx.http.clone());
        *self.bot_id.write().await = Some(ready.user.id.get());
        self.connected.store(true, Ordering::SeqCst);
    }

    async fn message(&self, ctx: Context, message: Message) {
        if message.author.bot {
            return;
        }
        let jid = Jid::new(format!("discord:{}", message.channel_id.get()));
        // Discord's `@mention` of the bot is a `<@id>`/`<@!id>` token, not
        // the literal text a group's trigger regex matches against — fold
        // both mention forms down to a normalized `@bot` token (spec §4.5).
        let mut content = message.content.clone();
        if let Some(id) = *self.bot_id.read().await {
            content = super::normalize_bot_mention(&content, &format!("<@{id}>"));
            content = super::normalize_bot_mention(&content, &format!("<@!{id}>"));
        }
        let inbound = InboundMessage {
            id: message.id.to_string(),
            chat_jid: jid,
            sender_id: message.author.id.to_string(),
            sender_name: message.author.name.clone(),
            content,
            timestamp: message.timestamp.to_utc(),
            source_timestamp: Some(message.timestamp.unix_timestamp()),
            is_from_me: false,
            is_bot: message.author.bot,
            metadata: HashMap::new(),
        };
        if self.inbound_tx.send(inbound).await.is_err() {
            warn!("discord inbound channel closed, dropping message");
        }
        let _ = ctx.http.get_current_user().await;
    }

    async fn resume(&self, _ctx: Context, _: serenity::all::ResumedEvent) {
        info!("discord gateway resumed");
        self.connected.store(true, Ordering::SeqCst);
    }
}
