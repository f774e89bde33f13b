//! Slack channel adapter, ported from `messaging/slack.rs`'s slack-morphism
//! Socket Mode client onto this crate's [`Channel`] contract.
//!
//! Slash commands, ephemeral messages, Block Kit rich content, and streaming
//! `chat.update` edits are teacher-specific surface this crate's agent loop
//! doesn't need; only plain text, reactions, edit/delete, and polls (modeled
//! as a text fallback, since `chat.postMessage` has no native poll object)
//! survive the port.

use crate::channel::reconnect::{Reconnector, ReconnectPolicy};
use crate::channel::{Channel, ChannelOpts, DedupCache, SendReceipt};
use crate::error::{ChannelError, Result};
use crate::{InboundMessage, Jid, OutboundResponse};

use async_trait::async_trait;
use slack_morphism::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};

/// Per-chunk character cap, matching the teacher's conservative margin
/// under Slack's ~40,000 character block-text limit.
const SLACK_MESSAGE_CAP: usize = 12_000;

struct SlackAdapterState {
    inbound_tx: mpsc::Sender<InboundMessage>,
    bot_user_id: RwLock<Option<String>>,
    connected: Arc<AtomicBool>,
}

pub struct SlackChannel {
    bot_token: String,
    app_token: String,
    opts: ChannelOpts,
    client: Arc<SlackHyperClient>,
    token: SlackApiToken,
    connected: Arc<AtomicBool>,
    shutdown_tx: RwLock<Option<mpsc::Sender<()>>>,
    reconnector: Arc<Reconnector>,
    dedup: Arc<DedupCache>,
}

impl SlackChannel {
    pub fn new(bot_token: impl Into<String>, app_token: impl Into<String>, opts: ChannelOpts) -> Result<Self> {
        let bot_token = bot_token.into();
        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new()
                .map_err(|source| ChannelError::Other(anyhow::anyhow!(source)))?,
        ));
        let token = SlackApiToken::new(SlackApiTokenValue(bot_token.clone()));
        Ok(Self {
            bot_token,
            app_token: app_token.into(),
            opts,
            client,
            token,
            connected: Arc::new(AtomicBool::new(false)),
            shutdown_tx: RwLock::new(None),
            reconnector: Arc::new(Reconnector::new(ReconnectPolicy::default())),
            dedup: Arc::new(DedupCache::with_defaults()),
        })
    }

    /// Spawn the host-owned watchdog that notices a dropped socket-mode
    /// session (slack-morphism retries the websocket itself, but a fully
    /// dead listener still needs `connect` re-run from scratch) and fires
    /// `on_recovery` so the scheduler re-enqueues chats that went stale.
    pub fn spawn_watchdog(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let this = self.clone();
        let connected = self.connected.clone();
        let on_recovery = self.opts.on_recovery.clone();
        let reconnector = self.reconnector.clone();
        tokio::spawn(async move {
            reconnector
                .run(
                    "slack",
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

    fn session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.token)
    }

    fn channel_id(jid: &Jid) -> SlackChannelId {
        // `slack:<team>:<channel>` or `slack:<team>:<channel>:<thread_ts>`.
        let parts: Vec<&str> = jid.as_str().splitn(4, ':').collect();
        SlackChannelId(parts.get(2).copied().unwrap_or_default().to_string())
    }

    fn thread_ts(jid: &Jid) -> Option<SlackTs> {
        let parts: Vec<&str> = jid.as_str().splitn(4, ':').collect();
        parts.get(3).map(|ts| SlackTs((*ts).to_string()))
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn connect(&self) -> Result<()> {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let auth = self
            .session()
            .auth_test()
            .await
            .map_err(|source| ChannelError::Other(anyhow::anyhow!(source)))?;

        let state = Arc::new(SlackAdapterState {
            inbound_tx,
            bot_user_id: RwLock::new(Some(auth.user_id.0.clone())),
            connected: self.connected.clone(),
        });

        let callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);
        let listener_client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new()
                .map_err(|source| ChannelError::Other(anyhow::anyhow!(source)))?,
        ));
        let listener_environment = Arc::new(
            SlackClientEventsListenerEnvironment::new(listener_client)
                .with_error_handler(|error, _client, _states| {
                    warn!(%error, "slack socket mode error");
                    Ok(())
                })
                .with_user_state(state.clone()),
        );
        let listener = SlackClientSocketModeListener::new(
            &SlackClientSocketModeConfig::new(),
            listener_environment,
            callbacks,
        );
        let app_token = SlackApiToken::new(SlackApiTokenValue(self.app_token.clone()));

        tokio::spawn(async move {
            if let Err(error) = listener.listen_for(&app_token).await {
                warn!(%error, "failed to start slack socket mode listener");
                return;
            }
            state.connected.store(true, Ordering::SeqCst);
            info!("slack socket mode connected");
            tokio::select! {
                exit_code = listener.serve() => {
                    state.connected.store(false, Ordering::SeqCst);
                    info!(exit_code, "slack socket mode listener stopped");
                }
                _ = shutdown_rx.recv() => {
                    state.connected.store(false, Ordering::SeqCst);
                    listener.shutdown().await;
                }
            }
        });

        let on_message = self.opts.on_message.clone();
        let dedup = self.dedup.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                if !dedup.insert_if_new(format!("slack:{}", message.id)) {
                    continue;
                }
                on_message(message).await;
            }
        });

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(()).await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, jid: &Jid, response: OutboundResponse) -> Result<SendReceipt> {
        let session = self.session();
        let channel_id = Self::channel_id(jid);
        let thread_ts = Self::thread_ts(jid);

        match response {
            OutboundResponse::Text(text) => {
                let mut last_ts = None;
                for chunk in super::split_message(&text, SLACK_MESSAGE_CAP) {
                    let mut req = SlackApiChatPostMessageRequest::new(
                        channel_id.clone(),
                        SlackMessageContent::new().with_text(chunk),
                    );
                    req = req.opt_thread_ts(thread_ts.clone());
                    let resp = session
                        .chat_post_message(&req)
                        .await
                        .map_err(|source| send_failed(source))?;
                    last_ts = Some(resp.ts.0);
                }
                Ok(SendReceipt { timestamp: last_ts })
            }
            OutboundResponse::Reaction { target_timestamp, emoji, .. } => {
                let req = SlackApiReactionsAddRequest::new(
                    channel_id,
                    SlackReactionName(sanitize_reaction_name(&emoji)),
                    SlackTs(target_timestamp),
                );
                session.reactions_add(&req).await.map_err(send_failed)?;
                Ok(SendReceipt::default())
            }
            OutboundResponse::RemoveReaction { target_timestamp, emoji, .. } => {
                let req = SlackApiReactionsRemoveRequest::new(SlackReactionName(sanitize_reaction_name(&emoji)))
                    .with_channel(channel_id)
                    .with_timestamp(SlackTs(target_timestamp));
                session.reactions_remove(&req).await.map_err(send_failed)?;
                Ok(SendReceipt::default())
            }
            OutboundResponse::Edit { target_timestamp, text, .. } => {
                let req = SlackApiChatUpdateRequest::new(
                    channel_id,
                    SlackMessageContent::new().with_text(text),
                    SlackTs(target_timestamp),
                );
                session.chat_update(&req).await.map_err(send_failed)?;
                Ok(SendReceipt::default())
            }
            OutboundResponse::Delete { target_timestamp, .. } => {
                let req = SlackApiChatDeleteRequest::new(channel_id, SlackTs(target_timestamp));
                session.chat_delete(&req).await.map_err(send_failed)?;
                Ok(SendReceipt::default())
            }
            OutboundResponse::Poll { question, options } => {
                let mut text = format!("*{question}*\n");
                for (i, option) in options.iter().enumerate() {
                    text.push_str(&format!("{}. {option}\n", i + 1));
                }
                let req = SlackApiChatPostMessageRequest::new(
                    channel_id,
                    SlackMessageContent::new().with_text(text),
                );
                let resp = session.chat_post_message(&req).await.map_err(send_failed)?;
                Ok(SendReceipt { timestamp: Some(resp.ts.0) })
            }
            OutboundResponse::Typing(_) => Ok(SendReceipt::default()),
        }
    }
}

fn send_failed(source: impl std::fmt::Display) -> crate::error::Error {
    ChannelError::SendFailed { channel: "slack".to_string(), reason: source.to_string() }.into()
}

fn sanitize_reaction_name(emoji: &str) -> String {
    emoji.trim_matches(':').to_lowercase()
}

async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    let SlackEventCallbackBody::Message(msg_event) = event.event else {
        return Ok(());
    };
    if msg_event.subtype.is_some() {
        return Ok(());
    }

    let state_guard = states.read().await;
    let state = state_guard
        .get_user_state::<Arc<SlackAdapterState>>()
        .expect("SlackAdapterState must be in user_state");

    let user_id = msg_event.sender.user.as_ref().map(|u| u.0.clone());
    if user_id.is_none() || user_id == *state.bot_user_id.read().await {
        return Ok(());
    }

    let team_id = event.team_id.0.clone();
    let channel_id = msg_event.origin.channel.as_ref().map(|c| c.0.clone()).unwrap_or_default();
    let ts = msg_event.origin.ts.0.clone();
    let thread_ts = msg_event.origin.thread_ts.as_ref().map(|t| t.0.clone());

    let chat_jid = match &thread_ts {
        Some(thread) => Jid::new(format!("slack:{team_id}:{channel_id}:{thread}")),
        None => Jid::new(format!("slack:{team_id}:{channel_id}")),
    };

    let mut content = msg_event
        .content
        .as_ref()
        .and_then(|c| c.text.clone())
        .unwrap_or_default();
    // Slack's `@mention` of the bot is a `<@Uxxxx>` token, not the literal
    // text a group's trigger regex matches against — fold it down to a
    // normalized `@bot` token (spec §4.5).
    if let Some(bot_user_id) = state.bot_user_id.read().await.as_ref() {
        content = super::normalize_bot_mention(&content, &format!("<@{bot_user_id}>"));
    }

    let inbound = InboundMessage {
        id: ts.clone(),
        chat_jid,
        sender_id: user_id.unwrap_or_default(),
        sender_name: String::new(),
        content,
        timestamp: chrono::Utc::now(),
        source_timestamp: ts.replace('.', "").parse::<i64>().ok(),
        is_from_me: false,
        is_bot: false,
        metadata: std::collections::HashMap::new(),
    };

    if state.inbound_tx.send(inbound).await.is_err() {
        warn!("slack inbound channel closed, dropping message");
    }
    Ok(())
}
