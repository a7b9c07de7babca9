//! Discord adapter over serenity.
//!
//! The gateway side converts inbound events into platform-neutral
//! messages on an mpsc channel; the REST side maps the trait's
//! operations onto serenity's HTTP client, classifying the expected
//! races (deleted targets, throttles) into outcome variants.

use crate::config::DiscordConfig;
use crate::error::{PlatformError, Result};
use crate::messaging::{
    ChannelInfo, ChannelKind, ChatPlatform, EditOutcome, FetchOutcome, HistoryMessage,
    InboundStream, MemberRole, MentionInfo, RenameOutcome, ReplyHandle,
};
use crate::{Attachment, ChannelId, GuildId, IncomingMessage, MessageId, UserId};
use async_trait::async_trait;
use serenity::all::{
    ActivityData, Channel, ChannelId as DiscordChannelId, ChannelType, Client, Context,
    CreateMessage, EditChannel, EditMessage, EventHandler, GatewayIntents, GetMessages,
    GuildId as DiscordGuildId, HttpError, Message, MessageId as DiscordMessageId,
    MessageReference, OnlineStatus, Ready, ShardManager, ShardMessenger,
    UserId as DiscordUserId,
};
use serenity::http::Http;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Buffered inbound messages before the event loop picks them up.
const INBOUND_BUFFER: usize = 256;

pub struct DiscordPlatform {
    token: String,
    status_text: String,
    http: OnceLock<Arc<Http>>,
    shard_manager: OnceLock<Arc<ShardManager>>,
    /// Filled in at the first `ready`; presence updates go through it.
    messenger: Arc<RwLock<Option<ShardMessenger>>>,
    /// Zero until the gateway reports who we are.
    bot_id: Arc<AtomicU64>,
}

impl DiscordPlatform {
    pub fn new(config: &DiscordConfig) -> Self {
        Self {
            token: config.token.clone(),
            status_text: config.status_text.clone(),
            http: OnceLock::new(),
            shard_manager: OnceLock::new(),
            messenger: Arc::new(RwLock::new(None)),
            bot_id: Arc::new(AtomicU64::new(0)),
        }
    }

    fn http(&self) -> Result<&Arc<Http>> {
        self.http.get().ok_or_else(|| PlatformError::NotStarted.into())
    }
}

struct GatewayHandler {
    tx: mpsc::Sender<IncomingMessage>,
    bot_id: Arc<AtomicU64>,
    messenger: Arc<RwLock<Option<ShardMessenger>>>,
    status_text: String,
}

#[async_trait]
impl EventHandler for GatewayHandler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        self.bot_id.store(ready.user.id.get(), Ordering::SeqCst);
        if let Ok(mut slot) = self.messenger.write() {
            *slot = Some(ctx.shard.clone());
        }
        ctx.set_presence(
            Some(ActivityData::watching(self.status_text.clone())),
            OnlineStatus::Online,
        );
        tracing::info!(
            user = %ready.user.name,
            guilds = ready.guilds.len(),
            "gateway session ready"
        );
    }

    async fn message(&self, _ctx: Context, message: Message) {
        // Everything is forwarded; the orchestrator decides what to
        // ignore, and it needs bot-authored turns for that decision.
        if self.tx.send(convert_message(&message)).await.is_err() {
            tracing::warn!("inbound channel closed, dropping message");
        }
    }
}

impl ChatPlatform for DiscordPlatform {
    async fn start(&self) -> Result<InboundStream> {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let handler = GatewayHandler {
            tx,
            bot_id: self.bot_id.clone(),
            messenger: self.messenger.clone(),
            status_text: self.status_text.clone(),
        };
        let intents = GatewayIntents::GUILDS
            | GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT;
        let client = Client::builder(&self.token, intents)
            .event_handler(handler)
            .await
            .map_err(|error| PlatformError::Gateway(error.to_string()))?;

        self.http
            .set(client.http.clone())
            .map_err(|_| PlatformError::Gateway("platform already started".to_string()))?;
        let _ = self.shard_manager.set(client.shard_manager.clone());

        tokio::spawn(async move {
            let mut client = client;
            if let Err(error) = client.start().await {
                tracing::error!(%error, "gateway connection ended");
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn bot_user_id(&self) -> Option<UserId> {
        let id = self.bot_id.load(Ordering::SeqCst);
        (id != 0).then_some(id)
    }

    async fn fetch_recent_messages(
        &self,
        channel: ChannelId,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>> {
        let http = self.http()?;
        let batch = discord_channel(channel)?
            .messages(http, GetMessages::new().limit(limit.min(100) as u8))
            .await
            .map_err(platform_error)?;
        Ok(batch.iter().map(convert_history).collect())
    }

    async fn fetch_message_by_id(&self, channel: ChannelId, id: MessageId) -> Result<FetchOutcome> {
        let http = self.http()?;
        match discord_channel(channel)?
            .message(http, DiscordMessageId::new(id))
            .await
        {
            Ok(message) => Ok(FetchOutcome::Found(convert_message(&message))),
            Err(error) => match http_status(&error) {
                Some(404) => Ok(FetchOutcome::NotFound),
                Some(403) => Ok(FetchOutcome::Forbidden),
                _ => Err(platform_error(error)),
            },
        }
    }

    async fn create_reply(
        &self,
        channel: ChannelId,
        replying_to: MessageId,
        text: &str,
    ) -> Result<ReplyHandle> {
        let http = self.http()?;
        let target = discord_channel(channel)?;
        let builder = CreateMessage::new().content(text).reference_message(
            MessageReference::from((target, DiscordMessageId::new(replying_to))),
        );
        let message = target
            .send_message(http, builder)
            .await
            .map_err(platform_error)?;
        Ok(ReplyHandle {
            channel_id: channel,
            message_id: message.id.get(),
        })
    }

    async fn edit_message(&self, handle: &ReplyHandle, text: &str) -> Result<EditOutcome> {
        let http = self.http()?;
        let result = discord_channel(handle.channel_id)?
            .edit_message(
                http,
                DiscordMessageId::new(handle.message_id),
                EditMessage::new().content(text),
            )
            .await;
        match result {
            Ok(_) => Ok(EditOutcome::Edited),
            Err(error) => match http_status(&error) {
                Some(404) => Ok(EditOutcome::NotFound),
                Some(429) => Ok(EditOutcome::RateLimited),
                _ => Err(platform_error(error)),
            },
        }
    }

    async fn resolve_mentions(&self, message: &IncomingMessage) -> Result<MentionInfo> {
        let bot_id = self.bot_id.load(Ordering::SeqCst);
        Ok(MentionInfo {
            is_direct_mention: bot_id != 0 && message.mentioned_user_ids.contains(&bot_id),
            mentioned_role_ids: message.mentioned_role_ids.clone(),
            mentions_users: !message.mentioned_user_ids.is_empty(),
            mentions_everyone: message.mentions_everyone,
        })
    }

    async fn list_member_roles(&self, guild: GuildId, member: UserId) -> Result<Vec<MemberRole>> {
        let http = self.http()?;
        let member = http
            .get_member(DiscordGuildId::new(guild), DiscordUserId::new(member))
            .await
            .map_err(platform_error)?;
        let roles = http
            .get_guild_roles(DiscordGuildId::new(guild))
            .await
            .map_err(platform_error)?;
        Ok(roles
            .into_iter()
            .filter(|role| member.roles.contains(&role.id))
            .map(|role| MemberRole {
                id: role.id.get(),
                name: role.name.clone(),
            })
            .collect())
    }

    async fn member_is_admin(&self, guild: GuildId, member: UserId) -> Result<bool> {
        let http = self.http()?;
        let guild_data = http
            .get_guild(DiscordGuildId::new(guild))
            .await
            .map_err(platform_error)?;
        if guild_data.owner_id.get() == member {
            return Ok(true);
        }
        let member = http
            .get_member(DiscordGuildId::new(guild), DiscordUserId::new(member))
            .await
            .map_err(platform_error)?;
        Ok(member.roles.iter().any(|role_id| {
            guild_data
                .roles
                .get(role_id)
                .is_some_and(|role| role.permissions.administrator())
        }))
    }

    async fn channel_info(&self, channel: ChannelId) -> Result<ChannelInfo> {
        let http = self.http()?;
        match discord_channel(channel)?
            .to_channel(http)
            .await
            .map_err(platform_error)?
        {
            Channel::Guild(guild_channel) => {
                let kind = map_kind(guild_channel.kind);
                let parent_name = match (kind.is_thread(), guild_channel.parent_id) {
                    (true, Some(parent)) => parent
                        .to_channel(http)
                        .await
                        .ok()
                        .and_then(Channel::guild)
                        .map(|parent_channel| parent_channel.name),
                    _ => None,
                };
                Ok(ChannelInfo {
                    id: channel,
                    name: guild_channel.name.clone(),
                    kind,
                    topic: guild_channel.topic.clone(),
                    parent_name,
                })
            }
            Channel::Private(private) => Ok(ChannelInfo {
                id: channel,
                name: private.name(),
                kind: ChannelKind::DirectMessage,
                topic: None,
                parent_name: None,
            }),
            _ => Ok(ChannelInfo {
                id: channel,
                name: format!("channel-{channel}"),
                kind: ChannelKind::Text,
                topic: None,
                parent_name: None,
            }),
        }
    }

    async fn edit_channel_name(&self, channel: ChannelId, name: &str) -> Result<RenameOutcome> {
        let http = self.http()?;
        let result = discord_channel(channel)?
            .edit(http, EditChannel::new().name(name))
            .await;
        match result {
            Ok(_) => Ok(RenameOutcome::Renamed),
            Err(error) => match http_status(&error) {
                Some(404) => Ok(RenameOutcome::NotFound),
                Some(403) => Ok(RenameOutcome::Forbidden),
                _ => Err(platform_error(error)),
            },
        }
    }

    async fn set_presence(&self, online: bool) -> Result<()> {
        let messenger = self
            .messenger
            .read()
            .ok()
            .and_then(|slot| slot.clone());
        let Some(messenger) = messenger else {
            return Err(PlatformError::NotStarted.into());
        };
        if online {
            messenger.set_presence(
                Some(ActivityData::watching(self.status_text.clone())),
                OnlineStatus::Online,
            );
        } else {
            messenger.set_presence(None, OnlineStatus::Invisible);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        for attempt in 0..3 {
            match self.set_presence(false).await {
                Ok(()) => break,
                Err(error) if attempt == 2 => {
                    tracing::warn!(%error, "could not set offline presence before shutdown");
                }
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(500)).await,
            }
        }
        if let Some(manager) = self.shard_manager.get() {
            manager.shutdown_all().await;
        }
        tracing::info!("gateway connection closed");
        Ok(())
    }
}

/// Serenity id wrappers reject zero; anything user-supplied goes
/// through here.
fn discord_channel(id: ChannelId) -> Result<DiscordChannelId> {
    if id == 0 {
        return Err(PlatformError::Api("invalid channel id".to_string()).into());
    }
    Ok(DiscordChannelId::new(id))
}

fn platform_error(error: serenity::Error) -> crate::Error {
    PlatformError::Api(error.to_string()).into()
}

fn http_status(error: &serenity::Error) -> Option<u16> {
    if let serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) = error {
        return Some(response.status_code.as_u16());
    }
    None
}

fn display_name(message: &Message) -> String {
    message
        .author
        .global_name
        .clone()
        .unwrap_or_else(|| message.author.name.clone())
}

fn convert_timestamp(message: &Message) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(message.timestamp.unix_timestamp(), 0)
        .unwrap_or_else(chrono::Utc::now)
}

fn convert_message(message: &Message) -> IncomingMessage {
    IncomingMessage {
        id: message.id.get(),
        channel_id: message.channel_id.get(),
        guild_id: message.guild_id.map(|id| id.get()),
        author_id: message.author.id.get(),
        author_name: display_name(message),
        author_is_bot: message.author.bot,
        content: message.content.clone(),
        attachments: message
            .attachments
            .iter()
            .map(|attachment| Attachment {
                filename: attachment.filename.clone(),
                url: attachment.url.clone(),
                content_type: attachment.content_type.clone(),
            })
            .collect(),
        referenced_message_id: message
            .message_reference
            .as_ref()
            .and_then(|reference| reference.message_id)
            .map(|id| id.get()),
        mentioned_user_ids: message.mentions.iter().map(|user| user.id.get()).collect(),
        mentioned_role_ids: message.mention_roles.iter().map(|role| role.get()).collect(),
        mentions_everyone: message.mention_everyone,
        timestamp: convert_timestamp(message),
    }
}

fn convert_history(message: &Message) -> HistoryMessage {
    HistoryMessage {
        id: message.id.get(),
        author: display_name(message),
        author_id: message.author.id.get(),
        content: message.content.clone(),
        timestamp: convert_timestamp(message),
        has_attachments: !message.attachments.is_empty(),
        is_reply: message.message_reference.is_some(),
        is_bot: message.author.bot,
    }
}

fn map_kind(kind: ChannelType) -> ChannelKind {
    match kind {
        ChannelType::Text | ChannelType::News => ChannelKind::Text,
        ChannelType::PublicThread | ChannelType::PrivateThread | ChannelType::NewsThread => {
            ChannelKind::Thread
        }
        ChannelType::Voice | ChannelType::Stage => ChannelKind::Voice,
        ChannelType::Private => ChannelKind::DirectMessage,
        _ => ChannelKind::Text,
    }
}
