//! The platform trait the core is written against.
//!
//! Expected races surface as outcome variants (`FetchOutcome`,
//! `EditOutcome`, `RenameOutcome`) rather than errors, so callers are
//! forced to handle deleted targets and throttled edits explicitly.
//! `Err` is reserved for transport-level failures.

use crate::error::Result;
use crate::messaging::{
    ChannelInfo, EditOutcome, FetchOutcome, HistoryMessage, MemberRole, MentionInfo, RenameOutcome,
    ReplyHandle,
};
use crate::{ChannelId, GuildId, IncomingMessage, MessageId, UserId};
use futures::Stream;
use std::pin::Pin;

/// Inbound message stream type.
pub type InboundStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// Static trait for chat platform adapters.
pub trait ChatPlatform: Send + Sync + 'static {
    /// Connect and return the inbound message stream.
    fn start(&self) -> impl std::future::Future<Output = Result<InboundStream>> + Send;

    /// The connected bot user, once the gateway has reported it.
    fn bot_user_id(&self) -> Option<UserId>;

    /// Recent channel messages, newest-first as the platform serves them.
    /// `limit` is capped by the platform (100 for Discord).
    fn fetch_recent_messages(
        &self,
        channel: ChannelId,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<HistoryMessage>>> + Send;

    /// Fetch one message by id.
    fn fetch_message_by_id(
        &self,
        channel: ChannelId,
        id: MessageId,
    ) -> impl std::future::Future<Output = Result<FetchOutcome>> + Send;

    /// Create a reply to an existing message. Failures are plain errors;
    /// the reconciler retries creation on the next delta.
    fn create_reply(
        &self,
        channel: ChannelId,
        replying_to: MessageId,
        text: &str,
    ) -> impl std::future::Future<Output = Result<ReplyHandle>> + Send;

    /// Edit a message the bot created.
    fn edit_message(
        &self,
        handle: &ReplyHandle,
        text: &str,
    ) -> impl std::future::Future<Output = Result<EditOutcome>> + Send;

    /// Resolve mention facts for an inbound message.
    fn resolve_mentions(
        &self,
        message: &IncomingMessage,
    ) -> impl std::future::Future<Output = Result<MentionInfo>> + Send;

    /// Roles held by a guild member.
    fn list_member_roles(
        &self,
        guild: GuildId,
        member: UserId,
    ) -> impl std::future::Future<Output = Result<Vec<MemberRole>>> + Send;

    /// Guild owner or administrator permission. Role-name admin lists are
    /// the caller's policy, layered on `list_member_roles`.
    fn member_is_admin(
        &self,
        guild: GuildId,
        member: UserId,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Channel metadata for prompt context and tool validation.
    fn channel_info(
        &self,
        channel: ChannelId,
    ) -> impl std::future::Future<Output = Result<ChannelInfo>> + Send;

    /// Rename a channel or thread.
    fn edit_channel_name(
        &self,
        channel: ChannelId,
        name: &str,
    ) -> impl std::future::Future<Output = Result<RenameOutcome>> + Send;

    /// Best-effort presence update.
    fn set_presence(&self, online: bool) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Graceful shutdown: presence offline, then close the gateway.
    fn shutdown(&self) -> impl std::future::Future<Output = Result<()>> + Send;
}
