//! Messaging platform abstraction and the Discord adapter.

pub mod discord;
pub mod traits;

pub use discord::DiscordPlatform;
pub use traits::{ChatPlatform, InboundStream};

use crate::{ChannelId, MessageId, RoleId, UserId};

/// One entry of fetched channel history, newest-first as the platform
/// serves it. The context builder reverses and filters.
#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub id: MessageId,
    pub author: String,
    pub author_id: UserId,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub has_attachments: bool,
    pub is_reply: bool,
    pub is_bot: bool,
}

/// Handle to a message the bot created and may keep editing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHandle {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

/// Mention facts about one inbound message, resolved by the adapter.
#[derive(Debug, Clone, Default)]
pub struct MentionInfo {
    /// The bot user itself was mentioned.
    pub is_direct_mention: bool,
    /// Role ids mentioned in the message, unfiltered.
    pub mentioned_role_ids: Vec<RoleId>,
    /// Any user mention at all (including the bot).
    pub mentions_users: bool,
    pub mentions_everyone: bool,
}

/// A guild role as the platform reports it.
#[derive(Debug, Clone)]
pub struct MemberRole {
    pub id: RoleId,
    pub name: String,
}

/// Result of fetching a single message by id. Expected races are
/// variants, not errors.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Found(crate::IncomingMessage),
    NotFound,
    Forbidden,
}

/// Result of editing a message the bot owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Edited,
    /// The target was deleted out from under us.
    NotFound,
    /// The platform throttled the edit; the content is superseded by a
    /// later edit anyway.
    RateLimited,
}

/// Result of renaming a channel or thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameOutcome {
    Renamed,
    NotFound,
    Forbidden,
}

/// What kind of surface a channel id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Text,
    Thread,
    DirectMessage,
    Voice,
}

impl ChannelKind {
    pub fn is_thread(self) -> bool {
        matches!(self, Self::Thread)
    }

    /// Whether a rename through the API can work at all.
    pub fn can_edit(self) -> bool {
        matches!(self, Self::Text | Self::Thread)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Text => "text channel",
            Self::Thread => "thread",
            Self::DirectMessage => "direct message",
            Self::Voice => "voice channel",
        }
    }
}

/// Channel metadata for prompt context and tool validation.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
    pub kind: ChannelKind,
    pub topic: Option<String>,
    /// Parent channel name when this is a thread.
    pub parent_name: Option<String>,
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted platform for reconciler and decision tests.

    use super::*;
    use crate::error::Result;
    use crate::{GuildId, IncomingMessage};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// One platform call the mock observed.
    #[derive(Debug, Clone, PartialEq)]
    pub enum PlatformCall {
        Create { text: String },
        Edit { message_id: MessageId, text: String },
        Rename { channel_id: ChannelId, name: String },
        Shutdown,
    }

    #[derive(Default)]
    pub struct MockPlatform {
        pub calls: Mutex<Vec<PlatformCall>>,
        next_message_id: AtomicU64,
        /// Outcomes consumed front-to-back by `edit_message`; when empty,
        /// edits succeed.
        pub edit_script: Mutex<Vec<EditOutcome>>,
        /// Errors consumed by `create_reply` before creation succeeds.
        pub create_failures: Mutex<u32>,
        pub history: Mutex<Vec<HistoryMessage>>,
        pub messages_by_id: Mutex<HashMap<MessageId, FetchOutcome>>,
        pub member_roles: Mutex<Vec<MemberRole>>,
        pub admin_members: Mutex<Vec<UserId>>,
        pub channels: Mutex<HashMap<ChannelId, ChannelInfo>>,
        pub rename_outcome: Mutex<Option<RenameOutcome>>,
        pub bot_id: UserId,
    }

    impl MockPlatform {
        pub fn new(bot_id: UserId) -> Self {
            Self {
                bot_id,
                next_message_id: AtomicU64::new(9000),
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<PlatformCall> {
            self.calls.lock().clone()
        }

        pub fn edit_calls(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    PlatformCall::Edit { text, .. } => Some(text),
                    _ => None,
                })
                .collect()
        }

        pub fn created_texts(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    PlatformCall::Create { text } => Some(text),
                    _ => None,
                })
                .collect()
        }
    }

    impl ChatPlatform for MockPlatform {
        async fn start(&self) -> Result<InboundStream> {
            Ok(Box::pin(futures::stream::empty()))
        }

        fn bot_user_id(&self) -> Option<UserId> {
            Some(self.bot_id)
        }

        async fn fetch_recent_messages(
            &self,
            _channel: ChannelId,
            limit: usize,
        ) -> Result<Vec<HistoryMessage>> {
            let history = self.history.lock();
            Ok(history.iter().take(limit).cloned().collect())
        }

        async fn fetch_message_by_id(
            &self,
            _channel: ChannelId,
            id: MessageId,
        ) -> Result<FetchOutcome> {
            let map = self.messages_by_id.lock();
            Ok(map.get(&id).cloned().unwrap_or(FetchOutcome::NotFound))
        }

        async fn create_reply(
            &self,
            channel: ChannelId,
            _replying_to: MessageId,
            text: &str,
        ) -> Result<ReplyHandle> {
            {
                let mut failures = self.create_failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(crate::error::PlatformError::Api(
                        "scripted creation failure".to_string(),
                    )
                    .into());
                }
            }
            self.calls.lock().push(PlatformCall::Create {
                text: text.to_string(),
            });
            Ok(ReplyHandle {
                channel_id: channel,
                message_id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            })
        }

        async fn edit_message(&self, handle: &ReplyHandle, text: &str) -> Result<EditOutcome> {
            let outcome = {
                let mut script = self.edit_script.lock();
                if script.is_empty() {
                    EditOutcome::Edited
                } else {
                    script.remove(0)
                }
            };
            self.calls.lock().push(PlatformCall::Edit {
                message_id: handle.message_id,
                text: text.to_string(),
            });
            Ok(outcome)
        }

        async fn resolve_mentions(&self, message: &IncomingMessage) -> Result<MentionInfo> {
            Ok(MentionInfo {
                is_direct_mention: message.mentioned_user_ids.contains(&self.bot_id),
                mentioned_role_ids: message.mentioned_role_ids.clone(),
                mentions_users: !message.mentioned_user_ids.is_empty(),
                mentions_everyone: message.mentions_everyone,
            })
        }

        async fn list_member_roles(
            &self,
            _guild: GuildId,
            _member: UserId,
        ) -> Result<Vec<MemberRole>> {
            Ok(self.member_roles.lock().clone())
        }

        async fn member_is_admin(&self, _guild: GuildId, member: UserId) -> Result<bool> {
            Ok(self.admin_members.lock().contains(&member))
        }

        async fn channel_info(&self, channel: ChannelId) -> Result<ChannelInfo> {
            let channels = self.channels.lock();
            Ok(channels.get(&channel).cloned().unwrap_or(ChannelInfo {
                id: channel,
                name: format!("channel-{channel}"),
                kind: ChannelKind::Text,
                topic: None,
                parent_name: None,
            }))
        }

        async fn edit_channel_name(
            &self,
            channel: ChannelId,
            name: &str,
        ) -> Result<RenameOutcome> {
            self.calls.lock().push(PlatformCall::Rename {
                channel_id: channel,
                name: name.to_string(),
            });
            let outcome = self.rename_outcome.lock();
            Ok(outcome.unwrap_or(RenameOutcome::Renamed))
        }

        async fn set_presence(&self, _online: bool) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            self.calls.lock().push(PlatformCall::Shutdown);
            Ok(())
        }
    }
}
