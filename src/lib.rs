//! charbot: a persona-driven Discord chat bot backed by an
//! OpenAI-compatible chat-completion API.
//!
//! The interesting parts are resilience plumbing rather than chat logic:
//! an adaptive client-side rate limiter, a connection health monitor with
//! background recovery, bounded concurrent dispatch with a stale-task
//! reaper, and a reconciler that streams partial completions into a
//! platform message by progressive edits.

pub mod bot;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod llm;
pub mod messaging;
pub mod persona;
pub mod reply;
pub mod tools;

pub use error::{Error, Result};

/// Platform snowflake aliases. Discord ids are u64s; keeping them plain
/// integers lets the core stay serenity-free.
pub type MessageId = u64;
pub type ChannelId = u64;
pub type GuildId = u64;
pub type UserId = u64;
pub type RoleId = u64;

/// File extensions the completion API accepts as image parts.
const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "tiff", "tga",
];

/// A message attachment as delivered by the platform.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    pub content_type: Option<String>,
}

impl Attachment {
    /// Whether this attachment can be forwarded to the model as an image
    /// part, judged by file extension.
    pub fn is_image(&self) -> bool {
        let Some((_, ext)) = self.filename.rsplit_once('.') else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        IMAGE_EXTENSIONS.contains(&ext.as_str())
    }
}

/// A platform message converted to the neutral form the core works with.
///
/// Raw mention ids are carried so mention resolution doesn't need a second
/// fetch; the adapter fills them from the gateway payload.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub author_id: UserId,
    pub author_name: String,
    pub author_is_bot: bool,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub referenced_message_id: Option<MessageId>,
    pub mentioned_user_ids: Vec<UserId>,
    pub mentioned_role_ids: Vec<RoleId>,
    pub mentions_everyone: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl IncomingMessage {
    pub fn is_reply(&self) -> bool {
        self.referenced_message_id.is_some()
    }

    /// Attachments that should ride along as image parts.
    pub fn image_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.iter().filter(|a| a.is_image())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(filename: &str) -> Attachment {
        Attachment {
            filename: filename.to_string(),
            url: format!("https://cdn.example/{filename}"),
            content_type: None,
        }
    }

    #[test]
    fn image_detection_by_extension() {
        assert!(attachment("photo.PNG").is_image());
        assert!(attachment("scan.jpeg").is_image());
        assert!(attachment("anim.webp").is_image());
        assert!(!attachment("notes.txt").is_image());
        assert!(!attachment("archive.tar.gz").is_image());
        assert!(!attachment("no_extension").is_image());
    }
}
