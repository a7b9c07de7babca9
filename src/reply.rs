//! Streaming reply reconciliation.
//!
//! Streams arrive as many small deltas; the platform wants few edits.
//! The reconciler creates the reply on the first visible text, edits it
//! each time the accumulated length crosses another hundred-character
//! mark, and lands whatever remains in one final edit.

use crate::error::Result;
use crate::messaging::{ChatPlatform, EditOutcome, ReplyHandle};
use crate::{ChannelId, MessageId};

/// Platform cap on message length, in characters.
const MESSAGE_LIMIT: usize = 2000;
/// Edit when the accumulated text crosses another multiple of this.
const EDIT_EVERY: usize = 100;

pub struct ReplyReconciler<'a, P: ChatPlatform> {
    platform: &'a P,
    channel_id: ChannelId,
    replying_to: MessageId,
    handle: Option<ReplyHandle>,
    buffer: String,
    /// `chars / EDIT_EVERY` at the last successful send.
    sent_mark: usize,
    /// Byte length of the rendered text at the last successful send.
    /// The buffer is append-only, so equal length means equal text.
    sent_bytes: usize,
    halted: bool,
}

impl<'a, P: ChatPlatform> ReplyReconciler<'a, P> {
    pub fn new(platform: &'a P, channel_id: ChannelId, replying_to: MessageId) -> Self {
        Self {
            platform,
            channel_id,
            replying_to,
            handle: None,
            buffer: String::new(),
            sent_mark: 0,
            sent_bytes: 0,
            halted: false,
        }
    }

    /// Feed one streamed delta. Send failures never stop the stream;
    /// only a deleted reply does.
    pub async fn push_delta(&mut self, delta: &str) {
        self.buffer.push_str(delta);
        if self.halted {
            return;
        }
        let Some(handle) = self.handle else {
            self.try_create().await;
            return;
        };

        let total = self.buffer.chars().count();
        if total / EDIT_EVERY <= self.sent_mark {
            return;
        }
        let text = truncate_chars(&self.buffer, MESSAGE_LIMIT);
        if text.len() == self.sent_bytes {
            // Past the cap the rendered text stops changing.
            return;
        }
        let text_len = text.len();
        match self.platform.edit_message(&handle, text).await {
            Ok(EditOutcome::Edited) => {
                self.sent_mark = total / EDIT_EVERY;
                self.sent_bytes = text_len;
            }
            Ok(EditOutcome::NotFound) => {
                tracing::debug!(
                    message_id = handle.message_id,
                    "reply was deleted mid-stream, dropping the rest"
                );
                self.halted = true;
            }
            Ok(EditOutcome::RateLimited) => {
                tracing::debug!(
                    message_id = handle.message_id,
                    "streamed edit was rate limited, retrying at the next crossing"
                );
            }
            Err(error) => {
                tracing::warn!(%error, message_id = handle.message_id, "streamed edit failed");
            }
        }
    }

    async fn try_create(&mut self) {
        if self.buffer.trim().is_empty() {
            return;
        }
        let total = self.buffer.chars().count();
        let text = truncate_chars(&self.buffer, MESSAGE_LIMIT);
        let text_len = text.len();
        match self
            .platform
            .create_reply(self.channel_id, self.replying_to, text)
            .await
        {
            Ok(handle) => {
                self.handle = Some(handle);
                self.sent_mark = total / EDIT_EVERY;
                self.sent_bytes = text_len;
            }
            Err(error) => {
                tracing::warn!(
                    %error,
                    channel_id = self.channel_id,
                    "reply creation failed, will retry on the next delta"
                );
            }
        }
    }

    /// Land whatever the stream produced. Returns the live reply, if
    /// one exists when the dust settles.
    pub async fn finalize(self) -> Result<Option<ReplyHandle>> {
        if self.halted {
            return Ok(None);
        }
        let Some(handle) = self.handle else {
            if self.buffer.trim().is_empty() {
                return Ok(None);
            }
            // Every earlier creation attempt failed; this one gets to
            // propagate so the caller can report it.
            let text = truncate_chars(&self.buffer, MESSAGE_LIMIT);
            let handle = self
                .platform
                .create_reply(self.channel_id, self.replying_to, text)
                .await?;
            return Ok(Some(handle));
        };

        let text = truncate_chars(&self.buffer, MESSAGE_LIMIT);
        if text.len() == self.sent_bytes {
            return Ok(Some(handle));
        }
        match self.platform.edit_message(&handle, text).await {
            Ok(EditOutcome::Edited) => Ok(Some(handle)),
            Ok(EditOutcome::NotFound) => {
                tracing::debug!(
                    message_id = handle.message_id,
                    "reply disappeared before the final edit"
                );
                Ok(None)
            }
            Ok(EditOutcome::RateLimited) => {
                tracing::warn!(
                    message_id = handle.message_id,
                    "final edit was rate limited, keeping the last rendered text"
                );
                Ok(Some(handle))
            }
            Err(error) => {
                tracing::warn!(%error, message_id = handle.message_id, "final edit failed");
                Ok(Some(handle))
            }
        }
    }
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}
