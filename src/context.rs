//! Prompt assembly and token budgeting.
//!
//! Token counts are estimated locally with per-character weights; the
//! estimate runs high for prose, which errs on the side of rejecting
//! before the API does.

use crate::llm::PromptBlock;
use crate::messaging::{ChannelInfo, HistoryMessage};
use crate::persona::Persona;
use crate::IncomingMessage;

/// Messages from channel history rendered into the prompt.
const HISTORY_IN_PROMPT: usize = 20;
/// Per-message cap applied to history and reply-context content.
const HISTORY_MESSAGE_TOKEN_CAP: usize = 500;

/// Estimated token count: non-ASCII characters weigh 1.5, ASCII letters
/// 0.25, everything else 0.5. Truncated, with a floor of 1 for any
/// non-empty text.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let mut weight = 0.0_f64;
    for ch in text.chars() {
        weight += if !ch.is_ascii() {
            1.5
        } else if ch.is_ascii_alphabetic() {
            0.25
        } else {
            0.5
        };
    }
    (weight as usize).max(1)
}

/// Largest prefix of `text` whose estimate fits `max_tokens`, found by
/// binary search over character counts. Always lands on a character
/// boundary.
pub fn truncate_to_limit(text: &str, max_tokens: usize) -> &str {
    if estimate_tokens(text) <= max_tokens {
        return text;
    }
    let boundaries: Vec<usize> = text.char_indices().map(|(index, _)| index).collect();
    let byte_end = |kept: usize| {
        if kept == boundaries.len() {
            text.len()
        } else {
            boundaries[kept]
        }
    };

    // The empty prefix always fits, so `lo` stays valid throughout.
    let mut lo = 0;
    let mut hi = boundaries.len();
    while lo < hi {
        let mid = lo + (hi - lo).div_ceil(2);
        if estimate_tokens(&text[..byte_end(mid)]) <= max_tokens {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    &text[..byte_end(lo)]
}

/// Assembles the prompt blocks for one reply: a persona system block,
/// then one user block holding channel metadata, optional reply
/// context, recent history oldest first, the new message, and the
/// reply instruction.
pub struct ContextBuilder<'a> {
    persona: &'a Persona,
    channel: &'a ChannelInfo,
    message: &'a IncomingMessage,
    history: &'a [HistoryMessage],
    reply_context: Option<&'a IncomingMessage>,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(
        persona: &'a Persona,
        channel: &'a ChannelInfo,
        message: &'a IncomingMessage,
    ) -> Self {
        Self {
            persona,
            channel,
            message,
            history: &[],
            reply_context: None,
        }
    }

    /// Channel history, newest first, as the platform returns it.
    pub fn with_history(mut self, history: &'a [HistoryMessage]) -> Self {
        self.history = history;
        self
    }

    pub fn with_reply_context(mut self, replied: Option<&'a IncomingMessage>) -> Self {
        self.reply_context = replied;
        self
    }

    pub fn build(&self) -> Vec<PromptBlock> {
        let mut user = channel_header(self.channel);

        // A reply to the bot's own message needs no quoting; the text is
        // already in the conversation.
        if let Some(replied) = self.reply_context.filter(|m| !m.author_is_bot) {
            user.push_str("\n\nThe new message replies to this earlier one:\n");
            user.push_str(&format!(
                "{}: {}",
                replied.author_name,
                clip(&replied.content)
            ));
        }

        let lines = self.history_lines();
        if !lines.is_empty() {
            user.push_str("\n\nRecent conversation, oldest first:\n");
            user.push_str(&lines.join("\n"));
        }

        user.push_str("\n\nNew message:\n");
        user.push_str(&format!(
            "{}: {}",
            self.message.author_name, self.message.content
        ));
        if !self.message.attachments.is_empty() {
            user.push_str(" [attachment]");
        }

        user.push_str(&format!(
            "\n\nReply to the new message as {}. Stay in voice and keep it conversational.",
            self.persona.name
        ));

        vec![
            PromptBlock::system(self.persona.system_prompt()),
            PromptBlock::user(user),
        ]
    }

    fn history_lines(&self) -> Vec<String> {
        let quoted_id = self.reply_context.map(|m| m.id);
        let mut picked: Vec<&HistoryMessage> = self
            .history
            .iter()
            .filter(|m| m.id != self.message.id)
            .filter(|m| !m.is_bot)
            .filter(|m| Some(m.id) != quoted_id)
            .take(HISTORY_IN_PROMPT)
            .collect();
        picked.reverse();
        picked
            .iter()
            .map(|m| {
                let mut line = format!("{}: {}", m.author, clip(&m.content));
                if m.has_attachments {
                    line.push_str(" [attachment]");
                }
                line
            })
            .collect()
    }
}

fn channel_header(channel: &ChannelInfo) -> String {
    let mut header = format!("Channel: #{} ({})", channel.name, channel.kind.label());
    if let Some(parent) = &channel.parent_name {
        header.push_str(&format!(", inside #{parent}"));
    }
    if let Some(topic) = channel.topic.as_deref().filter(|t| !t.is_empty()) {
        header.push_str(&format!("\nTopic: {topic}"));
    }
    header
}

/// Caps one quoted message so a single giant paste cannot crowd out the
/// rest of the prompt.
fn clip(content: &str) -> String {
    let clipped = truncate_to_limit(content, HISTORY_MESSAGE_TOKEN_CAP);
    if clipped.len() < content.len() {
        format!("{clipped}…")
    } else {
        content.to_string()
    }
}
