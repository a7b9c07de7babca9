//! The bot orchestrator: decides which messages deserve a reply and
//! drives each one through the gate, the executor, and the reconciler.

use crate::config::Config;
use crate::context::ContextBuilder;
use crate::dispatch::DispatchGate;
use crate::error::CompletionError;
use crate::llm::{CompletionExecutor, ImagePart, RequestJob};
use crate::messaging::{ChatPlatform, FetchOutcome};
use crate::persona::{Persona, PersonaLibrary};
use crate::reply::{ReplyReconciler, truncate_chars};
use crate::tools::{ToolOrigin, ToolRegistry};
use crate::IncomingMessage;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;

/// Why a message is getting a reply. Logged, never user-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseReason {
    DirectMention,
    RoleMention,
    ContinuousConversation,
}

impl ResponseReason {
    fn label(self) -> &'static str {
        match self {
            Self::DirectMention => "direct_mention",
            Self::RoleMention => "role_mention",
            Self::ContinuousConversation => "continuous_conversation",
        }
    }
}

pub struct Bot<P: ChatPlatform> {
    platform: Arc<P>,
    executor: Arc<CompletionExecutor>,
    gate: Arc<DispatchGate>,
    personas: Arc<PersonaLibrary>,
    tools: ToolRegistry,
    config: Arc<Config>,
    started_at: DateTime<Utc>,
}

impl<P: ChatPlatform> Bot<P> {
    pub fn new(
        platform: Arc<P>,
        executor: Arc<CompletionExecutor>,
        gate: Arc<DispatchGate>,
        personas: Arc<PersonaLibrary>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            platform,
            executor,
            gate,
            personas,
            tools: ToolRegistry::new(config.tools.clone()),
            config,
            started_at: Utc::now(),
        }
    }

    /// Entry point for one inbound message. Runs the whole reply
    /// lifecycle; the caller just spawns it.
    pub async fn handle_message(self: Arc<Self>, message: IncomingMessage) {
        if message.author_is_bot {
            return;
        }
        if message.content.trim() == self.config.discord.status_command {
            self.send_status_report(&message).await;
            return;
        }

        let reason = match self.should_respond(&message).await {
            Ok(Some(reason)) => reason,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(%error, message_id = message.id, "response decision failed");
                return;
            }
        };
        tracing::debug!(
            message_id = message.id,
            channel_id = message.channel_id,
            reason = reason.label(),
            "responding to message"
        );

        let persona = self.personas.default_persona();
        let permit = match self
            .gate
            .admit(message.id, message.channel_id, message.guild_id, &persona.name)
            .await
        {
            Ok(permit) => permit,
            Err(error) => {
                tracing::error!(%error, message_id = message.id, "admission failed");
                return;
            }
        };

        let bot = self.clone();
        let task_message = message.clone();
        let task_persona = persona.clone();
        let task =
            tokio::spawn(async move { bot.process_message(task_message, task_persona).await });
        self.gate.attach_handle(message.id, task.abort_handle()).await;

        match task.await {
            Ok(Ok(())) => self.gate.mark_completed(message.id).await,
            Ok(Err(error)) => {
                tracing::warn!(%error, message_id = message.id, "reply failed");
                self.gate.mark_failed(message.id).await;
            }
            Err(join_error) if join_error.is_cancelled() => {
                // The reaper counted it when it cut the task loose.
                tracing::warn!(message_id = message.id, "reply was cancelled");
            }
            Err(join_error) => {
                tracing::error!(%join_error, message_id = message.id, "reply task panicked");
                self.gate.mark_failed(message.id).await;
            }
        }
        drop(permit);
    }

    async fn should_respond(
        &self,
        message: &IncomingMessage,
    ) -> crate::Result<Option<ResponseReason>> {
        let mentions = self.platform.resolve_mentions(message).await?;
        if mentions.is_direct_mention {
            return Ok(Some(ResponseReason::DirectMention));
        }

        if let (Some(guild), Some(bot_id), false) = (
            message.guild_id,
            self.platform.bot_user_id(),
            mentions.mentioned_role_ids.is_empty(),
        ) {
            let bot_roles = self.platform.list_member_roles(guild, bot_id).await?;
            if bot_roles
                .iter()
                .any(|role| mentions.mentioned_role_ids.contains(&role.id))
            {
                return Ok(Some(ResponseReason::RoleMention));
            }
        }

        // Continuous conversation: the floor is still the bot's, unless
        // the new message is clearly aimed at someone else.
        if self.config.limits.continuous_conversation
            && !mentions.mentions_users
            && mentions.mentioned_role_ids.is_empty()
            && !mentions.mentions_everyone
        {
            if let Some(bot_id) = self.platform.bot_user_id() {
                let recent = self
                    .platform
                    .fetch_recent_messages(message.channel_id, 2)
                    .await?;
                let previous = recent.iter().find(|m| m.id != message.id);
                if previous.is_some_and(|m| m.author_id == bot_id) {
                    return Ok(Some(ResponseReason::ContinuousConversation));
                }
            }
        }
        Ok(None)
    }

    async fn process_message(
        &self,
        message: IncomingMessage,
        persona: Arc<Persona>,
    ) -> crate::Result<()> {
        let channel = self.platform.channel_info(message.channel_id).await?;
        let history = match self
            .platform
            .fetch_recent_messages(message.channel_id, self.config.limits.chat_history_limit)
            .await
        {
            Ok(history) => history,
            Err(error) => {
                tracing::warn!(%error, channel_id = message.channel_id, "history fetch failed, replying without it");
                Vec::new()
            }
        };
        let reply_context = self.reply_context(&message).await;

        let blocks = ContextBuilder::new(persona.as_ref(), &channel, &message)
            .with_history(&history)
            .with_reply_context(reply_context.as_ref())
            .build();
        let images: Vec<ImagePart> = message
            .image_attachments()
            .map(|attachment| ImagePart::new(attachment.url.clone()))
            .collect();
        let job = RequestJob::new(message.id, blocks, &self.config.llm).with_images(images);

        if self.tools.enabled() {
            let job = job.with_tools(self.tools.definitions());
            self.run_tool_reply(&message, job).await
        } else {
            self.run_streaming_reply(&message, job).await
        }
    }

    async fn run_streaming_reply(
        &self,
        message: &IncomingMessage,
        job: RequestJob,
    ) -> crate::Result<()> {
        let mut reconciler =
            ReplyReconciler::new(self.platform.as_ref(), message.channel_id, message.id);
        let stream = self.executor.stream_completion(job);
        futures::pin_mut!(stream);

        let mut failure: Option<CompletionError> = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(delta) => reconciler.push_delta(&delta).await,
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }

        if let Some(error) = failure {
            // Land whatever arrived; only apologize when nothing did.
            let partial = reconciler.finalize().await.ok().flatten();
            if partial.is_none() {
                self.send_failure_notice(message, &error).await;
            }
            return Err(error.into());
        }
        reconciler.finalize().await?;
        Ok(())
    }

    async fn run_tool_reply(
        &self,
        message: &IncomingMessage,
        job: RequestJob,
    ) -> crate::Result<()> {
        let completion = match self.executor.complete(&job).await {
            Ok(completion) => completion,
            Err(error) => {
                self.send_failure_notice(message, &error).await;
                return Err(error.into());
            }
        };

        let mut sections = Vec::new();
        if let Some(text) = completion.text {
            sections.push(text);
        }
        let origin = ToolOrigin {
            channel_id: message.channel_id,
            guild_id: message.guild_id,
            author_id: message.author_id,
        };
        for call in &completion.tool_calls {
            sections.push(
                self.tools
                    .execute(self.platform.as_ref(), call, origin)
                    .await,
            );
        }
        if sections.is_empty() {
            tracing::debug!(message_id = message.id, "model returned an empty completion");
            return Ok(());
        }

        let text = sections.join("\n");
        self.platform
            .create_reply(message.channel_id, message.id, truncate_chars(&text, 2000))
            .await?;
        Ok(())
    }

    async fn reply_context(&self, message: &IncomingMessage) -> Option<IncomingMessage> {
        let replied_id = message.referenced_message_id?;
        match self
            .platform
            .fetch_message_by_id(message.channel_id, replied_id)
            .await
        {
            Ok(FetchOutcome::Found(replied)) => Some(replied),
            Ok(FetchOutcome::NotFound) => {
                tracing::debug!(replied_id, "replied-to message is gone");
                None
            }
            Ok(FetchOutcome::Forbidden) => {
                tracing::debug!(replied_id, "replied-to message is not visible to the bot");
                None
            }
            Err(error) => {
                tracing::warn!(%error, replied_id, "reply context lookup failed");
                None
            }
        }
    }

    async fn send_failure_notice(&self, message: &IncomingMessage, error: &CompletionError) {
        let notice = match error {
            CompletionError::ContextTooLarge { .. } => {
                "That conversation has grown too long for me to take in at once."
            }
            CompletionError::RateLimited { .. } => {
                "I'm being rate limited right now, give me a minute."
            }
            CompletionError::Degraded { .. } => {
                "My connection to the language model is having trouble; try again shortly."
            }
            CompletionError::TimedOut { .. } => "The model took too long to answer.",
            _ => "Something went wrong while writing a reply.",
        };
        if let Err(delivery_error) = self
            .platform
            .create_reply(message.channel_id, message.id, notice)
            .await
        {
            tracing::debug!(%delivery_error, "failure notice could not be delivered");
        }
    }

    async fn send_status_report(&self, message: &IncomingMessage) {
        let report = self.status_report().await;
        if let Err(error) = self
            .platform
            .create_reply(message.channel_id, message.id, &report)
            .await
        {
            tracing::warn!(%error, "status report delivery failed");
        }
    }

    pub async fn status_report(&self) -> String {
        let health = self.executor.health().snapshot().await;
        let rate = self.executor.rate();
        let current_rate = rate.current_rate().await;
        let available = rate.available().await;
        let stats = self.gate.stats().await;
        let active = self.gate.active_count().await;

        let uptime = Utc::now() - self.started_at;
        let last_success = health
            .last_success
            .map(|stamp| stamp.format("%H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string());
        let recovery = if health.auto_recovery { "on" } else { "off" };

        format!(
            "**Status**\n\
             Uptime: {}h {}m\n\
             Connection: {} ({} consecutive failures, last success {last_success}, auto-recovery {recovery})\n\
             Request rate: {current_rate}/{} per {}s, {available} slots free\n\
             Active replies: {active}/{} (peak {})\n\
             Processed: {} total, {} failed, {} cancelled\n\
             Average response: {:.1}s\n\
             Personas: {} loaded, default \"{}\"",
            uptime.num_hours(),
            uptime.num_minutes() % 60,
            health.status.label(),
            health.consecutive_failures,
            rate.configured_rate(),
            rate.period().as_secs(),
            self.gate.capacity(),
            stats.peak_concurrent,
            stats.total_processed,
            stats.failed,
            stats.cancelled,
            stats.average_response_seconds,
            self.personas.len(),
            self.personas.default_persona().name,
        )
    }

    /// Final presence and platform teardown.
    pub async fn shutdown(&self) {
        self.gate.abort_all().await;
        if let Err(error) = self.platform.shutdown().await {
            tracing::warn!(%error, "platform shutdown reported an error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, HealthConfig, RateLimitConfig};
    use crate::messaging::mock::{MockPlatform, PlatformCall};
    use crate::messaging::HistoryMessage;

    const BOT_ID: u64 = 1;

    fn build_bot(platform: MockPlatform, config: Config) -> Arc<Bot<MockPlatform>> {
        let executor = CompletionExecutor::new(
            config.llm.clone(),
            &RateLimitConfig::default(),
            &HealthConfig::default(),
        )
        .unwrap();
        let config = Arc::new(config);
        Arc::new(Bot::new(
            Arc::new(platform),
            Arc::new(executor),
            Arc::new(DispatchGate::new(&config.limits)),
            Arc::new(PersonaLibrary::new("personas".into(), "friendly".into())),
            config,
        ))
    }

    fn message(id: u64, content: &str) -> IncomingMessage {
        IncomingMessage {
            id,
            channel_id: 77,
            guild_id: Some(5),
            author_id: 900,
            author_name: "dana".to_string(),
            author_is_bot: false,
            content: content.to_string(),
            attachments: Vec::new(),
            referenced_message_id: None,
            mentioned_user_ids: Vec::new(),
            mentioned_role_ids: Vec::new(),
            mentions_everyone: false,
            timestamp: Utc::now(),
        }
    }

    fn history_entry(id: u64, author_id: u64) -> HistoryMessage {
        HistoryMessage {
            id,
            author: "someone".to_string(),
            author_id,
            content: "earlier".to_string(),
            timestamp: Utc::now(),
            has_attachments: false,
            is_reply: false,
            is_bot: author_id == BOT_ID,
        }
    }

    #[tokio::test]
    async fn direct_mention_triggers_a_reply() {
        let bot = build_bot(MockPlatform::new(BOT_ID), Config::default());
        let mut message = message(10, "hey bot");
        message.mentioned_user_ids.push(BOT_ID);
        let reason = bot.should_respond(&message).await.unwrap();
        assert_eq!(reason, Some(ResponseReason::DirectMention));
    }

    #[tokio::test]
    async fn mention_of_a_held_role_triggers_a_reply() {
        let platform = MockPlatform::new(BOT_ID);
        platform.member_roles.lock().push(crate::messaging::MemberRole {
            id: 5,
            name: "Bots".to_string(),
        });
        let bot = build_bot(platform, Config::default());
        let mut message = message(10, "hey @Bots");
        message.mentioned_role_ids.push(5);
        let reason = bot.should_respond(&message).await.unwrap();
        assert_eq!(reason, Some(ResponseReason::RoleMention));
    }

    #[tokio::test]
    async fn mention_of_an_unheld_role_is_ignored() {
        let bot = build_bot(MockPlatform::new(BOT_ID), Config::default());
        let mut message = message(10, "hey @Admins");
        message.mentioned_role_ids.push(99);
        assert_eq!(bot.should_respond(&message).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bot_turn_continues_the_conversation() {
        let platform = MockPlatform::new(BOT_ID);
        *platform.history.lock() =
            vec![history_entry(10, 900), history_entry(9, BOT_ID)];
        let bot = build_bot(platform, Config::default());
        let reason = bot.should_respond(&message(10, "and then?")).await.unwrap();
        assert_eq!(reason, Some(ResponseReason::ContinuousConversation));
    }

    #[tokio::test]
    async fn continuation_stops_when_someone_else_is_addressed() {
        let platform = MockPlatform::new(BOT_ID);
        *platform.history.lock() =
            vec![history_entry(10, 900), history_entry(9, BOT_ID)];
        let bot = build_bot(platform, Config::default());
        let mut message = message(10, "what do you think?");
        message.mentioned_user_ids.push(42);
        assert_eq!(bot.should_respond(&message).await.unwrap(), None);
    }

    #[tokio::test]
    async fn continuation_respects_the_config_switch() {
        let platform = MockPlatform::new(BOT_ID);
        *platform.history.lock() =
            vec![history_entry(10, 900), history_entry(9, BOT_ID)];
        let mut config = Config::default();
        config.limits.continuous_conversation = false;
        let bot = build_bot(platform, config);
        assert_eq!(bot.should_respond(&message(10, "and then?")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unprompted_messages_get_no_reply() {
        let platform = MockPlatform::new(BOT_ID);
        *platform.history.lock() =
            vec![history_entry(10, 900), history_entry(9, 901)];
        let bot = build_bot(platform, Config::default());
        assert_eq!(bot.should_respond(&message(10, "hello all")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn status_command_replies_with_the_report() {
        let bot = build_bot(MockPlatform::new(BOT_ID), Config::default());
        bot.clone().handle_message(message(10, "!status")).await;
        let created = bot.platform.created_texts();
        assert_eq!(created.len(), 1);
        assert!(created[0].contains("**Status**"));
        assert!(created[0].contains("Connection: unknown"));
        assert!(created[0].contains("Active replies: 0/15"));
    }

    #[tokio::test]
    async fn bot_authored_messages_are_dropped_outright() {
        let bot = build_bot(MockPlatform::new(BOT_ID), Config::default());
        let mut message = message(10, "!status");
        message.author_is_bot = true;
        bot.clone().handle_message(message).await;
        assert!(bot.platform.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_completion_apologizes_and_counts_the_failure() {
        let platform = MockPlatform::new(BOT_ID);
        let mut config = Config::default();
        // Unroutable executor endpoint: the probe fails, the health gate
        // reports the connection unusable, and no text ever streams.
        config.llm.base_url = "http://127.0.0.1:9".to_string();
        config.llm.max_retries = 1;
        config.llm.retry_delay_ms = 1;
        let bot = build_bot(platform, config);

        let mut message = message(10, "hey bot");
        message.mentioned_user_ids.push(BOT_ID);
        bot.clone().handle_message(message).await;

        let created = bot.platform.created_texts();
        assert_eq!(created.len(), 1);
        assert!(created[0].contains("having trouble"), "got: {}", created[0]);
        let stats = bot.gate.stats().await;
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn status_report_reflects_dispatch_and_rate_state() {
        let bot = build_bot(MockPlatform::new(BOT_ID), Config::default());
        bot.executor.health().record_success().await;
        bot.executor.rate().acquire().await;
        let report = bot.status_report().await;
        assert!(report.contains("Connection: healthy"));
        assert!(report.contains("Request rate: 50/50 per 60s, 49 slots free"));
        assert!(report.contains("default \"friendly\""));
    }

    #[tokio::test]
    async fn shutdown_aborts_in_flight_replies_and_closes_the_platform() {
        let bot = build_bot(MockPlatform::new(BOT_ID), Config::default());
        let permit = bot.gate.admit(10, 77, Some(5), "friendly").await.unwrap();
        let stalled = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(600)).await;
        });
        bot.gate.attach_handle(10, stalled.abort_handle()).await;

        bot.shutdown().await;

        let joined = stalled.await;
        assert!(joined.unwrap_err().is_cancelled());
        assert_eq!(bot.gate.active_count().await, 0);
        assert_eq!(bot.platform.calls(), vec![PlatformCall::Shutdown]);
        drop(permit);
    }
}
