//! Model-invocable management tools.
//!
//! Two renames are offered: threads and text channels. Execution always
//! produces user-facing text; a tool that fails reports why instead of
//! erroring out of the reply.

use crate::config::ToolsConfig;
use crate::llm::{ToolCallRequest, ToolDefinition};
use crate::messaging::{ChatPlatform, RenameOutcome};
use crate::{ChannelId, GuildId, UserId};
use serde_json::{Value, json};

pub const EDIT_THREAD_NAME: &str = "edit_thread_name";
pub const EDIT_CHANNEL_NAME: &str = "edit_channel_name";

/// Platform cap on channel and thread names.
const NAME_LIMIT: usize = 100;

/// Where a tool call came from, for defaults and the admin gate.
#[derive(Debug, Clone, Copy)]
pub struct ToolOrigin {
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub author_id: UserId,
}

pub struct ToolRegistry {
    config: ToolsConfig,
}

impl ToolRegistry {
    pub fn new(config: ToolsConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Definitions offered to the model. An empty allow-list permits
    /// every tool.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        if !self.config.enabled {
            return Vec::new();
        }
        [thread_rename_definition(), channel_rename_definition()]
            .into_iter()
            .filter(|tool| self.allowed(&tool.name))
            .collect()
    }

    /// Run one tool call and describe the outcome.
    pub async fn execute<P: ChatPlatform>(
        &self,
        platform: &P,
        call: &ToolCallRequest,
        origin: ToolOrigin,
    ) -> String {
        if call.name != EDIT_THREAD_NAME && call.name != EDIT_CHANNEL_NAME {
            return format!("❌ Unknown tool: {}", call.name);
        }
        if !self.config.enabled || !self.allowed(&call.name) {
            return format!("❌ The {} tool is not enabled here", call.name);
        }
        if !self.is_authorized(platform, origin).await {
            return "❌ Only server admins can use management tools".to_string();
        }

        let key = if call.name == EDIT_THREAD_NAME {
            "thread_id"
        } else {
            "channel_id"
        };
        let target = match target_from(&call.arguments, key, origin.channel_id) {
            Ok(target) => target,
            Err(reason) => return format!("❌ {reason}"),
        };
        let name = match validated_name(&call.arguments) {
            Ok(name) => name,
            Err(reason) => return format!("❌ {reason}"),
        };

        let info = match platform.channel_info(target).await {
            Ok(info) => info,
            Err(error) => {
                tracing::warn!(%error, target, "channel lookup for tool call failed");
                return "❌ No channel or thread with that id".to_string();
            }
        };
        let wants_thread = call.name == EDIT_THREAD_NAME;
        if wants_thread != info.kind.is_thread() || !info.kind.can_edit() {
            let wanted = if wants_thread { "thread" } else { "text channel" };
            return format!("❌ That target is a {}, not a {wanted}", info.kind.label());
        }

        match platform.edit_channel_name(target, &name).await {
            Ok(RenameOutcome::Renamed) => {
                tracing::info!(target, new_name = %name, tool = %call.name, "rename tool succeeded");
                let noun = if wants_thread { "thread" } else { "channel" };
                format!("✅ Renamed the {noun} to \"{name}\"")
            }
            Ok(RenameOutcome::NotFound) => "❌ No channel or thread with that id".to_string(),
            Ok(RenameOutcome::Forbidden) => "❌ I don't have permission to rename that".to_string(),
            Err(error) => {
                tracing::warn!(%error, target, "rename tool failed");
                "❌ The rename failed on the platform side".to_string()
            }
        }
    }

    fn allowed(&self, name: &str) -> bool {
        self.config.allowed_operations.is_empty()
            || self.config.allowed_operations.iter().any(|op| op == name)
    }

    /// Admins pass outright; otherwise a configured admin role name has
    /// to match, case-insensitively. Direct messages never pass.
    async fn is_authorized<P: ChatPlatform>(&self, platform: &P, origin: ToolOrigin) -> bool {
        if !self.config.require_admin {
            return true;
        }
        let Some(guild) = origin.guild_id else {
            return false;
        };
        match platform.member_is_admin(guild, origin.author_id).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(error) => {
                tracing::warn!(%error, "admin check failed, refusing tool call");
                return false;
            }
        }
        if self.config.admin_roles.is_empty() {
            return false;
        }
        match platform.list_member_roles(guild, origin.author_id).await {
            Ok(roles) => roles.iter().any(|role| {
                self.config
                    .admin_roles
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(&role.name))
            }),
            Err(error) => {
                tracing::warn!(%error, "role lookup failed, refusing tool call");
                false
            }
        }
    }
}

/// Absent or null id falls back to the originating channel; anything
/// present has to parse.
fn target_from(arguments: &Value, key: &str, fallback: ChannelId) -> Result<ChannelId, String> {
    match arguments.get(key) {
        None | Some(Value::Null) => Ok(fallback),
        Some(value) => parse_id(value).ok_or_else(|| format!("{key} was not a valid id")),
    }
}

fn parse_id(value: &Value) -> Option<u64> {
    match value {
        Value::String(text) => text.trim().parse().ok(),
        Value::Number(number) => number.as_u64(),
        _ => None,
    }
}

fn validated_name(arguments: &Value) -> Result<String, String> {
    let name = arguments["new_name"]
        .as_str()
        .map(str::trim)
        .unwrap_or_default();
    if name.is_empty() {
        return Err("new_name is required".to_string());
    }
    if name.chars().count() > NAME_LIMIT {
        return Err(format!("new_name is over the {NAME_LIMIT} character limit"));
    }
    Ok(name.to_string())
}

fn thread_rename_definition() -> ToolDefinition {
    ToolDefinition {
        name: EDIT_THREAD_NAME.to_string(),
        description: "Rename a thread. Defaults to the thread the conversation is in.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "thread_id": {
                    "type": "string",
                    "description": "Id of the thread to rename; omit for the current thread.",
                },
                "new_name": {
                    "type": "string",
                    "description": "New thread name, at most 100 characters.",
                },
            },
            "required": ["new_name"],
        }),
    }
}

fn channel_rename_definition() -> ToolDefinition {
    ToolDefinition {
        name: EDIT_CHANNEL_NAME.to_string(),
        description: "Rename a text channel. Defaults to the channel the conversation is in."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "channel_id": {
                    "type": "string",
                    "description": "Id of the channel to rename; omit for the current channel.",
                },
                "new_name": {
                    "type": "string",
                    "description": "New channel name, at most 100 characters.",
                },
            },
            "required": ["new_name"],
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::mock::{MockPlatform, PlatformCall};
    use crate::messaging::{ChannelInfo, ChannelKind};

    fn tools_config() -> ToolsConfig {
        ToolsConfig {
            enabled: true,
            allowed_operations: Vec::new(),
            require_admin: true,
            admin_roles: Vec::new(),
        }
    }

    fn origin_in_guild() -> ToolOrigin {
        ToolOrigin {
            channel_id: 42,
            guild_id: Some(5),
            author_id: 900,
        }
    }

    fn call(name: &str, arguments: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: "call_1".to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    fn platform_with_thread(admin: UserId) -> MockPlatform {
        let platform = MockPlatform::new(1);
        platform.admin_members.lock().push(admin);
        platform.channels.lock().insert(
            42,
            ChannelInfo {
                id: 42,
                name: "old-name".to_string(),
                kind: ChannelKind::Thread,
                topic: None,
                parent_name: Some("engineering".to_string()),
            },
        );
        platform
    }

    #[test]
    fn definitions_honor_enable_flag_and_allow_list() {
        let registry = ToolRegistry::new(ToolsConfig::default());
        assert!(registry.definitions().is_empty(), "disabled by default");

        let registry = ToolRegistry::new(tools_config());
        assert_eq!(registry.definitions().len(), 2);

        let registry = ToolRegistry::new(ToolsConfig {
            allowed_operations: vec![EDIT_THREAD_NAME.to_string()],
            ..tools_config()
        });
        let definitions = registry.definitions();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].name, EDIT_THREAD_NAME);
    }

    #[tokio::test]
    async fn thread_rename_succeeds_for_an_admin() {
        let platform = platform_with_thread(900);
        let registry = ToolRegistry::new(tools_config());
        let reply = registry
            .execute(
                &platform,
                &call(EDIT_THREAD_NAME, json!({"new_name": "release-plans"})),
                origin_in_guild(),
            )
            .await;

        assert!(reply.starts_with('✅'), "got: {reply}");
        assert!(reply.contains("release-plans"));
        assert_eq!(
            platform.calls(),
            vec![PlatformCall::Rename {
                channel_id: 42,
                name: "release-plans".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn explicit_id_overrides_the_origin_channel() {
        let platform = platform_with_thread(900);
        platform.channels.lock().insert(
            43,
            ChannelInfo {
                id: 43,
                name: "other".to_string(),
                kind: ChannelKind::Thread,
                topic: None,
                parent_name: None,
            },
        );
        let registry = ToolRegistry::new(tools_config());
        let reply = registry
            .execute(
                &platform,
                &call(
                    EDIT_THREAD_NAME,
                    json!({"thread_id": "43", "new_name": "archive"}),
                ),
                origin_in_guild(),
            )
            .await;

        assert!(reply.starts_with('✅'));
        assert!(matches!(
            platform.calls().as_slice(),
            [PlatformCall::Rename { channel_id: 43, .. }]
        ));
    }

    #[tokio::test]
    async fn non_admin_without_matching_role_is_refused() {
        let platform = platform_with_thread(111);
        let registry = ToolRegistry::new(tools_config());
        let reply = registry
            .execute(
                &platform,
                &call(EDIT_THREAD_NAME, json!({"new_name": "nope"})),
                origin_in_guild(),
            )
            .await;

        assert!(reply.starts_with('❌'));
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn configured_role_name_passes_case_insensitively() {
        let platform = platform_with_thread(111);
        platform.member_roles.lock().push(crate::messaging::MemberRole {
            id: 77,
            name: "Moderators".to_string(),
        });
        let registry = ToolRegistry::new(ToolsConfig {
            admin_roles: vec!["moderators".to_string()],
            ..tools_config()
        });
        let reply = registry
            .execute(
                &platform,
                &call(EDIT_THREAD_NAME, json!({"new_name": "allowed"})),
                origin_in_guild(),
            )
            .await;

        assert!(reply.starts_with('✅'), "got: {reply}");
    }

    #[tokio::test]
    async fn direct_messages_never_pass_the_admin_gate() {
        let platform = platform_with_thread(900);
        let registry = ToolRegistry::new(tools_config());
        let origin = ToolOrigin {
            guild_id: None,
            ..origin_in_guild()
        };
        let reply = registry
            .execute(
                &platform,
                &call(EDIT_THREAD_NAME, json!({"new_name": "nope"})),
                origin,
            )
            .await;

        assert!(reply.starts_with('❌'));
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn thread_tool_refuses_a_text_channel() {
        // Unknown ids resolve to a plain text channel in the mock.
        let platform = MockPlatform::new(1);
        platform.admin_members.lock().push(900);
        let registry = ToolRegistry::new(tools_config());
        let reply = registry
            .execute(
                &platform,
                &call(EDIT_THREAD_NAME, json!({"new_name": "nope"})),
                origin_in_guild(),
            )
            .await;

        assert!(reply.contains("not a thread"));
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn names_are_validated_before_any_call() {
        let platform = platform_with_thread(900);
        let registry = ToolRegistry::new(tools_config());

        let empty = registry
            .execute(
                &platform,
                &call(EDIT_THREAD_NAME, json!({"new_name": "   "})),
                origin_in_guild(),
            )
            .await;
        assert!(empty.contains("new_name is required"));

        let long = registry
            .execute(
                &platform,
                &call(EDIT_THREAD_NAME, json!({"new_name": "x".repeat(101)})),
                origin_in_guild(),
            )
            .await;
        assert!(long.contains("character limit"));
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn forbidden_rename_reports_missing_permission() {
        let platform = platform_with_thread(900);
        *platform.rename_outcome.lock() = Some(RenameOutcome::Forbidden);
        let registry = ToolRegistry::new(tools_config());
        let reply = registry
            .execute(
                &platform,
                &call(EDIT_THREAD_NAME, json!({"new_name": "blocked"})),
                origin_in_guild(),
            )
            .await;

        assert!(reply.contains("permission"));
    }

    #[tokio::test]
    async fn unknown_tools_are_reported() {
        let platform = platform_with_thread(900);
        let registry = ToolRegistry::new(tools_config());
        let reply = registry
            .execute(
                &platform,
                &call("delete_everything", json!({})),
                origin_in_guild(),
            )
            .await;
        assert!(reply.contains("Unknown tool"));
    }
}
