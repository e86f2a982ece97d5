//! Host hook events, as delivered on the orchestrator's stdin.

use serde::Deserialize;
use serde_json::Value;

/// One hook event fired by the host CLI. Unknown fields are preserved in
/// `extra` so the exact event JSON can be replayed to user hooks.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct HookEvent {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub hook_event_name: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub tool_response: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl HookEvent {
    /// Parse the stdin payload. Anything unparseable is kept as an opaque
    /// event so a span is still emitted for it.
    pub fn parse(bytes: &[u8]) -> Self {
        serde_json::from_slice(bytes).unwrap_or_default()
    }

    /// An official host hook event carries both a session id and an event
    /// name; anything else is treated as opaque.
    pub fn is_official(&self) -> bool {
        self.session_id.as_deref().is_some_and(|s| !s.is_empty())
            && self.hook_event_name.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn event_name(&self) -> &str {
        self.hook_event_name.as_deref().unwrap_or("unknown")
    }

    pub fn is_post_tool_use(&self) -> bool {
        self.event_name() == "PostToolUse"
    }

    /// PreToolUse and PostToolUse carry a tool name and are filtered by the
    /// settings matcher field.
    pub fn is_tool_scoped(&self) -> bool {
        matches!(self.event_name(), "PreToolUse" | "PostToolUse")
    }

    /// MCP tools are named `mcp__<server>__<tool>`; extract the server part.
    pub fn mcp_server(&self) -> Option<&str> {
        let name = self.tool_name.as_deref()?;
        let rest = name.strip_prefix("mcp__")?;
        let (server, _tool) = rest.split_once("__")?;
        Some(server)
    }
}
