/// Span attribute keys for the cctrace trace format.
/// Keep these stable; changing them is a breaking change for the report
/// viewer and any downstream consumer of the JSONL.
pub const ATTR_SESSION_ID: &str = "session.id";
pub const ATTR_PARENT_SESSION_ID: &str = "parent.session.id";

pub const ATTR_AI_MODEL: &str = "ai.model";
pub const ATTR_AI_TOKENS_INPUT: &str = "ai.tokens.input";
pub const ATTR_AI_TOKENS_OUTPUT: &str = "ai.tokens.output";
pub const ATTR_AI_TOKENS_INPUT_SOURCE: &str = "ai.tokens.input.source";
pub const ATTR_AI_CACHE_READ: &str = "ai.cache.read";
pub const ATTR_AI_CACHE_WRITE: &str = "ai.cache.write";
pub const ATTR_AI_COST_USD: &str = "ai.cost.usd";
pub const ATTR_AI_COST_KNOWN: &str = "ai.cost.known";
pub const ATTR_AI_PROMPT: &str = "ai.prompt";
pub const ATTR_AI_RESPONSE: &str = "ai.response";
pub const ATTR_AI_STOP_REASON: &str = "ai.stop_reason";
pub const ATTR_AI_RAW_PATH: &str = "ai.raw.path";
pub const ATTR_HTTP_STATUS_CODE: &str = "http.status_code";
pub const ATTR_HTTP_REQUEST_ID: &str = "http.request_id";

pub const ATTR_TOOL_NAME: &str = "tool.name";
pub const ATTR_TOOL_INPUT: &str = "tool.input";
pub const ATTR_TOOL_OUTPUT: &str = "tool.output";
pub const ATTR_TOOL_DURATION_MS: &str = "tool.duration.ms";
pub const ATTR_TOOL_USE_ID: &str = "tool.use_id";
pub const ATTR_MCP_SERVER: &str = "mcp.server";

pub const ATTR_HOOK_EVENT: &str = "hook.event";
pub const ATTR_HOOK_COMMAND: &str = "hook.command";
pub const ATTR_HOOK_DURATION_MS: &str = "hook.duration.ms";
pub const ATTR_HOOK_EXIT_CODE: &str = "hook.exit_code";
pub const ATTR_HOOK_PROJECT_DIR: &str = "hook.project_dir";
pub const ATTR_HOOK_STDOUT_LENGTH: &str = "hook.stdout_length";
pub const ATTR_HOOK_STDERR_LENGTH: &str = "hook.stderr_length";
pub const ATTR_HOOK_ERROR: &str = "hook.error";

pub const ATTR_EXCEPTION_MESSAGE: &str = "exception.message";
pub const ATTR_EXPORT_ERROR: &str = "export.error";
