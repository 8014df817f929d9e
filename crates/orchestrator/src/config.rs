//! Process configuration: flat environment variables rather than a nested
//! YAML document with `$include` directives, since every setting this
//! runtime needs is a single URL, credential or tunable rather than a tree
//! of per-environment overrides.

use std::time::Duration;

/// Built-in graph id used when a user's configured default graph cannot be
/// resolved (not found, access denied, or the user has none configured).
pub const SYSTEM_DEFAULT_GRAPH_ID: &str = "system-default";
/// Minimal single-node graph used as a last-resort fallback when even
/// `SYSTEM_DEFAULT_GRAPH_ID` fails to resolve.
pub const SYSTEM_SIMPLE_GRAPH_ID: &str = "system-simple";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const DEFAULT_MAX_CONTEXT_TOKENS: u32 = 8_000;
const DEFAULT_SUMMARY_CUSHION_TOKENS: u32 = 500;
const DEFAULT_GENERATION_TTL_SECS: u64 = 3_600;
const DEFAULT_STREAM_TIMEOUT_SECS: u64 = 60;
const DEFAULT_TOOL_CALL_TIMEOUT_SECS: u64 = 30;

/// Everything the front door, registries and pipeline need at startup,
/// read once from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub shared_cache_url: Option<String>,
    pub persistent_store_url: Option<String>,
    pub vector_store_url: Option<String>,
    pub chat_lm_url: Option<String>,
    pub worker_lm_url: Option<String>,
    pub search_provider_api_key: Option<String>,
    pub provider_api_keys: std::collections::HashMap<String, String>,
    pub system_prompt: String,
    pub max_context_tokens: u32,
    pub summary_cushion_tokens: u32,
    pub generation_ttl: Duration,
    pub stream_timeout: Duration,
    pub tool_call_timeout: Duration,
}

impl Config {
    /// Read every setting from `std::env`, falling back to documented
    /// defaults for anything optional.
    pub fn from_env() -> Self {
        Self {
            shared_cache_url: env_opt("SHARED_CACHE_URL"),
            persistent_store_url: env_opt("PERSISTENT_STORE_URL"),
            vector_store_url: env_opt("VECTOR_STORE_URL"),
            chat_lm_url: env_opt("CHAT_LM_URL"),
            worker_lm_url: env_opt("WORKER_LM_URL"),
            search_provider_api_key: env_opt("SEARCH_PROVIDER_API_KEY"),
            provider_api_keys: provider_keys_from_env(),
            system_prompt: std::env::var("SYSTEM_PROMPT").unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_context_tokens: env_u32("MAX_CONTEXT_TOKENS", DEFAULT_MAX_CONTEXT_TOKENS),
            summary_cushion_tokens: env_u32("SUMMARY_CUSHION_TOKENS", DEFAULT_SUMMARY_CUSHION_TOKENS),
            generation_ttl: Duration::from_secs(env_u64("GENERATION_TTL_SECS", DEFAULT_GENERATION_TTL_SECS)),
            stream_timeout: Duration::from_secs(env_u64("STREAM_TIMEOUT_SECS", DEFAULT_STREAM_TIMEOUT_SECS)),
            tool_call_timeout: Duration::from_secs(env_u64("TOOL_CALL_TIMEOUT_SECS", DEFAULT_TOOL_CALL_TIMEOUT_SECS)),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Provider API keys are supplied as `PROVIDER_API_KEY_<NAME>` so an
/// operator can add a new provider without a code change.
fn provider_keys_from_env() -> std::collections::HashMap<String, String> {
    const PREFIX: &str = "PROVIDER_API_KEY_";
    std::env::vars()
        .filter_map(|(k, v)| {
            k.strip_prefix(PREFIX).map(|name| (name.to_lowercase(), v))
        })
        .collect()
}
