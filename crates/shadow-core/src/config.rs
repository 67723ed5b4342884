use std::collections::HashMap;

use anyhow::Result;

/// Which execution substrate workspaces run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    /// Direct filesystem + subprocess against a host directory.
    Local,
    /// Sandbox VM per task, operations forwarded to its sidecar.
    Remote,
}

impl AgentMode {
    pub fn from_str_or_local(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "remote" => Self::Remote,
            _ => Self::Local,
        }
    }
}

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    pub agent_mode: AgentMode,
    /// Root directory local workspaces are created under.
    pub workspace_root: String,
    /// Kubernetes namespace sandbox pods run in (remote mode).
    pub sandbox_namespace: String,

    // Models
    pub default_model: String,
    /// Small model used for commit messages, PR metadata and the shadow wiki.
    pub small_model: String,
    pub anthropic_api_key: String,

    // Background services
    pub enable_shadow_wiki: bool,
    pub enable_indexing: bool,

    // Chat / git behaviour
    pub auto_pull_request: bool,
    pub git_user_name: String,
    pub git_user_email: String,
    pub co_author_name: String,
    pub co_author_email: String,

    // Timeouts & intervals
    pub command_timeout_s: u64,
    pub install_timeout_s: u64,
    pub cleanup_interval_s: u64,
    /// Delay between a stream finishing and sandbox teardown.
    pub cleanup_delay_s: i64,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, dotenv: &HashMap<String, String>, default: bool) -> bool {
    match get(key, dotenv).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(_) => default,
        None => default,
    }
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        Ok(Config {
            agent_mode: AgentMode::from_str_or_local(&get_str("AGENT_MODE", &dotenv, "local")),
            workspace_root: get_str("WORKSPACE_ROOT", &dotenv, "workspaces"),
            sandbox_namespace: get_str("SANDBOX_NAMESPACE", &dotenv, "shadow"),
            default_model: get_str("LLM_MODEL", &dotenv, "claude-sonnet-4-5"),
            small_model: get_str("LLM_SMALL_MODEL", &dotenv, "claude-haiku-4-5-20251001"),
            anthropic_api_key: get_str("ANTHROPIC_API_KEY", &dotenv, ""),
            enable_shadow_wiki: get_bool("ENABLE_SHADOW_WIKI", &dotenv, true),
            enable_indexing: get_bool("ENABLE_INDEXING", &dotenv, false),
            auto_pull_request: get_bool("AUTO_PULL_REQUEST", &dotenv, false),
            git_user_name: get_str("GIT_USER_NAME", &dotenv, "shadow"),
            git_user_email: get_str("GIT_USER_EMAIL", &dotenv, "agent@shadowrealm.ai"),
            co_author_name: get_str("GIT_CO_AUTHOR_NAME", &dotenv, "Shadow"),
            co_author_email: get_str("GIT_CO_AUTHOR_EMAIL", &dotenv, "noreply@shadowrealm.ai"),
            command_timeout_s: get_u64("COMMAND_TIMEOUT_S", &dotenv, 30),
            install_timeout_s: get_u64("INSTALL_TIMEOUT_S", &dotenv, 300),
            cleanup_interval_s: get_u64("CLEANUP_INTERVAL_S", &dotenv, 60),
            cleanup_delay_s: get_i64("CLEANUP_DELAY_S", &dotenv, 600),
        })
    }

    /// A config suitable for tests: local mode rooted at `root`, no network.
    pub fn for_local(root: impl Into<String>) -> Self {
        Config {
            agent_mode: AgentMode::Local,
            workspace_root: root.into(),
            sandbox_namespace: "shadow".into(),
            default_model: "claude-sonnet-4-5".into(),
            small_model: "claude-haiku-4-5-20251001".into(),
            anthropic_api_key: String::new(),
            enable_shadow_wiki: false,
            enable_indexing: false,
            auto_pull_request: false,
            git_user_name: "shadow".into(),
            git_user_email: "agent@shadowrealm.ai".into(),
            co_author_name: "Shadow".into(),
            co_author_email: "noreply@shadowrealm.ai".into(),
            command_timeout_s: 30,
            install_timeout_s: 300,
            cleanup_interval_s: 60,
            cleanup_delay_s: 600,
        }
    }
}
