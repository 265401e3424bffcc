//! Agent configuration.
//!
//! All runtime configuration is sourced from `PAYRAM_*` environment
//! variables once at startup and threaded through the agent as an explicit
//! [`AgentConfig`] value. Nothing below this layer consults the process
//! environment for paths or endpoints, which keeps every component
//! constructible against a temp directory in tests.

use std::path::PathBuf;
use std::time::Duration;

/// Default home directory for the on-disk release layout.
pub const DEFAULT_HOME: &str = "/var/lib/payram-mcp";

/// Default admin listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:9900";

/// Default chat child port.
pub const DEFAULT_CHAT_PORT: u16 = 2358;

/// Default MCP child port.
pub const DEFAULT_MCP_PORT: u16 = 3333;

/// Default window for post-restart health validation.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(20);

/// Runtime configuration for the agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Root of the on-disk release layout.
    pub home: PathBuf,

    /// Admin server listen address.
    pub listen_addr: String,

    /// Bearer token required by the admin surface; `None` when unset.
    pub admin_token: Option<String>,

    /// Comma-separated CIDR allowlist for admin requests. Empty allows
    /// loopback only.
    pub admin_allowlist: String,

    /// Manifest host base URL.
    pub update_base_url: Option<String>,

    /// Base64-encoded Ed25519 public key for manifest verification.
    pub update_pubkey_b64: Option<String>,

    /// Bypass compatibility failures when true.
    pub ignore_compat: bool,

    /// Upstream payram-core base URL for the version probe.
    pub core_url: Option<String>,

    /// Total window for the post-restart child health check.
    pub health_timeout: Duration,

    /// Path probed on each child for health, always with a leading slash.
    pub child_health_path: String,

    /// Chat child port, used for health probes and env injection.
    pub chat_port: u16,

    /// MCP child port, used for health probes and env injection.
    pub mcp_port: u16,

    /// Override for the chat binary launched by the supervisor.
    pub chat_bin: Option<PathBuf>,

    /// Override for the MCP binary launched by the supervisor.
    pub mcp_bin: Option<PathBuf>,

    /// Source binary copied into the seed release for the chat child.
    pub seed_chat_src: PathBuf,

    /// Source binary copied into the seed release for the MCP child.
    pub seed_mcp_src: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from(DEFAULT_HOME),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            admin_token: None,
            admin_allowlist: String::new(),
            update_base_url: None,
            update_pubkey_b64: None,
            ignore_compat: false,
            core_url: None,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            child_health_path: "/health".to_string(),
            chat_port: DEFAULT_CHAT_PORT,
            mcp_port: DEFAULT_MCP_PORT,
            chat_bin: None,
            mcp_bin: None,
            seed_chat_src: PathBuf::from("/app/chat"),
            seed_mcp_src: PathBuf::from("/app/mcp"),
        }
    }
}

impl AgentConfig {
    /// Builds the configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            home: env_path("PAYRAM_AGENT_HOME").unwrap_or(defaults.home),
            listen_addr: env_nonempty("PAYRAM_AGENT_LISTEN_ADDR")
                .map(|v| normalize_listen_addr(&v))
                .unwrap_or(defaults.listen_addr),
            admin_token: env_nonempty("PAYRAM_AGENT_ADMIN_TOKEN"),
            admin_allowlist: std::env::var("PAYRAM_AGENT_ADMIN_ALLOWLIST").unwrap_or_default(),
            update_base_url: env_nonempty("PAYRAM_AGENT_UPDATE_BASE_URL"),
            update_pubkey_b64: env_nonempty("PAYRAM_AGENT_UPDATE_PUBKEY_B64"),
            ignore_compat: env_flag("PAYRAM_AGENT_IGNORE_COMPAT"),
            core_url: env_nonempty("PAYRAM_CORE_URL"),
            health_timeout: env_millis("PAYRAM_AGENT_HEALTH_TIMEOUT_MS")
                .unwrap_or(defaults.health_timeout),
            child_health_path: env_nonempty("PAYRAM_AGENT_CHILD_HEALTH_PATH")
                .map(|v| normalize_health_path(&v))
                .unwrap_or(defaults.child_health_path),
            chat_port: env_port("PAYRAM_CHAT_PORT").unwrap_or(defaults.chat_port),
            mcp_port: env_port("PAYRAM_MCP_PORT").unwrap_or(defaults.mcp_port),
            chat_bin: env_path("PAYRAM_AGENT_CHAT_BIN"),
            mcp_bin: env_path("PAYRAM_AGENT_MCP_BIN"),
            seed_chat_src: env_path("PAYRAM_AGENT_SEED_CHAT_SRC").unwrap_or(defaults.seed_chat_src),
            seed_mcp_src: env_path("PAYRAM_AGENT_SEED_MCP_SRC").unwrap_or(defaults.seed_mcp_src),
        }
    }
}

/// Normalizes a listen address, accepting the `:9900` shorthand.
#[must_use]
pub fn normalize_listen_addr(raw: &str) -> String {
    if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    }
}

/// Ensures a health path carries a leading slash.
#[must_use]
pub fn normalize_health_path(raw: &str) -> String {
    if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{raw}")
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_nonempty(key).map(PathBuf::from)
}

fn env_flag(key: &str) -> bool {
    matches!(
        std::env::var(key).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true"
    )
}

fn env_port(key: &str) -> Option<u16> {
    env_nonempty(key)?.parse::<u16>().ok().filter(|p| *p > 0)
}

fn env_millis(key: &str) -> Option<Duration> {
    let ms = env_nonempty(key)?.parse::<u64>().ok().filter(|ms| *ms > 0)?;
    Some(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_shorthand_is_normalized() {
        assert_eq!(normalize_listen_addr(":9900"), "0.0.0.0:9900");
        assert_eq!(normalize_listen_addr("127.0.0.1:9901"), "127.0.0.1:9901");
    }

    #[test]
    fn health_path_gains_leading_slash() {
        assert_eq!(normalize_health_path("health"), "/health");
        assert_eq!(normalize_health_path("/healthz"), "/healthz");
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.home, PathBuf::from(DEFAULT_HOME));
        assert_eq!(cfg.listen_addr, "0.0.0.0:9900");
        assert_eq!(cfg.chat_port, 2358);
        assert_eq!(cfg.mcp_port, 3333);
        assert_eq!(cfg.health_timeout, Duration::from_secs(20));
        assert_eq!(cfg.child_health_path, "/health");
        assert!(!cfg.ignore_compat);
    }
}
