//! Agent build information.

use serde::Serialize;

/// Build identity reported by `/version` and `/admin/version`.
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    /// Binary name.
    pub name: &'static str,
    /// Crate version baked in at compile time.
    pub version: &'static str,
    /// Commit hash injected by CI, `unknown` for local builds.
    pub commit: &'static str,
}

/// Returns the build info for this binary.
#[must_use]
pub fn get() -> BuildInfo {
    BuildInfo {
        name: "payram-agent",
        version: env!("CARGO_PKG_VERSION"),
        commit: option_env!("PAYRAM_AGENT_COMMIT").unwrap_or("unknown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_info_is_populated() {
        let info = get();
        assert_eq!(info.name, "payram-agent");
        assert!(!info.version.is_empty());
        assert!(!info.commit.is_empty());
    }
}
