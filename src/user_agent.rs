//! User-Agent strings for Direct and mirror traffic.

/// Browser-like User-Agent sent to mirror services, which commonly refuse
/// tool identifiers.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Default User-Agent for Direct requests (identifies the tool and version).
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("harvester/{version} (academic-research-tool)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_user_agent_carries_version() {
        let ua = default_user_agent();
        assert_eq!(
            ua.strip_prefix("harvester/")
                .and_then(|s| s.split(' ').next()),
            Some(env!("CARGO_PKG_VERSION")),
            "UA must contain crate version: {ua}"
        );
        assert!(ua.contains("academic-research-tool"));
    }

    #[test]
    fn test_browser_user_agent_is_single_line() {
        assert!(BROWSER_USER_AGENT.starts_with("Mozilla/5.0"));
        assert!(!BROWSER_USER_AGENT.contains('\n'));
        assert!(!BROWSER_USER_AGENT.contains("  "));
    }
}
