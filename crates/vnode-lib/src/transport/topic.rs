//! Topic layout and filter matching

const TOPIC_ROOT: &str = "koupleless";

/// Topics scoped to one node id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    node_id: String,
}

impl Topics {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn scoped(&self, suffix: &str) -> String {
        format!("{}/{}/{}", TOPIC_ROOT, self.node_id, suffix)
    }

    /// Inbound biz state reports
    pub fn biz_state(&self) -> String {
        self.scoped("base/biz")
    }

    /// Inbound base heartbeats
    pub fn base_heart(&self) -> String {
        self.scoped("base/heart")
    }

    /// Outbound install commands
    pub fn install_biz(&self) -> String {
        self.scoped("installBiz")
    }

    /// Outbound uninstall commands
    pub fn uninstall_biz(&self) -> String {
        self.scoped("uninstallBiz")
    }

    /// Outbound liveness probe
    pub fn health(&self) -> String {
        self.scoped("health")
    }
}

/// MQTT filter matching with `+` (one level) and `#` (remaining levels)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    // Wildcards at the first level never match `$`-prefixed system topics
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_layout() {
        let topics = Topics::new("n1");
        assert_eq!(topics.biz_state(), "koupleless/n1/base/biz");
        assert_eq!(topics.base_heart(), "koupleless/n1/base/heart");
        assert_eq!(topics.install_biz(), "koupleless/n1/installBiz");
        assert_eq!(topics.uninstall_biz(), "koupleless/n1/uninstallBiz");
        assert_eq!(topics.health(), "koupleless/n1/health");
    }

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("a/b/c", "a/b/c"));
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(topic_matches("koupleless/+/base/biz", "koupleless/n1/base/biz"));
        assert!(!topic_matches("koupleless/+/base/biz", "koupleless/n1/base/heart"));
        assert!(topic_matches("a/+", "a/"));
        assert!(!topic_matches("a/+", "a"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(topic_matches("koupleless/#", "koupleless/n1/base/biz"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("#", "anything/at/all"));
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
    }
}
