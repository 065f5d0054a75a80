//! Placeholder substitution for path-valued settings.
//!
//! Paths may embed `%h` (hostname), `%n` (node name) and `%H` (user home).
//! Substitution happens before path validation and before the repository
//! touches the file system.

use crate::model::Node;

/// Substitute all supported placeholders in `raw` for the given node.
pub fn substitute(raw: &str, node: &Node) -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    raw.replace("%h", &node.hostname)
        .replace("%n", &node.name)
        .replace("%H", &home)
}

/// Whether a substituted value is a syntactically valid path: non-empty and
/// free of unresolved placeholders.
pub fn is_valid_path(substituted: &str) -> bool {
    !substituted.is_empty() && !substituted.contains('%') && !substituted.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitution() {
        let node = Node::new("node-1", "host-a", 9410);
        assert_eq!(substitute("/var/%n/logs", &node), "/var/node-1/logs");
        assert_eq!(substitute("/var/%h/logs", &node), "/var/host-a/logs");
    }

    #[test]
    fn test_path_validity() {
        assert!(is_valid_path("/var/data"));
        assert!(is_valid_path("relative/data"));
        assert!(!is_valid_path(""));
        assert!(!is_valid_path("/var/%x/data"));
    }
}
