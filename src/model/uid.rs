//! Time-ordered unique identifiers for cluster entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a cluster, stripe or node.
///
/// UIDs are time-ordered so that entities created later sort later, which
/// keeps listings stable across nodes without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(Uuid);

impl Uid {
    /// Generate a new time-ordered UID.
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Uid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique() {
        let a = Uid::generate();
        let b = Uid::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_time_ordering() {
        let earlier = Uid::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let later = Uid::generate();
        assert!(earlier < later);
    }

    #[test]
    fn test_parse_roundtrip() {
        let uid = Uid::generate();
        let parsed: Uid = uid.to_string().parse().unwrap();
        assert_eq!(uid, parsed);
    }
}
