//! Change applicability: the scope a configuration change targets.
//!
//! A change applies to the whole cluster, to one stripe, or to one node.
//! Stripe and node targets are UID-addressed in the current persisted form;
//! index- and name-addressed targets are retained for reading V1 documents.

use crate::model::uid::Uid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scope level of an applicability target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Cluster,
    Stripe,
    Node,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Cluster => write!(f, "cluster"),
            Scope::Stripe => write!(f, "stripe"),
            Scope::Node => write!(f, "node"),
        }
    }
}

/// Reference to a stripe, either by UID (V2) or by 1-based index (V1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StripeRef {
    Uid(Uid),
    Index(u32),
}

/// Reference to a node, either by UID (V2) or by name (V1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Uid(Uid),
    Name(String),
}

/// The scope a change targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ApplicabilityWire", into = "ApplicabilityWire")]
pub enum Applicability {
    Cluster,
    Stripe(StripeRef),
    Node { stripe: StripeRef, node: NodeRef },
}

impl Applicability {
    pub fn cluster() -> Self {
        Applicability::Cluster
    }

    pub fn stripe(stripe_uid: Uid) -> Self {
        Applicability::Stripe(StripeRef::Uid(stripe_uid))
    }

    pub fn node(stripe_uid: Uid, node_uid: Uid) -> Self {
        Applicability::Node {
            stripe: StripeRef::Uid(stripe_uid),
            node: NodeRef::Uid(node_uid),
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            Applicability::Cluster => Scope::Cluster,
            Applicability::Stripe(_) => Scope::Stripe,
            Applicability::Node { .. } => Scope::Node,
        }
    }

    /// Whether every target in this applicability is UID-addressed.
    pub fn is_uid_addressed(&self) -> bool {
        match self {
            Applicability::Cluster => true,
            Applicability::Stripe(s) => matches!(s, StripeRef::Uid(_)),
            Applicability::Node { stripe, node } => {
                matches!(stripe, StripeRef::Uid(_)) && matches!(node, NodeRef::Uid(_))
            }
        }
    }
}

impl fmt::Display for Applicability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Applicability::Cluster => write!(f, "cluster"),
            Applicability::Stripe(StripeRef::Uid(uid)) => write!(f, "stripe:{}", uid),
            Applicability::Stripe(StripeRef::Index(idx)) => write!(f, "stripe:{}", idx),
            Applicability::Node { node: NodeRef::Uid(uid), .. } => write!(f, "node:{}", uid),
            Applicability::Node { node: NodeRef::Name(name), .. } => write!(f, "node:{}", name),
        }
    }
}

/// Flat wire shape: UID fields for V2 documents, index/name fields for V1.
#[derive(Serialize, Deserialize)]
struct ApplicabilityWire {
    scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stripe_uid: Option<Uid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stripe_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    node_uid: Option<Uid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    node_name: Option<String>,
}

impl From<Applicability> for ApplicabilityWire {
    fn from(applicability: Applicability) -> Self {
        let mut wire = ApplicabilityWire {
            scope: applicability.scope(),
            stripe_uid: None,
            stripe_id: None,
            node_uid: None,
            node_name: None,
        };
        match applicability {
            Applicability::Cluster => {}
            Applicability::Stripe(stripe) => set_stripe(&mut wire, stripe),
            Applicability::Node { stripe, node } => {
                set_stripe(&mut wire, stripe);
                match node {
                    NodeRef::Uid(uid) => wire.node_uid = Some(uid),
                    NodeRef::Name(name) => wire.node_name = Some(name),
                }
            }
        }
        wire
    }
}

fn set_stripe(wire: &mut ApplicabilityWire, stripe: StripeRef) {
    match stripe {
        StripeRef::Uid(uid) => wire.stripe_uid = Some(uid),
        StripeRef::Index(idx) => wire.stripe_id = Some(idx),
    }
}

impl TryFrom<ApplicabilityWire> for Applicability {
    type Error = String;

    fn try_from(wire: ApplicabilityWire) -> std::result::Result<Self, Self::Error> {
        let stripe = match (wire.stripe_uid, wire.stripe_id) {
            (Some(uid), _) => Some(StripeRef::Uid(uid)),
            (None, Some(idx)) => Some(StripeRef::Index(idx)),
            (None, None) => None,
        };
        let node = match (wire.node_uid, wire.node_name) {
            (Some(uid), _) => Some(NodeRef::Uid(uid)),
            (None, Some(name)) => Some(NodeRef::Name(name)),
            (None, None) => None,
        };
        match wire.scope {
            Scope::Cluster => Ok(Applicability::Cluster),
            Scope::Stripe => stripe
                .map(Applicability::Stripe)
                .ok_or_else(|| "stripe applicability requires a stripe target".to_string()),
            Scope::Node => match (stripe, node) {
                (Some(stripe), Some(node)) => Ok(Applicability::Node { stripe, node }),
                _ => Err("node applicability requires stripe and node targets".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v2_roundtrip() {
        let applicability = Applicability::node(Uid::generate(), Uid::generate());
        let json = serde_json::to_string(&applicability).unwrap();
        let back: Applicability = serde_json::from_str(&json).unwrap();
        assert_eq!(applicability, back);
        assert!(back.is_uid_addressed());
    }

    #[test]
    fn test_v1_document_accepted() {
        let json = r#"{"scope":"node","stripe_id":1,"node_name":"node-1"}"#;
        let applicability: Applicability = serde_json::from_str(json).unwrap();
        assert_eq!(applicability.scope(), Scope::Node);
        assert!(!applicability.is_uid_addressed());
        match applicability {
            Applicability::Node { stripe, node } => {
                assert_eq!(stripe, StripeRef::Index(1));
                assert_eq!(node, NodeRef::Name("node-1".to_string()));
            }
            _ => panic!("wrong scope"),
        }
    }

    #[test]
    fn test_missing_target_rejected() {
        let json = r#"{"scope":"stripe"}"#;
        assert!(serde_json::from_str::<Applicability>(json).is_err());
    }
}
