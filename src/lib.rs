//! Caravan - dynamic configuration coordination for clustered data platforms.
//!
//! Caravan mutates a live cluster's topology and settings through a
//! two-phase change protocol ("Nomad") that tolerates node failures
//! mid-change and persists per-node configuration history, so a node can
//! always reconstruct its last agreed state.
//!
//! # Features
//!
//! - **Typed change algebra**: set/unset, activation, attach/detach and
//!   format upgrades as pure, composable values.
//! - **Per-node Nomad state machine**: durable accepted/prepared/committed
//!   change log with a fencing counter against stale coordinators.
//! - **Two-phase coordinator**: discover, fence, prepare, commit — with
//!   rollback on rejection and repair of interrupted changes.
//! - **Validated topology model**: cluster/stripe/node invariants checked on
//!   every proposed configuration.
//! - **Dynamic-config service**: runtime vs upcoming contexts,
//!   restart-required detection and event fan-out for a running node.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Caravan                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Coordinator: discover | takeover | prepare | commit        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Nomad Server: state machine | journal | config store       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Model: cluster topology | setting catalog | validator      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Service: runtime/upcoming contexts | events | activation   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use caravan::model::{Cluster, Node, Stripe};
//! use caravan::model::validator::ClusterValidator;
//!
//! fn main() -> caravan::Result<()> {
//!     let cluster = Cluster::new("prod").with_stripe(
//!         Stripe::new("stripe-1").with_node(Node::new("node-1", "db-1.example.com", 9410)),
//!     );
//!     ClusterValidator::new(&cluster).validate()
//! }
//! ```

pub mod change;
pub mod error;
pub mod model;
pub mod nomad;
pub mod repository;
pub mod service;

// Re-exports
pub use change::{NomadChange, SettingChange};
pub use error::{CaravanError, Result};
pub use model::{Cluster, Node, NodeContext, Stripe};
