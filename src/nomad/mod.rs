//! The Nomad two-phase change protocol.
//!
//! Each node runs a [`server::NomadServer`]: a durable state machine that
//! accepts Discover, Prepare, Commit, Rollback and Takeover messages. A
//! [`client::NomadClient`] coordinates a set of servers through a two-phase
//! change, surviving partial failure via discovery and repair.

pub mod client;
pub mod messages;
pub mod server;
pub mod transport;
