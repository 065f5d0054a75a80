//! Transport seam between the coordinator and Nomad servers.
//!
//! The RPC framing itself is an external collaborator; the coordinator only
//! needs something that can deliver one [`NomadMessage`] and return the
//! response. An in-process connector is provided for the server embedded in
//! the local node and for tests.

use crate::error::{CaravanError, Result};
use crate::nomad::messages::{NomadMessage, NomadResponse};
use crate::nomad::server::NomadServer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// A connection to one Nomad server.
#[async_trait]
pub trait NomadConnector: Send + Sync {
    /// Deliver a message and await its response. Implementations must be
    /// cancellable: the coordinator applies its own deadline around calls.
    async fn send(&self, message: NomadMessage) -> Result<NomadResponse>;
}

/// Connector to a server living in the same process.
pub struct EmbeddedConnector {
    server: Arc<Mutex<NomadServer>>,
}

impl EmbeddedConnector {
    pub fn new(server: Arc<Mutex<NomadServer>>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl NomadConnector for EmbeddedConnector {
    async fn send(&self, message: NomadMessage) -> Result<NomadResponse> {
        let mut server = self.server.lock();
        let response = match message {
            NomadMessage::Discover => NomadResponse::Discover(server.discover()),
            NomadMessage::Prepare(prepare) => NomadResponse::AcceptReject(server.prepare(prepare)),
            NomadMessage::Commit(commit) => NomadResponse::AcceptReject(server.commit(commit)),
            NomadMessage::Rollback(rollback) => {
                NomadResponse::AcceptReject(server.rollback(rollback))
            }
            NomadMessage::Takeover(takeover) => {
                NomadResponse::AcceptReject(server.takeover(takeover))
            }
        };
        Ok(response)
    }
}

/// Unwrap a Discover response, flagging protocol confusion explicitly.
pub fn expect_discover(response: NomadResponse, server: &str) -> Result<super::messages::DiscoverResponse> {
    match response {
        NomadResponse::Discover(discover) => Ok(discover),
        other => Err(CaravanError::Unreachable {
            server: server.to_string(),
            reason: format!("unexpected response to discover: {:?}", other),
        }),
    }
}

/// Unwrap an accept/reject response.
pub fn expect_accept_reject(
    response: NomadResponse,
    server: &str,
) -> Result<super::messages::AcceptRejectResponse> {
    match response {
        NomadResponse::AcceptReject(outcome) => Ok(outcome),
        other => Err(CaravanError::Unreachable {
            server: server.to_string(),
            reason: format!("unexpected response type: {:?}", other),
        }),
    }
}
