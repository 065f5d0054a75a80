//! Shared fixtures for integration tests: in-process nodes wired to real
//! repositories in temp directories, plus a connector that can drop commits
//! to simulate a node crashing between phases.
#![allow(dead_code)]

use caravan::error::{CaravanError, Result};
use caravan::model::{Cluster, Node, NodeContext, Stripe};
use caravan::nomad::client::{CoordinatorSettings, NomadClient, NomadEndpoint};
use caravan::nomad::messages::{NomadMessage, NomadResponse};
use caravan::nomad::server::{ChangeApplicator, ConfigChangeApplicator, NomadServer};
use caravan::nomad::transport::{EmbeddedConnector, NomadConnector};
use caravan::repository::NomadRepository;
use caravan::service::{DynamicConfigService, HostInfo, RestartHook, ServiceEnvironment};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct NoopRestart;

impl RestartHook for NoopRestart {
    fn restart(&self) {}
}

/// One in-process node: repository, Nomad server and service.
pub struct TestNode {
    pub name: String,
    pub address: String,
    pub dir: TempDir,
    pub applicator: Arc<ConfigChangeApplicator>,
    pub service: Arc<DynamicConfigService>,
}

impl TestNode {
    pub fn start(name: &str, host: &str, port: u16) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let node = Node::new(name, host, port);
        let address = node.public_address.to_string();
        let service = open_service(dir.path(), node).expect("service");
        Self {
            name: name.to_string(),
            address,
            dir,
            applicator: service.1,
            service: service.0,
        }
    }

    /// Re-open the node over the same repository, as after a process crash.
    pub fn restart(&mut self) {
        let node = Node::new(&self.name, "ignored", 1);
        let (service, applicator) = open_service(self.dir.path(), node).expect("service");
        self.service = service;
        self.applicator = applicator;
    }

    pub fn connector(&self) -> Arc<dyn NomadConnector> {
        Arc::new(EmbeddedConnector::new(self.service.nomad_server()))
    }

    pub fn discover(&self) -> caravan::nomad::messages::DiscoverResponse {
        self.service.nomad_server().lock().discover()
    }
}

fn open_service(
    dir: &std::path::Path,
    node: Node,
) -> Result<(Arc<DynamicConfigService>, Arc<ConfigChangeApplicator>)> {
    let repository = Arc::new(NomadRepository::new(dir.join("repo")));
    repository.create_directories()?;
    let applicator = Arc::new(ConfigChangeApplicator::new(&node.name));
    let server = NomadServer::open(
        repository.journal()?,
        repository.config_store(&node.name),
        Arc::clone(&applicator) as Arc<dyn ChangeApplicator>,
    )?;
    let service = DynamicConfigService::new(
        NodeContext::alone(node),
        Arc::new(Mutex::new(server)),
        Arc::clone(&applicator),
        repository,
        ServiceEnvironment {
            restart_hook: Arc::new(NoopRestart),
            host_info: HostInfo {
                host: "test-host".to_string(),
                user: "tester".to_string(),
            },
        },
    )?;
    Ok((service, applicator))
}

/// Connector wrapper that can fail Commit messages, or all messages, while
/// engaged.
pub struct CommitDropper {
    inner: Arc<dyn NomadConnector>,
    dropping_commits: AtomicBool,
    dropping_everything: AtomicBool,
}

impl CommitDropper {
    pub fn new(inner: Arc<dyn NomadConnector>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            dropping_commits: AtomicBool::new(false),
            dropping_everything: AtomicBool::new(false),
        })
    }

    pub fn drop_commits(&self, enabled: bool) {
        self.dropping_commits.store(enabled, Ordering::SeqCst);
    }

    pub fn drop_everything(&self, enabled: bool) {
        self.dropping_everything.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl NomadConnector for CommitDropper {
    async fn send(&self, message: NomadMessage) -> Result<NomadResponse> {
        let drop_this = self.dropping_everything.load(Ordering::SeqCst)
            || (self.dropping_commits.load(Ordering::SeqCst)
                && matches!(message, NomadMessage::Commit(_)));
        if drop_this {
            return Err(CaravanError::Unreachable {
                server: "dropped".to_string(),
                reason: "connection reset".to_string(),
            });
        }
        self.inner.send(message).await
    }
}

/// A two-node cluster topology naming the given test nodes.
pub fn cluster_of(nodes: &[&TestNode]) -> Cluster {
    let mut stripe = Stripe::new("stripe-1");
    for node in nodes {
        let address: caravan::model::Address = node.address.parse().expect("address");
        stripe = stripe.with_node(Node::new(&node.name, address.host, address.port));
    }
    Cluster::new("it-cluster").with_stripe(stripe)
}

/// Coordinator over the given endpoints with fast, test-friendly timings.
pub fn client_for(endpoints: Vec<NomadEndpoint>) -> NomadClient {
    NomadClient::new(endpoints, "coordinator-host", "tester").with_settings(fast_settings(false))
}

pub fn fast_settings(force: bool) -> CoordinatorSettings {
    CoordinatorSettings {
        per_try_timeout: Duration::from_secs(2),
        retry_interval: Duration::from_millis(20),
        envelope: Duration::from_secs(3),
        force,
        parallelism: 4,
    }
}

/// Endpoints for plain embedded connectors.
pub fn endpoints(nodes: &[&TestNode]) -> Vec<NomadEndpoint> {
    nodes
        .iter()
        .map(|n| NomadEndpoint::new(n.address.clone(), n.connector()))
        .collect()
}
