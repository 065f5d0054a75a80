//! The dynamic configuration service.
//!
//! Binds the Nomad server and repository to a running node. Tracks two
//! contexts: `runtime` (what the live process is using) and `upcoming` (what
//! every committed change amounts to); they differ exactly when a restart is
//! required. Fans committed changes out to registered listeners and owns the
//! one-shot activation and license lifecycle.

pub mod listeners;

use crate::change::NomadChange;
use crate::error::{CaravanError, Result};
use crate::model::license::License;
use crate::model::validator::ClusterValidator;
use crate::model::{Cluster, NodeContext};
use crate::nomad::server::{CommitListener, ConfigChangeApplicator, NomadServer};
use crate::repository::NomadRepository;
use listeners::{ListenerHandle, ListenerList};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// External hook that restarts the server process.
pub trait RestartHook: Send + Sync {
    fn restart(&self);
}

/// Identity of this node's process, stamped on mutations it originates.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub host: String,
    pub user: String,
}

/// Explicit collaborators of the service.
pub struct ServiceEnvironment {
    pub restart_hook: Arc<dyn RestartHook>,
    pub host_info: HostInfo,
}

struct ServiceState {
    runtime: NodeContext,
    upcoming: NodeContext,
    license: Option<License>,
    activated: bool,
}

/// Per-node dynamic configuration service.
pub struct DynamicConfigService {
    server: Arc<Mutex<NomadServer>>,
    applicator: Arc<ConfigChangeApplicator>,
    repository: Arc<NomadRepository>,
    env: ServiceEnvironment,
    state: Mutex<ServiceState>,
    runtime_listeners: ListenerList<(NodeContext, NomadChange)>,
    upcoming_listeners: ListenerList<(NodeContext, NomadChange)>,
    committed_listeners: ListenerList<(u64, NodeContext)>,
}

impl DynamicConfigService {
    /// Build the service over an opened server, wiring it in as the server's
    /// commit listener. `initial` is the diagnostic-mode context used until
    /// (or unless) the node is activated; a recovered committed context takes
    /// precedence.
    pub fn new(
        initial: NodeContext,
        server: Arc<Mutex<NomadServer>>,
        applicator: Arc<ConfigChangeApplicator>,
        repository: Arc<NomadRepository>,
        env: ServiceEnvironment,
    ) -> Result<Arc<Self>> {
        let (context, activated) = {
            let server = server.lock();
            match server.committed_context() {
                Some(committed) => (committed.clone(), true),
                None => (initial, false),
            }
        };

        let license = match repository.license_file() {
            Some(file) => {
                info!(file = %file.display(), "Reloading license");
                let content = std::fs::read_to_string(&file)?;
                let license = License::parse(&content)?;
                license.validate_cluster(&context.cluster)?;
                Some(license)
            }
            None => None,
        };
        applicator.set_license(license.clone());

        let service = Arc::new(Self {
            server: Arc::clone(&server),
            applicator,
            repository,
            env,
            state: Mutex::new(ServiceState {
                runtime: context.clone(),
                upcoming: context,
                license,
                activated,
            }),
            runtime_listeners: ListenerList::new(),
            upcoming_listeners: ListenerList::new(),
            committed_listeners: ListenerList::new(),
        });
        server
            .lock()
            .set_listener(Arc::clone(&service) as Arc<dyn CommitListener>);
        Ok(service)
    }

    /// The Nomad server this service wraps, for the node's transport layer.
    pub fn nomad_server(&self) -> Arc<Mutex<NomadServer>> {
        Arc::clone(&self.server)
    }

    /// The configuration currently in effect in the running process.
    pub fn runtime_node_context(&self) -> NodeContext {
        self.state.lock().runtime.clone()
    }

    /// The configuration that will be in effect after any pending
    /// restart-required changes are applied.
    pub fn upcoming_node_context(&self) -> NodeContext {
        self.state.lock().upcoming.clone()
    }

    pub fn is_activated(&self) -> bool {
        self.state.lock().activated
    }

    pub fn is_restart_required(&self) -> bool {
        let state = self.state.lock();
        state.runtime != state.upcoming
    }

    /// Replace the topology before activation. If this node is absent from
    /// the proposed cluster, it falls back to a cluster of itself alone.
    pub fn set_upcoming_cluster(&self, cluster: Cluster) -> Result<()> {
        let mut state = self.state.lock();
        if state.activated {
            return Err(CaravanError::InvalidState(
                "topology cannot be replaced directly on an activated node; use a coordinated change"
                    .to_string(),
            ));
        }
        ClusterValidator::new(&cluster).validate()?;

        let next = match state.upcoming.rebind(cluster.clone()) {
            Ok(rebound) => rebound,
            Err(_) => {
                let me = state.upcoming.node()?.clone();
                info!(node = %me.name, "Node absent from proposed topology; staying alone");
                NodeContext::alone(me)
            }
        };
        info!(cluster = %next.cluster.name, "Set upcoming topology");
        state.upcoming = next.clone();
        // Before activation the runtime context tracks the upcoming one.
        state.runtime = next;
        Ok(())
    }

    /// One-shot transition out of diagnostic mode.
    pub fn activate(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.activated {
            return Err(CaravanError::AlreadyActivated);
        }
        state.activated = true;
        info!(cluster = %state.upcoming.cluster.name, "Node activated");
        Ok(())
    }

    /// Validate membership, install the license, then activate. The entry
    /// point used by the activation flow before the coordinated
    /// cluster-activation change runs.
    pub fn prepare_activation(&self, cluster: Cluster, license_content: Option<&str>) -> Result<()> {
        if self.is_activated() {
            return Err(CaravanError::AlreadyActivated);
        }
        info!(cluster = %cluster.name, "Preparing activation");

        // The calling node must appear in the proposed topology under its
        // own name. An address match alone is not enough: a misnamed node
        // whose address collides with a member's would silently assume that
        // member's identity.
        {
            let state = self.state.lock();
            let me = state.upcoming.node()?;
            let named = cluster.nodes().any(|n| n.name == me.name);
            if !named {
                return Err(CaravanError::Validation(format!(
                    "node {} does not appear in the proposed cluster {}",
                    me.name, cluster.name
                )));
            }
        }

        self.set_upcoming_cluster(cluster)?;
        if let Some(content) = license_content {
            self.install_license(content)?;
        }
        self.activate()
    }

    /// Install (or replace) the license. Transactional: on validation or I/O
    /// failure the previously installed license stays in effect.
    pub fn install_license(&self, content: &str) -> Result<()> {
        info!("Installing license");
        let license = License::parse(content)?;
        {
            let state = self.state.lock();
            license.validate_cluster(&state.upcoming.cluster)?;
        }
        self.repository.install_license(content)?;

        let mut state = self.state.lock();
        state.license = Some(license.clone());
        drop(state);
        self.applicator.set_license(Some(license));
        info!("License installation successful");
        Ok(())
    }

    /// Replace an already-installed license.
    pub fn upgrade_license(&self, content: &str) -> Result<()> {
        if self.state.lock().license.is_none() {
            return Err(CaravanError::NoLicense);
        }
        self.install_license(content)
    }

    pub fn license(&self) -> Option<License> {
        self.state.lock().license.clone()
    }

    /// Check an arbitrary cluster against the installed license.
    pub fn validate_against_license(&self, cluster: &Cluster) -> Result<()> {
        match self.state.lock().license.as_ref() {
            Some(license) => license.validate_cluster(cluster),
            None => Err(CaravanError::NoLicense),
        }
    }

    /// Schedule a restart through the external hook after `delay`.
    /// The delay gives the caller time to close its connection cleanly;
    /// delays under one second are rejected.
    pub fn restart(self: &Arc<Self>, delay: Duration) -> Result<()> {
        if delay < Duration::from_secs(1) {
            return Err(CaravanError::InvalidInput(format!(
                "invalid restart delay: {:?}",
                delay
            )));
        }
        info!(seconds = delay.as_secs(), "Node will restart");
        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("Restarting node");
            service.env.restart_hook.restart();
        });
        Ok(())
    }

    pub fn on_new_runtime_configuration(
        &self,
        listener: impl Fn(&(NodeContext, NomadChange)) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.runtime_listeners.register(listener)
    }

    pub fn on_new_upcoming_configuration(
        &self,
        listener: impl Fn(&(NodeContext, NomadChange)) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.upcoming_listeners.register(listener)
    }

    pub fn on_new_topology_committed(
        &self,
        listener: impl Fn(&(u64, NodeContext)) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.committed_listeners.register(listener)
    }

    /// Whether a committed topology no longer contains this node.
    fn detached_by(&self, change: &NomadChange, state: &ServiceState) -> bool {
        match change {
            NomadChange::NodeRemoval { address, .. } => state
                .upcoming
                .node()
                .map(|me| &me.public_address == address)
                .unwrap_or(false),
            _ => false,
        }
    }

    fn handle_committed(&self, version: u64, context: &NodeContext, change: &NomadChange) {
        let mut state = self.state.lock();
        if !state.activated {
            warn!(version, "Ignoring committed change on non-activated node");
            return;
        }
        info!(version, "New configuration version saved");

        if self.detached_by(change, &state) {
            // This node has been detached: back its stores up and return to
            // diagnostic mode as a single-node cluster.
            info!("Node detached from cluster; resetting to diagnostic mode");
            state.upcoming = context.clone();
            state.runtime = context.clone();
            state.activated = false;
            drop(state);

            let server = Arc::clone(&self.server);
            tokio::spawn(async move {
                // The server lock is held by the in-flight commit; reset once
                // it settles.
                if let Err(e) = server.lock().reset() {
                    warn!(error = %e, "Failed to reset repository after detach");
                }
            });
            self.committed_listeners.notify(&(version, context.clone()));
            return;
        }

        state.upcoming = context.clone();
        let runtime_applied = change.applies_at_runtime();
        if runtime_applied {
            state.runtime = context.clone();
        }
        let snapshot = context.clone();
        drop(state);

        // Events fire outside the state lock.
        self.committed_listeners.notify(&(version, snapshot.clone()));
        if runtime_applied {
            self.runtime_listeners.notify(&(snapshot, change.clone()));
        } else {
            self.upcoming_listeners.notify(&(snapshot, change.clone()));
        }
    }
}

impl CommitListener for DynamicConfigService {
    fn on_change_committed(&self, version: u64, context: &NodeContext, change: &NomadChange) {
        self.handle_committed(version, context, change);
    }
}
