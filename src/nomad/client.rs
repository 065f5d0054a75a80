//! The Nomad coordinator.
//!
//! Drives a set of Nomad servers through a two-phase change: discover-all,
//! consistency check, takeover fencing, prepare, then commit (or rollback on
//! any prepare rejection). Requests fan out with bounded parallelism and
//! individual deadlines; commit rejections are retried with exponential
//! backoff inside an overall envelope.

use crate::change::NomadChange;
use crate::error::{CaravanError, Result};
use crate::model::uid::Uid;
use crate::nomad::messages::{
    ChangeState, CommitMessage, DiscoverResponse, NomadMessage, NomadServerMode, PrepareMessage,
    RejectionReason, RollbackMessage, ServerState, TakeoverMessage,
};
use crate::nomad::transport::{expect_accept_reject, expect_discover, NomadConnector};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Coordinator knobs, mirroring the operator-facing flags.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Deadline for a single request (`-t`).
    pub per_try_timeout: Duration,
    /// Base interval between retries (`-r`).
    pub retry_interval: Duration,
    /// Overall envelope for one coordinator run (`-e`).
    pub envelope: Duration,
    /// Proceed despite unreachable servers (`-f`).
    pub force: bool,
    /// Bound on concurrent in-flight requests.
    pub parallelism: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            per_try_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(2),
            envelope: Duration::from_secs(120),
            force: false,
            parallelism: 8,
        }
    }
}

/// One coordinated server: a display address plus its connection.
#[derive(Clone)]
pub struct NomadEndpoint {
    pub address: String,
    pub connector: Arc<dyn NomadConnector>,
}

impl NomadEndpoint {
    pub fn new(address: impl Into<String>, connector: Arc<dyn NomadConnector>) -> Self {
        Self {
            address: address.into(),
            connector,
        }
    }
}

/// Successful outcome of a coordinated change.
#[derive(Debug, Clone)]
pub struct ChangeReport {
    pub version: u64,
    pub acks: BTreeMap<String, ServerState>,
}

/// Outcome of a repair run over an incomplete change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// No server had a prepared change outstanding.
    NothingToDo,
    /// The incomplete change was committed everywhere it was still prepared.
    Committed { version: u64 },
    /// The incomplete change was rolled back.
    RolledBack { version: u64 },
}

/// The two-phase change coordinator.
pub struct NomadClient {
    endpoints: Vec<NomadEndpoint>,
    host: String,
    user: String,
    settings: CoordinatorSettings,
}

impl NomadClient {
    pub fn new(
        endpoints: Vec<NomadEndpoint>,
        host: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            endpoints,
            host: host.into(),
            user: user.into(),
            settings: CoordinatorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Discover every server. Returns reachable responses and the failure
    /// reason for each unreachable server.
    pub async fn discover_all(
        &self,
    ) -> (BTreeMap<String, DiscoverResponse>, BTreeMap<String, String>) {
        let outcomes = self
            .broadcast(self.endpoints.iter().collect(), |_| NomadMessage::Discover)
            .await;
        let mut responses = BTreeMap::new();
        let mut unreachable = BTreeMap::new();
        for (address, outcome) in outcomes {
            match outcome.and_then(|r| expect_discover(r, &address)) {
                Ok(discover) => {
                    responses.insert(address, discover);
                }
                Err(e) => {
                    unreachable.insert(address, e.to_string());
                }
            }
        }
        (responses, unreachable)
    }

    /// Run a change through prepare and commit on every reachable server.
    pub async fn run_change(&self, change: NomadChange) -> Result<ChangeReport> {
        let started = Instant::now();
        info!(change = %change.summary(), "Coordinating change");

        let (responses, unreachable) = self.discover_all().await;
        self.check_reachability(&unreachable)?;
        if responses.is_empty() {
            return Err(CaravanError::InvalidInput(
                "no servers to coordinate".to_string(),
            ));
        }
        // An interrupted change must be reported as such before any
        // consistency verdict: a server still in prepared mode legitimately
        // lags the committed version of the rest of the cluster.
        let prepared: Vec<String> = responses
            .iter()
            .filter(|(_, r)| r.mode == NomadServerMode::Prepared)
            .map(|(address, _)| address.clone())
            .collect();
        if !prepared.is_empty() {
            return Err(CaravanError::ChangeInProgress { servers: prepared });
        }

        check_consistency(&responses)?;

        let mut counters: BTreeMap<String, u64> = responses
            .iter()
            .map(|(address, r)| (address.clone(), r.mutative_message_count))
            .collect();
        let active: Vec<NomadEndpoint> = self
            .endpoints
            .iter()
            .filter(|e| responses.contains_key(&e.address))
            .cloned()
            .collect();

        self.takeover_all(&active, &mut counters).await?;

        // Prepare phase.
        let new_version = responses
            .values()
            .map(|r| r.highest_version)
            .max()
            .unwrap_or(0)
            + 1;
        let change_uuid = Uid::generate();
        let outcomes = self
            .broadcast(active.iter().collect(), |address| {
                NomadMessage::Prepare(PrepareMessage {
                    expected_mutative_message_count: counters[address],
                    new_version,
                    change_uuid,
                    change: change.clone(),
                    host: self.host.clone(),
                    user: self.user.clone(),
                })
            })
            .await;

        let mut accepted: Vec<String> = Vec::new();
        let mut rejections: BTreeMap<String, String> = BTreeMap::new();
        for (address, outcome) in outcomes {
            match outcome.and_then(|r| expect_accept_reject(r, &address)) {
                Ok(response) if response.accepted => {
                    counters.insert(
                        address.clone(),
                        response.current_state.mutative_message_count,
                    );
                    accepted.push(address);
                }
                Ok(response) => {
                    rejections.insert(address, response.describe_rejection());
                }
                Err(e) => {
                    rejections.insert(address, e.to_string());
                }
            }
        }

        if !rejections.is_empty() {
            warn!(?rejections, "Prepare rejected; rolling back");
            self.rollback_prepared(&active, &accepted, new_version, &mut counters)
                .await;
            return Err(CaravanError::PrepareFailed { rejections });
        }

        // Commit phase: prepare is durable everywhere, so failures here are
        // retried rather than rolled back.
        let mut acks = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for endpoint in &active {
            match self
                .commit_with_retry(endpoint, new_version, &mut counters, started)
                .await
            {
                Ok(state) => {
                    acks.insert(endpoint.address.clone(), state);
                }
                Err(e) => {
                    failures.insert(endpoint.address.clone(), e.to_string());
                }
            }
        }
        if !failures.is_empty() {
            return Err(CaravanError::TwoPhaseCommitFailed { failures });
        }

        info!(version = new_version, "Change committed on all servers");
        Ok(ChangeReport {
            version: new_version,
            acks,
        })
    }

    /// Resolve an incomplete change left behind by a failed coordinator run:
    /// commit it if any server already committed it (or every server is
    /// still prepared for it), roll it back otherwise.
    pub async fn repair(&self) -> Result<RepairOutcome> {
        let started = Instant::now();
        let (responses, unreachable) = self.discover_all().await;
        self.check_reachability(&unreachable)?;

        let prepared: Vec<&String> = responses
            .iter()
            .filter(|(_, r)| r.mode == NomadServerMode::Prepared)
            .map(|(address, _)| address)
            .collect();
        if prepared.is_empty() {
            return Ok(RepairOutcome::NothingToDo);
        }

        // Every prepared server must be stuck on the same change attempt.
        let mut target: Option<(u64, Uid)> = None;
        for address in &prepared {
            let details = responses[*address]
                .latest_change
                .as_ref()
                .filter(|c| c.state == ChangeState::Prepared)
                .ok_or_else(|| {
                    CaravanError::InvalidState(format!(
                        "server {} is in prepared mode without a prepared change",
                        address
                    ))
                })?;
            let this = (details.version, details.change_uuid);
            match target {
                None => target = Some(this),
                Some(existing) if existing != this => {
                    return Err(CaravanError::ClusterInconsistent {
                        divergence: describe_states(&responses),
                    });
                }
                Some(_) => {}
            }
        }
        let Some((version, change_uuid)) = target else {
            return Ok(RepairOutcome::NothingToDo);
        };

        let committed_elsewhere = responses.values().any(|r| {
            r.latest_change
                .as_ref()
                .map(|c| {
                    c.state == ChangeState::Committed
                        && c.version == version
                        && c.change_uuid == change_uuid
                })
                .unwrap_or(false)
        });
        let should_commit = committed_elsewhere || prepared.len() == responses.len();

        let mut counters: BTreeMap<String, u64> = responses
            .iter()
            .map(|(address, r)| (address.clone(), r.mutative_message_count))
            .collect();
        let targets: Vec<NomadEndpoint> = self
            .endpoints
            .iter()
            .filter(|e| prepared.iter().any(|p| **p == e.address))
            .cloned()
            .collect();

        self.takeover_all(&targets, &mut counters).await?;

        if should_commit {
            info!(version, "Repairing incomplete change by committing");
            let mut failures = BTreeMap::new();
            for endpoint in &targets {
                if let Err(e) = self
                    .commit_with_retry(endpoint, version, &mut counters, started)
                    .await
                {
                    failures.insert(endpoint.address.clone(), e.to_string());
                }
            }
            if !failures.is_empty() {
                return Err(CaravanError::TwoPhaseCommitFailed { failures });
            }
            Ok(RepairOutcome::Committed { version })
        } else {
            info!(version, "Repairing incomplete change by rolling back");
            let addresses: Vec<String> = targets.iter().map(|e| e.address.clone()).collect();
            let failures = self
                .rollback_prepared(&targets, &addresses, version, &mut counters)
                .await;
            if !failures.is_empty() {
                return Err(CaravanError::RollbackFailed { failures });
            }
            Ok(RepairOutcome::RolledBack { version })
        }
    }

    fn check_reachability(&self, unreachable: &BTreeMap<String, String>) -> Result<()> {
        if unreachable.is_empty() {
            return Ok(());
        }
        if self.settings.force {
            warn!(?unreachable, "Proceeding despite unreachable servers (force)");
            return Ok(());
        }
        let reason = unreachable
            .iter()
            .map(|(address, error)| format!("{}: {}", address, error))
            .collect::<Vec<_>>()
            .join("; ");
        Err(CaravanError::Unreachable {
            server: format!("{} server(s)", unreachable.len()),
            reason,
        })
    }

    async fn takeover_all(
        &self,
        targets: &[NomadEndpoint],
        counters: &mut BTreeMap<String, u64>,
    ) -> Result<()> {
        let outcomes = self
            .broadcast(targets.iter().collect(), |address| {
                NomadMessage::Takeover(TakeoverMessage {
                    expected_mutative_message_count: counters[address],
                    host: self.host.clone(),
                    user: self.user.clone(),
                })
            })
            .await;
        for (address, outcome) in outcomes {
            let response = outcome.and_then(|r| expect_accept_reject(r, &address))?;
            if !response.accepted {
                let expected = counters.get(&address).copied().unwrap_or(0);
                return Err(CaravanError::CounterMismatch {
                    server: address,
                    expected,
                    actual: response.current_state.mutative_message_count,
                });
            }
            counters.insert(address, response.current_state.mutative_message_count);
        }
        Ok(())
    }

    /// Roll back servers that accepted a prepare. Failures are reported back
    /// for logging; the prepare failure itself is what the operator sees.
    async fn rollback_prepared(
        &self,
        active: &[NomadEndpoint],
        accepted: &[String],
        version: u64,
        counters: &mut BTreeMap<String, u64>,
    ) -> BTreeMap<String, String> {
        let targets: Vec<&NomadEndpoint> = active
            .iter()
            .filter(|e| accepted.contains(&e.address))
            .collect();
        let outcomes = self
            .broadcast(targets, |address| {
                NomadMessage::Rollback(RollbackMessage {
                    expected_mutative_message_count: counters[address],
                    version,
                    host: self.host.clone(),
                    user: self.user.clone(),
                })
            })
            .await;
        let mut failures = BTreeMap::new();
        for (address, outcome) in outcomes {
            match outcome.and_then(|r| expect_accept_reject(r, &address)) {
                Ok(response) if response.accepted => {
                    counters.insert(address, response.current_state.mutative_message_count);
                }
                Ok(response) => {
                    warn!(server = %address, rejection = %response.describe_rejection(), "Rollback rejected");
                    failures.insert(address, response.describe_rejection());
                }
                Err(e) => {
                    warn!(server = %address, error = %e, "Rollback failed");
                    failures.insert(address, e.to_string());
                }
            }
        }
        failures
    }

    /// Commit on one server, retrying with exponential backoff within the
    /// run's envelope. A lost reply is resolved by re-discovering the server:
    /// if it already shows the version committed, the commit succeeded.
    async fn commit_with_retry(
        &self,
        endpoint: &NomadEndpoint,
        version: u64,
        counters: &mut BTreeMap<String, u64>,
        started: Instant,
    ) -> Result<ServerState> {
        let mut attempt: u32 = 0;
        loop {
            let expected = counters[&endpoint.address];
            let message = NomadMessage::Commit(CommitMessage {
                expected_mutative_message_count: expected,
                version,
                host: self.host.clone(),
                user: self.user.clone(),
            });
            let outcome = self
                .request(endpoint, message)
                .await
                .and_then(|r| expect_accept_reject(r, &endpoint.address));

            match outcome {
                Ok(response) if response.accepted => {
                    counters.insert(
                        endpoint.address.clone(),
                        response.current_state.mutative_message_count,
                    );
                    return Ok(response.current_state);
                }
                Ok(response) => {
                    // The reply to an earlier attempt may have been lost
                    // after the server durably committed.
                    if let Some(state) = self.probe_committed(endpoint, version).await {
                        counters.insert(endpoint.address.clone(), state.mutative_message_count);
                        return Ok(state);
                    }
                    match response.rejection_reason {
                        Some(RejectionReason::StaleCounter) => {
                            counters.insert(
                                endpoint.address.clone(),
                                response.current_state.mutative_message_count,
                            );
                        }
                        _ => {
                            return Err(CaravanError::InvalidState(format!(
                                "commit rejected by {}: {}",
                                endpoint.address,
                                response.describe_rejection()
                            )));
                        }
                    }
                }
                Err(e) => {
                    debug!(server = %endpoint.address, error = %e, "Commit attempt failed");
                }
            }

            attempt += 1;
            let backoff = self
                .settings
                .retry_interval
                .saturating_mul(2u32.saturating_pow(attempt.min(8)));
            if started.elapsed() + backoff > self.settings.envelope {
                return Err(CaravanError::Timeout {
                    server: endpoint.address.clone(),
                    millis: self.settings.envelope.as_millis() as u64,
                });
            }
            tokio::time::sleep(backoff).await;
        }
    }

    /// Check whether a server already committed `version`.
    async fn probe_committed(&self, endpoint: &NomadEndpoint, version: u64) -> Option<ServerState> {
        let response = self
            .request(endpoint, NomadMessage::Discover)
            .await
            .and_then(|r| expect_discover(r, &endpoint.address))
            .ok()?;
        (response.mode == NomadServerMode::Accepting && response.current_version >= version)
            .then(|| response.state())
    }

    async fn request(
        &self,
        endpoint: &NomadEndpoint,
        message: NomadMessage,
    ) -> Result<super::messages::NomadResponse> {
        let deadline = self.settings.per_try_timeout;
        match tokio::time::timeout(deadline, endpoint.connector.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(CaravanError::Timeout {
                server: endpoint.address.clone(),
                millis: deadline.as_millis() as u64,
            }),
        }
    }

    /// Fan a message out to `targets` with bounded parallelism. The message
    /// builder sees the target address so per-server counters can be used.
    async fn broadcast<F>(
        &self,
        targets: Vec<&NomadEndpoint>,
        make: F,
    ) -> BTreeMap<String, Result<super::messages::NomadResponse>>
    where
        F: Fn(&str) -> NomadMessage,
    {
        let mut stream: FuturesUnordered<_> = FuturesUnordered::new();
        let mut pending = targets.into_iter();
        let mut results = BTreeMap::new();

        loop {
            while stream.len() < self.settings.parallelism {
                match pending.next() {
                    Some(endpoint) => {
                        let message = make(&endpoint.address);
                        let address = endpoint.address.clone();
                        stream.push(async move {
                            let outcome = self.request(endpoint, message).await;
                            (address, outcome)
                        });
                    }
                    None => break,
                }
            }
            match stream.next().await {
                Some((address, outcome)) => {
                    results.insert(address, outcome);
                }
                None => break,
            }
        }
        results
    }
}

/// Verify that every reachable server reports the same committed state.
/// Highest versions may legitimately differ after a rejected prepare, so
/// only the committed version and the committed change identity count.
/// Servers still in prepared mode are skipped for the version comparison:
/// their committed version is expected to trail by the incomplete change.
fn check_consistency(responses: &BTreeMap<String, DiscoverResponse>) -> Result<()> {
    let mut versions: Option<u64> = None;
    let mut committed: Option<(u64, Uid)> = None;
    let mut divergent = false;

    for response in responses.values() {
        if response.mode != NomadServerMode::Prepared {
            let this = response.current_version;
            match versions {
                None => versions = Some(this),
                Some(existing) if existing != this => divergent = true,
                Some(_) => {}
            }
        }
        if let Some(details) = response
            .latest_change
            .as_ref()
            .filter(|c| c.state == ChangeState::Committed)
        {
            let this = (details.version, details.change_uuid);
            match committed {
                None => committed = Some(this),
                Some(existing) if existing != this => divergent = true,
                Some(_) => {}
            }
        }
    }

    if divergent {
        return Err(CaravanError::ClusterInconsistent {
            divergence: describe_states(responses),
        });
    }
    Ok(())
}

fn describe_states(responses: &BTreeMap<String, DiscoverResponse>) -> BTreeMap<String, String> {
    responses
        .iter()
        .map(|(address, r)| {
            let change = r
                .latest_change
                .as_ref()
                .map(|c| format!("{:?}@{}", c.state, c.version))
                .unwrap_or_else(|| "none".to_string());
            (
                address.clone(),
                format!(
                    "mode={} v={} h={} latest={}",
                    r.mode, r.current_version, r.highest_version, change
                ),
            )
        })
        .collect()
}
