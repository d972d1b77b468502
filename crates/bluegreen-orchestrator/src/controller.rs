//! The blue/green deployment state machine.
//!
//! One call to `trigger_deployment` is one attempt. Ordering rules:
//!
//! - The lock is a compare-and-swap on the deployment record; a held lock
//!   is reported, never waited on.
//! - Routing is only touched after the new color is verified healthy.
//! - The record names the new color only after traffic has moved, the
//!   monitoring window has passed, and the old color has drained.
//! - Failures before the switch abort (new color scaled to zero); failures
//!   after it roll back (routing restored, new color left running).
//! - A lock whose run no longer exists is settled against live routing.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};

use bluegreen_core::duration::format_duration;
use bluegreen_core::{
    BackoffConfig, Color, EnvironmentConfig, OrchestratorSettings, TargetGroupRef, epoch_secs,
    retry,
};
use bluegreen_fleet::{FleetManager, RetryingFleet};
use bluegreen_health::{HealthOutcome, HealthVerifier, MonitorVerdict, RegressionMonitor};
use bluegreen_routing::RoutingError;
use bluegreen_state::{DeploymentRecord, DeploymentStatus, StateError, StateResult, StateStore};

use crate::attempt::DeploymentAttempt;
use crate::cancel::CancelSignal;
use crate::handle::EnvironmentHandle;
use crate::phase::DeploymentPhase;
use crate::result::{
    DeployRequest, DeploymentOutcome, DeploymentResult, FailureKind, ReconcileError,
    ReconcileReport, SettleAction, SettleReport,
};

/// Per-environment collaborators, with fleet calls wrapped in retries.
struct Runtime {
    handle: EnvironmentHandle,
    fleet: RetryingFleet,
}

impl Runtime {
    fn config(&self) -> &EnvironmentConfig {
        &self.handle.config
    }
}

enum Lock {
    Acquired(DeploymentRecord),
    /// Already live on the requested color.
    Converged(DeploymentRecord),
    Refused(FailureKind, String),
}

/// Why a run left the happy path.
enum Stop {
    /// Traffic never moved.
    Abort(FailureKind, String),
    /// Traffic may be on the new color.
    Rollback(FailureKind, String),
}

/// Marks a lock token as owned by a live run in this process until dropped.
struct RunGuard<'a> {
    owned: &'a Mutex<HashSet<String>>,
    token: String,
}

impl<'a> RunGuard<'a> {
    fn new(owned: &'a Mutex<HashSet<String>>, token: &str) -> Self {
        owned
            .lock()
            .expect("owned tokens lock")
            .insert(token.to_string());
        Self {
            owned,
            token: token.to_string(),
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut owned) = self.owned.lock() {
            owned.remove(&self.token);
        }
    }
}

pub struct Orchestrator {
    store: StateStore,
    settings: OrchestratorSettings,
    environments: BTreeMap<String, Runtime>,
    seq: AtomicU64,
    /// Tokens of runs in flight in this process.
    owned: Mutex<HashSet<String>>,
}

impl Orchestrator {
    /// Create the orchestrator and make sure every environment has a
    /// deployment record. Existing records are left as they are.
    pub fn new(
        store: StateStore,
        settings: OrchestratorSettings,
        handles: Vec<EnvironmentHandle>,
    ) -> StateResult<Self> {
        let mut environments = BTreeMap::new();
        for handle in handles {
            let env = &handle.config;
            let name = env.name.clone();
            let record = DeploymentRecord::new(
                &name,
                env.initial_color,
                env.target_group(env.initial_color).clone(),
            );
            if store.initialize(&record)? {
                info!(environment = %name, color = %env.initial_color, "deployment record created");
            }
            let fleet = RetryingFleet::new(handle.fleet.clone(), settings.fleet_retry.clone());
            environments.insert(name, Runtime { handle, fleet });
        }
        info!(environments = environments.len(), "orchestrator ready");

        Ok(Self {
            store,
            settings,
            environments,
            seq: AtomicU64::new(0),
            owned: Mutex::new(HashSet::new()),
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn environment(&self, name: &str) -> Option<&EnvironmentConfig> {
        self.environments.get(name).map(Runtime::config)
    }

    /// Managed environment names, sorted.
    pub fn environment_names(&self) -> Vec<String> {
        self.environments.keys().cloned().collect()
    }

    /// Read-only status for one environment.
    pub fn status(&self, environment: &str) -> StateResult<DeploymentStatus> {
        if !self.environments.contains_key(environment) {
            return Err(StateError::NotFound(environment.to_string()));
        }
        Ok(self.store.read(environment)?.status())
    }

    /// Status of every managed environment, sorted by name.
    pub fn list_status(&self) -> StateResult<Vec<DeploymentStatus>> {
        self.environments
            .keys()
            .map(|name| self.store.read(name).map(|r| r.status()))
            .collect()
    }

    /// Run one deployment attempt to a terminal result.
    pub async fn trigger_deployment(
        &self,
        environment: &str,
        request: DeployRequest,
        cancel: impl Into<CancelSignal>,
    ) -> DeploymentResult {
        let Some(rt) = self.environments.get(environment) else {
            warn!(%environment, "deployment requested for unknown environment");
            return DeploymentResult::unknown_environment(environment);
        };
        let mut cancel = cancel.into();
        let mut attempt = DeploymentAttempt::new(environment, self.next_token(environment));
        let _owned = RunGuard::new(&self.owned, &attempt.token);
        info!(
            %environment,
            token = %attempt.token,
            target = ?request.target,
            "deployment triggered"
        );

        attempt.enter(DeploymentPhase::Locking);
        let locked = match self.acquire(rt, &attempt, request.target).await {
            Lock::Acquired(record) => record,
            Lock::Converged(record) => {
                attempt.from_color = Some(record.active_color);
                attempt.to_color = Some(record.active_color);
                attempt.enter(DeploymentPhase::Idle);
                info!(%environment, color = %record.active_color, "already converged");
                return attempt.finish(
                    DeploymentOutcome::Success,
                    None,
                    DeploymentPhase::Idle,
                    format!("already converged on {}", record.active_color),
                );
            }
            Lock::Refused(kind, detail) => {
                warn!(%environment, ?kind, %detail, "deployment refused");
                return attempt.finish(
                    DeploymentOutcome::Aborted,
                    Some(kind),
                    DeploymentPhase::Locking,
                    format!("aborted in locking: {detail}"),
                );
            }
        };
        attempt.from_color = Some(locked.active_color);
        attempt.to_color = Some(locked.active_color.other());

        match self.run(rt, &mut attempt, &locked, &mut cancel).await {
            Ok(result) => result,
            Err(Stop::Abort(kind, detail)) => {
                self.abort(rt, &mut attempt, &locked, kind, detail).await
            }
            Err(Stop::Rollback(kind, detail)) => {
                self.rollback(rt, &mut attempt, &locked, kind, detail).await
            }
        }
    }

    /// Repoint routing at the record's active target group.
    ///
    /// Takes the lock for the duration so it cannot interleave with a
    /// deployment.
    pub async fn reconcile(&self, environment: &str) -> Result<ReconcileReport, ReconcileError> {
        let rt = self
            .environments
            .get(environment)
            .ok_or_else(|| ReconcileError::UnknownEnvironment(environment.to_string()))?;

        let current = self.store.read(environment)?;
        if current.transition_in_progress {
            return Err(ReconcileError::InProgress(environment.to_string()));
        }
        let token = self.next_token(environment);
        let _owned = RunGuard::new(&self.owned, &token);
        let locked = match self
            .store
            .compare_and_swap(environment, &current, &current.locked(&token))
        {
            Ok(record) => record,
            Err(e) if e.is_conflict() => {
                return Err(ReconcileError::InProgress(environment.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let routed = self.ensure_routing(rt, &locked.active_target_group).await;
        let released = self
            .store
            .compare_and_swap(environment, &locked, &locked.released());
        if let Err(e) = &released {
            error!(%environment, error = %e, "failed to release reconcile lock");
        }
        let repointed = routed?;
        released?;

        info!(
            %environment,
            color = %locked.active_color,
            target_group = %locked.active_target_group,
            repointed,
            "routing reconciled"
        );
        Ok(ReconcileReport {
            environment: environment.to_string(),
            active_color: locked.active_color,
            target_group: locked.active_target_group.clone(),
            repointed,
        })
    }

    /// Clear a lock that no run in this process holds.
    ///
    /// The record is made to agree with live routing: committed to the live
    /// color if traffic moved, otherwise released with its color unchanged.
    /// The fleets are left as they are.
    pub async fn settle(&self, environment: &str) -> Result<SettleReport, ReconcileError> {
        let rt = self
            .environments
            .get(environment)
            .ok_or_else(|| ReconcileError::UnknownEnvironment(environment.to_string()))?;
        let env = rt.config();

        let current = self.store.read(environment)?;
        if !current.transition_in_progress {
            return Ok(SettleReport {
                environment: environment.to_string(),
                action: SettleAction::NothingHeld,
                active_color: current.active_color,
                target_group: current.active_target_group,
                released_token: None,
            });
        }
        if let Some(token) = &current.lock_token
            && self.owns(token)
        {
            return Err(ReconcileError::InProgress(environment.to_string()));
        }

        let live = self.live_target_group(rt).await?;
        let Some(live_color) = env.target_groups.color_of(&live) else {
            return Err(ReconcileError::ForeignTarget(live));
        };
        let (settled, action) = if live_color == current.active_color {
            (current.released(), SettleAction::Released)
        } else {
            let record = current.committed(live_color, live, epoch_secs());
            (record, SettleAction::Committed)
        };
        let stored = match self.store.compare_and_swap(environment, &current, &settled) {
            Ok(stored) => stored,
            Err(e) if e.is_conflict() => {
                return Err(ReconcileError::InProgress(environment.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        warn!(
            %environment,
            held_by = current.lock_token.as_deref().unwrap_or("unknown"),
            ?action,
            color = %stored.active_color,
            "abandoned deployment lock settled"
        );
        Ok(SettleReport {
            environment: environment.to_string(),
            action,
            active_color: stored.active_color,
            target_group: stored.active_target_group,
            released_token: current.lock_token,
        })
    }

    /// Settle every locked record not owned by this process.
    ///
    /// Meant for startup, before deployments are accepted. Environments that
    /// cannot be settled are logged and left locked.
    pub async fn recover(&self) -> Vec<SettleReport> {
        let mut settled = Vec::new();
        for name in self.environments.keys() {
            match self.store.read(name) {
                Ok(record) if record.transition_in_progress => {}
                Ok(_) => continue,
                Err(e) => {
                    error!(environment = %name, error = %e, "reading record during recovery");
                    continue;
                }
            }
            match self.settle(name).await {
                Ok(report) => settled.push(report),
                Err(e) => error!(environment = %name, error = %e, "abandoned lock not settled"),
            }
        }
        if !settled.is_empty() {
            info!(settled = settled.len(), "recovered abandoned deployment locks");
        }
        settled
    }

    fn owns(&self, token: &str) -> bool {
        self.owned
            .lock()
            .expect("owned tokens lock")
            .contains(token)
    }

    fn next_token(&self, environment: &str) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{environment}-{millis}-{seq}")
    }

    async fn acquire(
        &self,
        rt: &Runtime,
        attempt: &DeploymentAttempt,
        target: Option<Color>,
    ) -> Lock {
        let env = rt.config();
        for round in 0..=self.settings.lock_retries {
            let current = match self.store.read(&env.name) {
                Ok(record) => record,
                Err(e) => {
                    return Lock::Refused(
                        FailureKind::State,
                        format!("reading deployment record: {e}"),
                    );
                }
            };
            if current.transition_in_progress {
                return Lock::Refused(
                    FailureKind::LockConflict,
                    format!(
                        "deployment already in progress (lock held by {})",
                        current.lock_token.as_deref().unwrap_or("unknown")
                    ),
                );
            }
            if target == Some(current.active_color) {
                return Lock::Converged(current);
            }

            let live = match self.live_target_group(rt).await {
                Ok(live) => live,
                Err(e) => {
                    return Lock::Refused(
                        FailureKind::Routing,
                        format!("reading live routing: {e}"),
                    );
                }
            };
            if live != current.active_target_group {
                return Lock::Refused(
                    FailureKind::Drift,
                    format!(
                        "live routing points at {live} but the record names {} ({}); \
                         reconcile first",
                        current.active_target_group, current.active_color
                    ),
                );
            }

            match self
                .store
                .compare_and_swap(&env.name, &current, &current.locked(&attempt.token))
            {
                Ok(locked) => {
                    debug!(environment = %env.name, revision = locked.revision, "lock acquired");
                    return Lock::Acquired(locked);
                }
                Err(e) if e.is_conflict() => {
                    debug!(environment = %env.name, round, "lock write raced, re-reading");
                }
                Err(e) => {
                    return Lock::Refused(FailureKind::State, format!("writing lock: {e}"));
                }
            }
        }
        Lock::Refused(
            FailureKind::LockConflict,
            "deployment record kept changing while locking".to_string(),
        )
    }

    /// Phases from scaling the inactive color through commit.
    async fn run(
        &self,
        rt: &Runtime,
        attempt: &mut DeploymentAttempt,
        locked: &DeploymentRecord,
        cancel: &mut CancelSignal,
    ) -> Result<DeploymentResult, Stop> {
        let env = rt.config();
        let from = locked.active_color;
        let to = from.other();
        let target_group = env.target_group(to);
        let grace = env.health_check_grace_period;

        attempt.enter(DeploymentPhase::ScalingInactive);
        if cancel.is_cancelled() {
            return Err(Stop::Abort(FailureKind::Cancelled, "cancelled before scaling".into()));
        }
        rt.fleet
            .scale(to, env.working_capacity)
            .await
            .map_err(|e| {
                Stop::Abort(
                    FailureKind::Fleet,
                    format!("scaling {} to {}: {e}", env.fleet_name(to), env.working_capacity),
                )
            })?;

        attempt.enter(DeploymentPhase::VerifyingHealth);
        let verifier = HealthVerifier::new(
            rt.handle.fleet.as_ref(),
            rt.handle.metrics.as_ref(),
            self.settings.poll_interval,
        )
        .within_grace(grace);
        let required = env.min_healthy_count();
        let health = tokio::select! {
            outcome = verifier.await_healthy(to, target_group, required, grace) => outcome,
            _ = cancel.cancelled() => {
                return Err(Stop::Abort(
                    FailureKind::Cancelled,
                    "cancelled while verifying health".into(),
                ));
            }
        };
        attempt.health = Some(health.clone());
        match health {
            HealthOutcome::Healthy { .. } => {}
            HealthOutcome::Timeout { passing, required } => {
                return Err(Stop::Abort(
                    FailureKind::Health,
                    format!(
                        "{to} not healthy within {}: {passing}/{required} passing",
                        format_duration(grace)
                    ),
                ));
            }
            HealthOutcome::Unhealthy { reason } => {
                return Err(Stop::Abort(FailureKind::Health, reason));
            }
        }

        attempt.enter(DeploymentPhase::SwitchingTraffic);
        if cancel.is_cancelled() {
            return Err(Stop::Abort(
                FailureKind::Cancelled,
                "cancelled before switching traffic".into(),
            ));
        }
        if let Err(e) = self.switch_to(rt, target_group).await {
            // A failed call may still have landed; make sure traffic is on `from`.
            let failed = format!("switch to {target_group} failed: {e}");
            return Err(match self.ensure_routing(rt, env.target_group(from)).await {
                Ok(_) => Stop::Abort(FailureKind::Routing, failed),
                Err(restore) => Stop::Rollback(
                    FailureKind::Routing,
                    format!("{failed}; confirming {from} failed: {restore}"),
                ),
            });
        }
        attempt.traffic_moved = true;
        info!(environment = %env.name, %from, %to, %target_group, "traffic switched");

        attempt.enter(DeploymentPhase::Monitoring);
        let monitor = RegressionMonitor::new(rt.handle.metrics.as_ref(), &env.monitor);
        let verdict = tokio::select! {
            verdict = monitor.watch(target_group) => verdict,
            _ = cancel.cancelled() => {
                return Err(Stop::Rollback(
                    FailureKind::Cancelled,
                    "cancelled during monitoring".into(),
                ));
            }
        };
        if let MonitorVerdict::Regressed { reason, samples } = verdict {
            return Err(Stop::Rollback(
                FailureKind::Regression,
                format!("{reason} after {samples} samples"),
            ));
        }

        attempt.enter(DeploymentPhase::DrainingOld);
        let delay = env.drain_delay();
        debug!(environment = %env.name, delay = %format_duration(delay), "deregistration delay");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return Err(Stop::Rollback(
                    FailureKind::Cancelled,
                    "cancelled while draining".into(),
                ));
            }
        }
        // Past this point the old color is going away; cancellation no longer applies.
        let drain_warning = match rt.fleet.scale(from, 0).await {
            Ok(()) => String::new(),
            Err(e) => {
                warn!(
                    environment = %env.name,
                    color = %from,
                    error = %e,
                    "old color not scaled down"
                );
                format!("; {} was not scaled down: {e}", env.fleet_name(from))
            }
        };

        attempt.enter(DeploymentPhase::Committing);
        let committed = locked.committed(to, target_group.clone(), epoch_secs());
        if let Err(e) = self.commit(&env.name, locked, &committed).await {
            error!(environment = %env.name, error = %e, "commit failed after traffic moved");
            return Ok(attempt.finish(
                DeploymentOutcome::Failed,
                Some(FailureKind::State),
                DeploymentPhase::Committing,
                format!(
                    "failed in committing: traffic is on {to} but the record could not be \
                     written: {e}; record stays locked by {} until settled{drain_warning}",
                    attempt.token
                ),
            ));
        }

        attempt.enter(DeploymentPhase::Idle);
        info!(environment = %env.name, %from, %to, "deployment committed");
        Ok(attempt.finish(
            DeploymentOutcome::Success,
            None,
            DeploymentPhase::Idle,
            format!("{from} -> {to} committed{drain_warning}"),
        ))
    }

    async fn abort(
        &self,
        rt: &Runtime,
        attempt: &mut DeploymentAttempt,
        locked: &DeploymentRecord,
        kind: FailureKind,
        detail: String,
    ) -> DeploymentResult {
        let env = rt.config();
        let failed_in = attempt.phase;
        let to = locked.active_color.other();
        warn!(environment = %env.name, phase = %failed_in, ?kind, %detail, "aborting deployment");
        attempt.enter(DeploymentPhase::Aborting);

        let mut outcome = DeploymentOutcome::Aborted;
        let mut detail = format!("aborted in {failed_in}: {detail}");
        if let Err(e) = rt.fleet.scale(to, 0).await {
            error!(
                environment = %env.name,
                color = %to,
                error = %e,
                "failed to scale new color back down"
            );
            detail.push_str(&format!("; {} was not scaled down: {e}", env.fleet_name(to)));
        }
        if let Err(e) = self.release(&env.name, locked) {
            outcome = DeploymentOutcome::Failed;
            detail.push_str(&format!("; lock release failed: {e}"));
        }
        attempt.finish(outcome, Some(kind), failed_in, detail)
    }

    async fn rollback(
        &self,
        rt: &Runtime,
        attempt: &mut DeploymentAttempt,
        locked: &DeploymentRecord,
        kind: FailureKind,
        detail: String,
    ) -> DeploymentResult {
        let env = rt.config();
        let failed_in = attempt.phase;
        let from = locked.active_color;
        let to = from.other();
        warn!(
            environment = %env.name,
            phase = %failed_in,
            ?kind,
            %detail,
            "rolling back deployment"
        );
        attempt.enter(DeploymentPhase::RollingBack);

        let detail = format!("rolled back in {failed_in}: {detail}");
        let switch_back = self.ensure_routing(rt, &locked.active_target_group).await;
        let e = match switch_back {
            Ok(_) => {
                info!(environment = %env.name, color = %from, "traffic restored");
                return match self.release(&env.name, locked) {
                    Ok(()) => attempt.finish(
                        DeploymentOutcome::RolledBack,
                        Some(kind),
                        failed_in,
                        format!("{detail}; traffic restored to {from}, {to} left running"),
                    ),
                    Err(e) => attempt.finish(
                        DeploymentOutcome::Failed,
                        Some(kind),
                        failed_in,
                        format!("{detail}; traffic restored to {from}; lock release failed: {e}"),
                    ),
                };
            }
            Err(e) => e,
        };

        // Routing could not be restored: make the record agree with whatever
        // the load balancer is actually doing.
        error!(environment = %env.name, error = %e, "switch back failed");
        // If the load balancer cannot be read either, trust the last confirmed switch.
        let live = match self.live_target_group(rt).await {
            Ok(live) => Some(live),
            Err(_) if attempt.traffic_moved => Some(env.target_group(to).clone()),
            Err(_) => None,
        };
        let settled = if live.as_ref() == Some(env.target_group(to)) {
            let record = locked.committed(to, env.target_group(to).clone(), epoch_secs());
            self.commit(&env.name, locked, &record)
                .await
                .map(|_| format!("record reconciled to live routing ({to})"))
        } else {
            self.release(&env.name, locked)
                .map(|_| format!("record left on {from}"))
        };
        let settled = settled.unwrap_or_else(|e| format!("record could not be settled: {e}"));
        attempt.finish(
            DeploymentOutcome::Failed,
            Some(kind),
            failed_in,
            format!("{detail}; switch back failed: {e}; {settled}"),
        )
    }

    fn release(&self, environment: &str, locked: &DeploymentRecord) -> StateResult<()> {
        match self.store.compare_and_swap(environment, locked, &locked.released()) {
            Ok(_) => {
                debug!(%environment, "lock released");
                Ok(())
            }
            Err(e) => {
                error!(%environment, error = %e, "failed to release deployment lock");
                Err(e)
            }
        }
    }

    /// Write the final record, retrying storage errors. A conflict means
    /// someone else changed a record we hold locked, so it is not retried.
    async fn commit(
        &self,
        environment: &str,
        locked: &DeploymentRecord,
        committed: &DeploymentRecord,
    ) -> StateResult<DeploymentRecord> {
        let store = &self.store;
        retry(
            &BackoffConfig::default(),
            "state.commit",
            |e: &StateError| !matches!(e, StateError::Conflict(_) | StateError::NotFound(_)),
            move || async move { store.compare_and_swap(environment, locked, committed) },
        )
        .await
    }

    async fn live_target_group(&self, rt: &Runtime) -> Result<TargetGroupRef, RoutingError> {
        retry(
            &self.settings.routing_retry,
            "routing.describe",
            RoutingError::is_retryable,
            move || rt.handle.routing.get_active_target_group(),
        )
        .await
    }

    async fn switch_to(
        &self,
        rt: &Runtime,
        target_group: &TargetGroupRef,
    ) -> Result<(), RoutingError> {
        retry(
            &self.settings.routing_retry,
            "routing.switch",
            RoutingError::is_retryable,
            move || rt.handle.routing.set_active_target_group(target_group),
        )
        .await
    }

    /// Point routing at `target_group` if it is not already there.
    /// Returns whether an update was made.
    async fn ensure_routing(
        &self,
        rt: &Runtime,
        target_group: &TargetGroupRef,
    ) -> Result<bool, RoutingError> {
        let live = self.live_target_group(rt).await?;
        if live == *target_group {
            return Ok(false);
        }
        self.switch_to(rt, target_group).await?;
        Ok(true)
    }
}
