//! Deployment supervisor. Runs deployments on their own tasks.
//!
//! A run keeps going if whoever triggered it stops listening (an HTTP
//! client disconnect, say). Each run gets a cancel channel; the supervisor
//! keeps the sending half until the run finishes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::controller::Orchestrator;
use crate::result::{DeployRequest, DeploymentResult};

struct RunSlot {
    environment: String,
    cancel: watch::Sender<bool>,
}

pub struct DeploymentSupervisor {
    orchestrator: Arc<Orchestrator>,
    /// In-flight runs: run id → slot.
    runs: Arc<Mutex<HashMap<u64, RunSlot>>>,
    next_id: AtomicU64,
}

impl DeploymentSupervisor {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            runs: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Start a deployment on a new task.
    pub fn spawn(&self, environment: &str, request: DeployRequest) -> JoinHandle<DeploymentResult> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.runs.lock().expect("runs lock").insert(
            id,
            RunSlot {
                environment: environment.to_string(),
                cancel: cancel_tx,
            },
        );
        debug!(%environment, run = id, "deployment run spawned");

        let orchestrator = self.orchestrator.clone();
        let runs = self.runs.clone();
        let environment = environment.to_string();
        tokio::spawn(async move {
            let result = orchestrator
                .trigger_deployment(&environment, request, cancel_rx)
                .await;
            runs.lock().expect("runs lock").remove(&id);
            result
        })
    }

    /// Signal every in-flight run for `environment`. Returns how many were signalled.
    pub fn cancel(&self, environment: &str) -> usize {
        let runs = self.runs.lock().expect("runs lock");
        let mut signalled = 0;
        for slot in runs.values().filter(|s| s.environment == environment) {
            if slot.cancel.send(true).is_ok() {
                signalled += 1;
            }
        }
        info!(%environment, signalled, "cancel requested");
        signalled
    }

    /// Signal every in-flight run.
    pub fn cancel_all(&self) -> usize {
        let runs = self.runs.lock().expect("runs lock");
        let signalled = runs
            .values()
            .filter(|slot| slot.cancel.send(true).is_ok())
            .count();
        info!(signalled, "cancelling all deployments");
        signalled
    }

    /// Environments with a run in flight, sorted and deduplicated.
    pub fn running(&self) -> Vec<String> {
        let runs = self.runs.lock().expect("runs lock");
        let mut envs: Vec<String> = runs.values().map(|s| s.environment.clone()).collect();
        envs.sort();
        envs.dedup();
        envs
    }

    /// Wait until no run is in flight. Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.runs.lock().expect("runs lock").is_empty() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
