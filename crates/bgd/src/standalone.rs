//! Standalone mode: every subsystem in one process on a simulated cloud.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use bluegreen_core::BlueGreenConfig;
use bluegreen_fleet::{Scaler, ScalingTarget};
use bluegreen_orchestrator::{
    DeploymentSupervisor, EnvironmentHandle, Orchestrator, SettleReport,
};
use bluegreen_routing::LoadBalancer;
use bluegreen_sim::SimulatedCloud;
use bluegreen_state::StateStore;

/// File name of the state database inside the data directory.
pub const STATE_FILE: &str = "state.redb";

/// How long shutdown waits for cancelled deployments to settle.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// The assembled daemon, before anything is running.
pub struct Standalone {
    pub supervisor: Arc<DeploymentSupervisor>,
    pub load_balancer: LoadBalancer,
    /// Simulated clouds in environment order.
    pub clouds: Vec<Arc<SimulatedCloud>>,
    pub scaler: Scaler,
}

impl Standalone {
    /// Open the store under `data_dir` and assemble.
    pub fn open(config: &BlueGreenConfig, data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(STATE_FILE);
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        Self::assemble(config, store)
    }

    /// Provision every environment on a fresh load balancer and wire up the
    /// orchestrator and scaler over `store`.
    pub fn assemble(config: &BlueGreenConfig, store: StateStore) -> anyhow::Result<Self> {
        let load_balancer = LoadBalancer::new();
        let mut handles = Vec::new();
        let mut targets = Vec::new();
        let mut clouds = Vec::new();

        for env in &config.environments {
            // Routing starts at the committed color when a record survives
            // from an earlier run.
            let mut env = env.clone();
            if let Some(record) = store.get(&env.name)? {
                env.initial_color = record.active_color;
            }

            let (cloud, switch) = bluegreen_sim::provision(&env, &load_balancer)?;
            targets.push(ScalingTarget {
                config: env.clone(),
                fleet: cloud.clone(),
                metrics: cloud.clone(),
            });
            handles.push(EnvironmentHandle::new(
                env,
                cloud.clone(),
                Arc::new(switch),
                cloud.clone(),
            ));
            clouds.push(cloud);
        }

        let orchestrator = Orchestrator::new(store.clone(), config.orchestrator.clone(), handles)?;
        let supervisor = Arc::new(DeploymentSupervisor::new(Arc::new(orchestrator)));
        let scaler = Scaler::new(store, targets);
        info!(environments = clouds.len(), "standalone daemon assembled");

        Ok(Self {
            supervisor,
            load_balancer,
            clouds,
            scaler,
        })
    }

    pub fn router(&self) -> Router {
        bluegreen_api::build_router(self.supervisor.clone())
    }

    /// Settle deployment locks left behind by an earlier process.
    pub async fn recover(&self) -> Vec<SettleReport> {
        self.supervisor.orchestrator().recover().await
    }

    /// Serve the API and run the scaler until Ctrl-C.
    pub async fn run(self, port: u16, scale_interval: Duration) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        info!(%addr, "API server starting");
        let listener = TcpListener::bind(addr).await?;

        self.serve(listener, scale_interval, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await
    }

    /// Serve on `listener` until `signal` resolves.
    ///
    /// Abandoned locks are settled before the first request. On shutdown
    /// every in-flight deployment is cancelled and given `DRAIN_TIMEOUT` to
    /// reach a terminal state.
    pub async fn serve(
        self,
        listener: TcpListener,
        scale_interval: Duration,
        signal: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        self.recover().await;

        let router = self.router();
        let supervisor = self.supervisor.clone();
        let mut scaler = self.scaler;

        // ── Shutdown signal ────────────────────────────────────────

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // ── Start background tasks ─────────────────────────────────

        let scaler_handle = tokio::spawn(async move {
            scaler.run(scale_interval, shutdown_rx).await;
        });

        // ── Start API server ───────────────────────────────────────

        let in_flight = supervisor.clone();
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            signal.await;
            // Deploy requests stay open until their run ends.
            in_flight.cancel_all();
            let _ = shutdown_tx.send(true);
        });

        server.await?;

        if !supervisor.wait_idle(DRAIN_TIMEOUT).await {
            warn!(running = ?supervisor.running(), "deployments still running at shutdown");
        }
        let _ = scaler_handle.await;

        info!("blue/green daemon stopped");
        Ok(())
    }
}
