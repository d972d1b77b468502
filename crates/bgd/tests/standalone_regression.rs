//! Standalone regression tests.
//!
//! Assembles the daemon from the shipped sample configuration and drives it
//! through the REST API: status listing, a full deployment, a restart from
//! the on-disk store, lock recovery, shutdown, and the steady-state scaler.

use std::path::PathBuf;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tower::ServiceExt;

use bgd::Standalone;
use bluegreen_core::{BlueGreenConfig, Color, TargetGroupRef};
use bluegreen_fleet::ScaleDecision;
use bluegreen_orchestrator::SettleAction;
use bluegreen_state::StateStore;

fn sample_config() -> BlueGreenConfig {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config/environments.toml");
    BlueGreenConfig::from_file(&path).unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn sample_config_validates() {
    let config = sample_config();
    let names: Vec<&str> = config.environments.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["beta", "prod"]);
    assert_eq!(config.environments[1].initial_color, Color::Green);
}

#[tokio::test]
async fn standalone_lists_every_environment() {
    let daemon =
        Standalone::assemble(&sample_config(), StateStore::open_in_memory().unwrap()).unwrap();
    let router = daemon.router();

    let req = Request::builder()
        .uri("/api/v1/environments")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = body_json(resp).await;
    let envs = body["data"].as_array().unwrap();
    assert_eq!(envs.len(), 2);
    assert_eq!(envs[0]["environment"], "beta");
    assert_eq!(envs[0]["active_color"], "blue");
    assert_eq!(envs[1]["environment"], "prod");
    assert_eq!(envs[1]["active_color"], "green");
}

#[tokio::test(start_paused = true)]
async fn deployment_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = sample_config();

    {
        let daemon = Standalone::open(&config, dir.path()).unwrap();
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/environments/beta/deploy")
            .body(Body::empty())
            .unwrap();
        let resp = daemon.router().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true, "{body}");
        assert_eq!(body["data"]["to_color"], "green");
    }

    // A fresh process routes to the committed color from the start.
    let daemon = Standalone::open(&config, dir.path()).unwrap();
    assert_eq!(
        daemon.load_balancer.listener_target("beta-https").unwrap(),
        TargetGroupRef::new("tg-beta-green")
    );
    let status = daemon.supervisor.orchestrator().status("beta").unwrap();
    assert_eq!(status.active_color, Color::Green);
    assert!(!status.transition_in_progress);
}

#[tokio::test]
async fn scaler_grows_busy_active_fleet() {
    let mut daemon =
        Standalone::assemble(&sample_config(), StateStore::open_in_memory().unwrap()).unwrap();
    daemon.clouds[0].configure(Color::Blue, |k| k.cpu_percent = 95.0);

    let decisions = daemon.scaler.evaluate_all().await;
    let beta = decisions
        .iter()
        .find(|(env, _)| env == "beta")
        .map(|(_, d)| d.clone())
        .unwrap();
    // 95% against a 60% target on two instances.
    assert_eq!(beta, ScaleDecision::ScaleTo(4));
    assert_eq!(daemon.clouds[0].desired(Color::Blue), 4);
}

#[tokio::test]
async fn restart_settles_lock_left_by_killed_process() {
    let dir = tempfile::tempdir().unwrap();
    let config = sample_config();

    {
        // The previous process took the lock and died before finishing.
        let daemon = Standalone::open(&config, dir.path()).unwrap();
        let store = daemon.supervisor.orchestrator().store().clone();
        let record = store.read("beta").unwrap();
        store
            .compare_and_swap("beta", &record, &record.locked("beta-killed-1"))
            .unwrap();
    }

    let daemon = Standalone::open(&config, dir.path()).unwrap();
    assert!(
        daemon
            .supervisor
            .orchestrator()
            .status("beta")
            .unwrap()
            .transition_in_progress
    );

    let reports = daemon.recover().await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].environment, "beta");
    assert_eq!(reports[0].action, SettleAction::Released);
    assert_eq!(reports[0].released_token.as_deref(), Some("beta-killed-1"));

    let status = daemon.supervisor.orchestrator().status("beta").unwrap();
    assert_eq!(status.active_color, Color::Blue);
    assert!(!status.transition_in_progress);
    assert!(daemon.recover().await.is_empty());
}

#[tokio::test]
async fn shutdown_cancels_in_flight_deployment() {
    let daemon =
        Standalone::assemble(&sample_config(), StateStore::open_in_memory().unwrap()).unwrap();
    // Green never finishes booting, so the run sits in health verification.
    daemon.clouds[0].set_boot_time(Duration::from_secs(3600));
    let supervisor = daemon.supervisor.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(daemon.serve(listener, Duration::from_secs(3600), async {
        let _ = stop_rx.await;
    }));

    let client = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"POST /api/v1/environments/beta/deploy HTTP/1.1\r\n\
                  Host: localhost\r\n\
                  Content-Length: 0\r\n\
                  Connection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while supervisor.running().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("deployment never started");

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("shutdown waited on the running deployment")
        .unwrap()
        .unwrap();

    let response = client.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#""kind":"cancelled""#), "{response}");
    assert!(supervisor.running().is_empty());

    let status = supervisor.orchestrator().status("beta").unwrap();
    assert_eq!(status.active_color, Color::Blue);
    assert!(!status.transition_in_progress);
}
