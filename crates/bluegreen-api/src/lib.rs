//! bluegreen-api — REST API for the blue/green orchestrator.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/environments` | Status of every environment |
//! | GET | `/api/v1/environments/{env}/status` | Status of one environment |
//! | POST | `/api/v1/environments/{env}/deploy` | Run a deployment to completion |
//! | POST | `/api/v1/environments/{env}/cancel` | Cancel in-flight deployments |
//! | POST | `/api/v1/environments/{env}/reconcile` | Repoint routing at the committed color |
//! | POST | `/api/v1/environments/{env}/settle` | Clear an abandoned deployment lock |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use bluegreen_orchestrator::DeploymentSupervisor;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Arc<DeploymentSupervisor>,
}

/// Build the API router.
pub fn build_router(supervisor: Arc<DeploymentSupervisor>) -> Router {
    let api_state = ApiState { supervisor };

    let api_routes = Router::new()
        .route("/environments", get(handlers::list_environments))
        .route("/environments/{env}/status", get(handlers::get_status))
        .route("/environments/{env}/deploy", post(handlers::deploy))
        .route("/environments/{env}/cancel", post(handlers::cancel))
        .route("/environments/{env}/reconcile", post(handlers::reconcile))
        .route("/environments/{env}/settle", post(handlers::settle))
        .with_state(api_state);

    Router::new().nest("/api/v1", api_routes)
}
