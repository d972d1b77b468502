//! REST API handlers.
//!
//! Status reads go straight to the orchestrator's store. Deployments run on
//! the supervisor so they finish even if the client goes away.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::warn;

use bluegreen_orchestrator::{DeployRequest, DeploymentResult, FailureKind, ReconcileError};
use bluegreen_state::StateError;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn state_error_response(e: &StateError) -> axum::response::Response {
    match e {
        StateError::NotFound(_) => {
            error_response("environment not found", StatusCode::NOT_FOUND).into_response()
        }
        _ => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// Terminal results always carry the result body. Only lock conflicts and
/// unknown environments change the status code.
fn deployment_response(result: DeploymentResult) -> axum::response::Response {
    let status = match result.kind {
        Some(FailureKind::LockConflict) => StatusCode::CONFLICT,
        Some(FailureKind::UnknownEnvironment) => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    };
    let success = result.is_success();
    let error = (!success).then(|| result.detail.clone());
    (
        status,
        Json(ApiResponse {
            success,
            data: Some(result),
            error,
        }),
    )
        .into_response()
}

// ── Status ─────────────────────────────────────────────────────

/// GET /api/v1/environments
pub async fn list_environments(State(state): State<ApiState>) -> impl IntoResponse {
    match state.supervisor.orchestrator().list_status() {
        Ok(statuses) => ApiResponse::ok(statuses).into_response(),
        Err(e) => state_error_response(&e),
    }
}

/// GET /api/v1/environments/{env}/status
pub async fn get_status(
    State(state): State<ApiState>,
    Path(env): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.orchestrator().status(&env) {
        Ok(status) => ApiResponse::ok(status).into_response(),
        Err(e) => state_error_response(&e),
    }
}

// ── Deployments ────────────────────────────────────────────────

/// POST /api/v1/environments/{env}/deploy
///
/// The body is optional; an empty body deploys to the inactive color.
pub async fn deploy(
    State(state): State<ApiState>,
    Path(env): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        DeployRequest::default()
    } else {
        match serde_json::from_slice::<DeployRequest>(&body) {
            Ok(req) => req,
            Err(e) => {
                return error_response(
                    &format!("invalid deploy request: {e}"),
                    StatusCode::BAD_REQUEST,
                )
                .into_response();
            }
        }
    };

    match state.supervisor.spawn(&env, request).await {
        Ok(result) => deployment_response(result),
        Err(e) => {
            warn!(environment = %env, error = %e, "deployment task failed");
            error_response(
                &format!("deployment task failed: {e}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
            .into_response()
        }
    }
}

/// POST /api/v1/environments/{env}/cancel
pub async fn cancel(
    State(state): State<ApiState>,
    Path(env): Path<String>,
) -> impl IntoResponse {
    if state.supervisor.orchestrator().environment(&env).is_none() {
        return error_response("environment not found", StatusCode::NOT_FOUND).into_response();
    }
    let signalled = state.supervisor.cancel(&env);
    ApiResponse::ok(serde_json::json!({ "signalled": signalled })).into_response()
}

/// POST /api/v1/environments/{env}/reconcile
pub async fn reconcile(
    State(state): State<ApiState>,
    Path(env): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.orchestrator().reconcile(&env).await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => reconcile_error_response(&e),
    }
}

/// POST /api/v1/environments/{env}/settle
///
/// Clears a lock left behind by a run that no longer exists. Refused with
/// 409 while a deployment in this process still holds it.
pub async fn settle(
    State(state): State<ApiState>,
    Path(env): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.orchestrator().settle(&env).await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => reconcile_error_response(&e),
    }
}

fn reconcile_error_response(e: &ReconcileError) -> axum::response::Response {
    let status = match e {
        ReconcileError::UnknownEnvironment(_) => StatusCode::NOT_FOUND,
        ReconcileError::InProgress(_) | ReconcileError::ForeignTarget(_) => StatusCode::CONFLICT,
        ReconcileError::Routing(_) => StatusCode::BAD_GATEWAY,
        ReconcileError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluegreen_orchestrator::{DeploymentOutcome, DeploymentPhase};

    fn result(outcome: DeploymentOutcome, kind: Option<FailureKind>) -> DeploymentResult {
        DeploymentResult {
            environment: "beta".into(),
            outcome,
            kind,
            phase: DeploymentPhase::Locking,
            detail: "detail".into(),
            from_color: None,
            to_color: None,
            phases: vec![],
            duration_ms: 0,
        }
    }

    #[test]
    fn lock_conflict_maps_to_409() {
        let resp = deployment_response(result(
            DeploymentOutcome::Aborted,
            Some(FailureKind::LockConflict),
        ));
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn unknown_environment_maps_to_404() {
        let resp = deployment_response(DeploymentResult::unknown_environment("nope"));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn other_failures_are_200() {
        for (outcome, kind) in [
            (DeploymentOutcome::Success, None),
            (DeploymentOutcome::Aborted, Some(FailureKind::Health)),
            (DeploymentOutcome::RolledBack, Some(FailureKind::Regression)),
            (DeploymentOutcome::Failed, Some(FailureKind::State)),
        ] {
            let resp = deployment_response(result(outcome, kind));
            assert_eq!(resp.status(), StatusCode::OK, "{outcome:?}");
        }
    }

    #[test]
    fn reconcile_errors_map_to_status_codes() {
        let cases = [
            (ReconcileError::UnknownEnvironment("nope".into()), StatusCode::NOT_FOUND),
            (ReconcileError::InProgress("beta".into()), StatusCode::CONFLICT),
            (
                ReconcileError::ForeignTarget("tg-other".into()),
                StatusCode::CONFLICT,
            ),
            (
                ReconcileError::State(StateError::Write("disk".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(reconcile_error_response(&err).status(), expected, "{err}");
        }
    }

    #[test]
    fn missing_record_is_404() {
        let resp = state_error_response(&StateError::NotFound("beta".into()));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = state_error_response(&StateError::Read("disk".into()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
