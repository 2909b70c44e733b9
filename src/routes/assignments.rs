//! HTTP routes for assignments
//!
//! - POST /assignments               - Manager assigns an activity to a linked dependent
//! - GET  /assignments/{id}          - Assignment, for its dependent or assigner
//! - POST /assignments/{id}/sessions - Dependent records a completed session

use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;

use super::{authenticate, json_response, parse_json_body, BoxBody};
use crate::db::schemas::SessionPayload;
use crate::server::AppState;
use crate::services::OpContext;
use crate::types::{CarelinkError, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAssignmentRequest {
    pub dependent_account_id: String,
    pub activity_template_id: String,
    #[serde(default)]
    pub scheduled_sessions: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSessionRequest {
    pub duration_minutes: u32,
    pub perceived_effort: u8,
    #[serde(default)]
    pub feedback: Option<String>,
}

impl From<RecordSessionRequest> for SessionPayload {
    fn from(req: RecordSessionRequest) -> Self {
        Self {
            duration_minutes: req.duration_minutes,
            perceived_effort: req.perceived_effort,
            feedback: req.feedback,
        }
    }
}

/// POST /assignments
pub async fn handle_create<B>(state: &AppState, ctx: &OpContext, req: Request<B>) -> Result<Response<BoxBody>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let caller = authenticate(state, ctx, req.headers()).await?;
    let body: CreateAssignmentRequest = parse_json_body(req).await?;
    let gateway = state.engine.gateway.as_ref();

    let assignment = state
        .engine
        .progress
        .create_assignment(
            ctx,
            &caller.account.id,
            &body.dependent_account_id,
            &body.activity_template_id,
            body.scheduled_sessions,
            Some(caller.credentials(gateway)),
        )
        .await?;

    Ok(json_response(StatusCode::CREATED, &assignment))
}

/// GET /assignments/{id}
///
/// Callers who are neither the dependent nor the assigner get a 404.
pub async fn handle_get<B>(
    state: &AppState,
    ctx: &OpContext,
    req: Request<B>,
    assignment_id: &str,
) -> Result<Response<BoxBody>> {
    let caller = authenticate(state, ctx, req.headers()).await?;
    let assignment = state.engine.progress.get_assignment(ctx, assignment_id).await?;

    let id = caller.account.id.as_str();
    if assignment.dependent_account_id != id && assignment.assigner_account_id != id {
        return Err(CarelinkError::AssignmentNotFound(assignment_id.to_string()));
    }

    Ok(json_response(StatusCode::OK, &assignment))
}

/// POST /assignments/{id}/sessions
///
/// An unknown assignment still records the session; the response then has
/// `assignment: null`.
pub async fn handle_record_session<B>(
    state: &AppState,
    ctx: &OpContext,
    req: Request<B>,
    assignment_id: &str,
) -> Result<Response<BoxBody>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let caller = authenticate(state, ctx, req.headers()).await?;
    let body: RecordSessionRequest = parse_json_body(req).await?;

    match state.engine.progress.get_assignment(ctx, assignment_id).await {
        Ok(assignment) if assignment.dependent_account_id != caller.account.id => {
            return Err(CarelinkError::Forbidden(
                "Only the assigned dependent may record sessions".into(),
            ));
        }
        Ok(_) | Err(CarelinkError::AssignmentNotFound(_)) => {}
        Err(e) => return Err(e),
    }

    let gateway = state.engine.gateway.as_ref();
    let completion = state
        .engine
        .progress
        .record_completion(
            ctx,
            assignment_id,
            body.into(),
            Some(&caller.account.id),
            Some(caller.credentials(gateway)),
        )
        .await?;

    Ok(json_response(StatusCode::CREATED, &completion))
}
