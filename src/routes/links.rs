//! HTTP routes for dependent → manager linking
//!
//! - POST /links/codes  - Dependent mints a linking code
//! - POST /links/redeem - Manager redeems a code

use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;

use super::{authenticate, json_response, parse_json_body, BoxBody};
use crate::server::AppState;
use crate::services::OpContext;
use crate::types::Result;

#[derive(Debug, Deserialize)]
pub struct RedeemRequest {
    pub code: String,
}

/// POST /links/codes
///
/// The plaintext code appears only in this response.
pub async fn handle_generate<B>(state: &AppState, ctx: &OpContext, req: Request<B>) -> Result<Response<BoxBody>> {
    let caller = authenticate(state, ctx, req.headers()).await?;
    let gateway = state.engine.gateway.as_ref();

    let generated = state
        .engine
        .links
        .generate(ctx, &caller.account.id, Some(caller.credentials(gateway)))
        .await?;

    Ok(json_response(StatusCode::CREATED, &generated))
}

/// POST /links/redeem
pub async fn handle_redeem<B>(state: &AppState, ctx: &OpContext, req: Request<B>) -> Result<Response<BoxBody>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let caller = authenticate(state, ctx, req.headers()).await?;
    let body: RedeemRequest = parse_json_body(req).await?;
    let gateway = state.engine.gateway.as_ref();

    let link = state
        .engine
        .links
        .redeem(ctx, &body.code, &caller.account.id, Some(caller.credentials(gateway)))
        .await?;

    Ok(json_response(StatusCode::OK, &link))
}
