//! HTTP routes for CareLink
//!
//! Handlers are generic over the request body so they can be driven by
//! hyper's `Incoming` in the server and by in-memory bodies in tests.

pub mod accounts;
pub mod assignments;
pub mod health;
pub mod links;

pub use health::health_check;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, AUTHORIZATION, CONTENT_TYPE,
};
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::auth::extract_token_from_header;
use crate::db::schemas::{AccountDoc, SignInMethod};
use crate::gateway::{CredentialGateway, ProviderSession};
use crate::server::AppState;
use crate::services::{CallerCredentials, OpContext};
use crate::types::{CarelinkError, Result};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

const MAX_BODY_BYTES: usize = 16 * 1024;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
}

// =============================================================================
// Response Helpers
// =============================================================================

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<BoxBody> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());

    let mut response = Response::new(full_body(json));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    apply_cors(response.headers_mut());
    response
}

pub fn error_response(err: &CarelinkError) -> Response<BoxBody> {
    let status = err.status_code();
    if status.is_server_error() {
        error!(code = err.code(), error = %err, "Request failed");
    } else {
        debug!(code = err.code(), error = %err, "Request rejected");
    }

    json_response(
        status,
        &ErrorResponse {
            error: err.to_string(),
            code: err.code(),
        },
    )
}

pub fn not_found_response(path: &str) -> Response<BoxBody> {
    json_response(
        StatusCode::NOT_FOUND,
        &serde_json::json!({
            "error": "Not Found",
            "code": "NOT_FOUND",
            "path": path,
        }),
    )
}

pub fn cors_preflight() -> Response<BoxBody> {
    let mut response = Response::new(full_body(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    apply_cors(response.headers_mut());
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
    response
}

// =============================================================================
// Request Helpers
// =============================================================================

pub async fn parse_json_body<B, T>(req: Request<B>) -> Result<T>
where
    B: Body,
    B::Error: std::fmt::Display,
    T: for<'de> Deserialize<'de>,
{
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| CarelinkError::BadRequest(format!("Failed to read body: {}", e)))?
        .to_bytes();

    if bytes.len() > MAX_BODY_BYTES {
        return Err(CarelinkError::BadRequest("Request body too large".into()));
    }

    serde_json::from_slice(&bytes)
        .map_err(|e| CarelinkError::BadRequest(format!("Invalid JSON: {}", e)))
}

fn bearer_token(headers: &HeaderMap) -> Result<String> {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());

    extract_token_from_header(header)
        .map(str::to_string)
        .ok_or_else(|| CarelinkError::Unauthorized("No token provided".into()))
}

/// Provider session proven by the request's bearer token
pub async fn caller_session(
    state: &AppState,
    ctx: &OpContext,
    headers: &HeaderMap,
    method: SignInMethod,
) -> Result<ProviderSession> {
    let token = bearer_token(headers)?;
    let identity = ctx
        .guard(state.engine.gateway.verify_credential(&token))
        .await??;

    Ok(ProviderSession {
        account_id: identity.account_id,
        email: identity.email,
        display_name: None,
        method,
        token,
    })
}

/// An authenticated caller with an enabled account
pub struct Caller {
    pub account: AccountDoc,
    pub session: ProviderSession,
}

impl Caller {
    pub fn credentials<'a>(&'a self, gateway: &'a dyn CredentialGateway) -> CallerCredentials<'a> {
        CallerCredentials {
            gateway,
            session: &self.session,
        }
    }
}

pub async fn authenticate(state: &AppState, ctx: &OpContext, headers: &HeaderMap) -> Result<Caller> {
    let mut session = caller_session(state, ctx, headers, SignInMethod::Password).await?;

    let account = match state.engine.accounts.get_account(ctx, &session.account_id).await {
        Ok(account) => account,
        Err(CarelinkError::AccountNotFound(id)) => return Err(CarelinkError::ProfileMissing(id)),
        Err(e) => return Err(e),
    };
    if !account.is_enabled() {
        return Err(CarelinkError::AccountDisabled(account.id));
    }

    session.method = account.sign_in_method;
    Ok(Caller { account, session })
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use bytes::Bytes;
    use clap::Parser;
    use http_body_util::{BodyExt, Full};
    use hyper::{Method, Request, Response};
    use serde_json::Value;

    use super::BoxBody;
    use crate::auth::TokenSigner;
    use crate::config::Args;
    use crate::db::MemoryStore;
    use crate::gateway::LocalCredentialGateway;
    use crate::server::AppState;
    use crate::services::{Engine, EngineConfig, MemoryNotifier, SystemClock};

    pub fn state() -> (Arc<AppState>, Arc<LocalCredentialGateway>) {
        let gateway = Arc::new(LocalCredentialGateway::new(TokenSigner::new_dev()));
        let engine = Engine::new(
            Arc::new(MemoryStore::new()),
            gateway.clone(),
            Arc::new(SystemClock),
            Arc::new(MemoryNotifier::new()),
            EngineConfig::default(),
        );
        let args = Args::parse_from(["carelink", "--dev-mode", "--store", "memory"]);
        (Arc::new(AppState::new(args, engine)), gateway)
    }

    pub fn request(method: Method, path: &str, token: Option<&str>, body: Value) -> Request<Full<Bytes>> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Full::new(Bytes::from(body.to_string()))).unwrap()
    }

    pub async fn json(response: Response<BoxBody>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_carries_code() {
        let response = error_response(&CarelinkError::InvalidOrExpiredCode);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_parse_json_body_rejects_garbage() {
        let req = Request::new(Full::new(Bytes::from_static(b"{not json")));
        let err = parse_json_body::<_, serde_json::Value>(req).await.unwrap_err();
        assert!(matches!(err, CarelinkError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let (state, _) = test_support::state();
        let err = authenticate(&state, &OpContext::new(), &HeaderMap::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, CarelinkError::Unauthorized(_)));
    }
}
