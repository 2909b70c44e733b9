//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling. Each request gets its
//! own [`OpContext`] carrying the configured deadline; dropping the
//! connection drops the handler future.

use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Args;
use crate::routes::{self, BoxBody};
use crate::services::{Engine, OpContext};
use crate::types::CarelinkError;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub engine: Engine,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(args: Args, engine: Engine) -> Self {
        Self {
            args,
            engine,
            started_at: Instant::now(),
        }
    }
}

/// Serve until `shutdown` is cancelled
pub async fn run(state: Arc<AppState>, shutdown: CancellationToken) -> Result<(), CarelinkError> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(listen = %state.args.listen, store = ?state.args.store, "CareLink listening");

    if state.args.dev_mode {
        warn!("Development mode enabled - dev credentials allowed");
    }

    loop {
        let (stream, addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, no longer accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Error accepting connection: {:?}", e);
                    continue;
                }
            },
        };

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);

            let service = service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, hyper::Error>(handle_request(state, addr, req).await) }
            });

            if let Err(err) = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(io, service)
                .await
            {
                error!("Error serving connection from {}: {:?}", addr, err);
            }
        });
    }
}

/// Route an incoming HTTP request
pub async fn handle_request<B>(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<B>,
) -> Response<BoxBody>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("[{}] {} {}", addr, method, path);

    if method == Method::OPTIONS {
        return routes::cors_preflight();
    }

    let ctx = OpContext::with_timeout(state.args.request_timeout());
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let result = match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => Ok(routes::health_check(&state)),

        (&Method::POST, ["accounts", "signup"]) => {
            routes::accounts::handle_signup(&state, &ctx, req).await
        }
        (&Method::POST, ["accounts", "login"]) => {
            routes::accounts::handle_login(&state, &ctx, req).await
        }
        (&Method::POST, ["accounts", "federated", "complete"]) => {
            routes::accounts::handle_federated_complete(&state, &ctx, req).await
        }
        (&Method::POST, ["accounts", "verify-email"]) => {
            routes::accounts::handle_verify_email(&state, &ctx, req).await
        }
        (&Method::POST, ["accounts", "verify-email", "resend"]) => {
            routes::accounts::handle_resend_verification(&state, &ctx, req).await
        }
        (&Method::POST, ["accounts", "password-reset"]) => {
            routes::accounts::handle_password_reset(&state, &ctx, req).await
        }
        (&Method::POST, ["accounts", "password-reset", "confirm"]) => {
            routes::accounts::handle_password_reset_confirm(&state, &ctx, req).await
        }
        (&Method::GET, ["accounts", "me"]) => routes::accounts::handle_me(&state, &ctx, req).await,

        (&Method::POST, ["links", "codes"]) => {
            routes::links::handle_generate(&state, &ctx, req).await
        }
        (&Method::POST, ["links", "redeem"]) => {
            routes::links::handle_redeem(&state, &ctx, req).await
        }

        (&Method::POST, ["assignments"]) => {
            routes::assignments::handle_create(&state, &ctx, req).await
        }
        (&Method::GET, ["assignments", id]) => {
            routes::assignments::handle_get(&state, &ctx, req, id).await
        }
        (&Method::POST, ["assignments", id, "sessions"]) => {
            routes::assignments::handle_record_session(&state, &ctx, req, id).await
        }

        _ => return routes::not_found_response(&path),
    };

    result.unwrap_or_else(|e| routes::error_response(&e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::{json, request, state};
    use hyper::StatusCode;
    use serde_json::json;

    fn local() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9))
    }

    #[tokio::test]
    async fn test_routes_dispatch_and_map_errors() {
        let (state, _) = state();

        let health = handle_request(
            state.clone(),
            local(),
            request(Method::GET, "/health", None, json!(null)),
        )
        .await;
        assert_eq!(health.status(), StatusCode::OK);

        let missing = handle_request(
            state.clone(),
            local(),
            request(Method::GET, "/nope", None, json!(null)),
        )
        .await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let unauthorized = handle_request(
            state.clone(),
            local(),
            request(Method::GET, "/accounts/me", None, json!(null)),
        )
        .await;
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json(unauthorized).await["code"], "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_duplicate_signup_is_conflict() {
        let (state, _) = state();
        let body = json!({
            "email": "twice@example.com",
            "password": "hunter22",
            "role": "dependent",
            "profile": { "name": "Tw" }
        });

        let first = handle_request(
            state.clone(),
            local(),
            request(Method::POST, "/accounts/signup", None, body.clone()),
        )
        .await;
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = handle_request(
            state,
            local(),
            request(Method::POST, "/accounts/signup", None, body),
        )
        .await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(json(second).await["code"], "EMAIL_ALREADY_REGISTERED");
    }
}
