//! Liveness endpoint
//!
//! `/health` answers 200 whenever the process is serving. It does not check
//! the store; a store outage shows up as 503s on the routes that need it.

use hyper::{Response, StatusCode};
use serde::Serialize;

use super::{json_response, BoxBody};
use crate::config::StoreBackend;
use crate::server::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    pub commit: &'static str,
    pub build_time: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    pub store: &'static str,
    pub dev_mode: bool,
    pub timestamp: String,
}

pub fn health_check(state: &AppState) -> Response<BoxBody> {
    let store = match state.args.store {
        StoreBackend::Memory => "memory",
        StoreBackend::Mongo => "mongo",
    };

    json_response(
        StatusCode::OK,
        &HealthResponse {
            healthy: true,
            version: env!("CARGO_PKG_VERSION"),
            commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
            build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
            uptime: state.started_at.elapsed().as_secs(),
            store,
            dev_mode: state.args.dev_mode,
            timestamp: chrono::Utc::now().to_rfc3339(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support;

    #[tokio::test]
    async fn test_health_reports_backend() {
        let (state, _) = test_support::state();
        let response = health_check(&state);
        assert_eq!(response.status(), StatusCode::OK);

        let body = test_support::json(response).await;
        assert_eq!(body["healthy"], true);
        assert_eq!(body["store"], "memory");
    }
}
