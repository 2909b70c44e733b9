//! HTTP routes for accounts
//!
//! - POST /accounts/signup            - Password signup for either portal
//! - POST /accounts/login             - Password sign-in for a portal
//! - POST /accounts/federated/complete - Finish a federated signup
//! - POST /accounts/verify-email      - Activate a pending account with its emailed code
//! - POST /accounts/verify-email/resend - Send the caller a new verification code
//! - POST /accounts/password-reset    - Email a password-reset code
//! - POST /accounts/password-reset/confirm - Set a new password with a reset code
//! - GET  /accounts/me                - Current account from token

use hyper::body::Body;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use tracing::info;

use super::{authenticate, caller_session, json_response, parse_json_body, BoxBody};
use crate::db::schemas::{ProfileFields, Role, SignInMethod};
use crate::server::AppState;
use crate::services::OpContext;
use crate::types::Result;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub role: Role,
    #[serde(default)]
    pub profile: ProfileFields,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FederatedCompleteRequest {
    /// Account id the client believes it signed in as; defaults to the token's
    #[serde(default)]
    pub account_id: Option<String>,
    pub email: String,
    pub role: Role,
    #[serde(default)]
    pub profile: ProfileFields,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordResetConfirmRequest {
    pub code: String,
    pub new_password: String,
}

/// POST /accounts/signup
pub async fn handle_signup<B>(state: &AppState, ctx: &OpContext, req: Request<B>) -> Result<Response<BoxBody>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let body: SignupRequest = parse_json_body(req).await?;
    let signed_up = state
        .engine
        .accounts
        .signup_direct(ctx, &body.email, &body.password, body.role, body.profile)
        .await?;

    Ok(json_response(StatusCode::CREATED, &signed_up))
}

/// POST /accounts/login
pub async fn handle_login<B>(state: &AppState, ctx: &OpContext, req: Request<B>) -> Result<Response<BoxBody>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let body: LoginRequest = parse_json_body(req).await?;
    let signed_in = state
        .engine
        .accounts
        .sign_in(ctx, &body.email, &body.password, body.role)
        .await?;

    Ok(json_response(StatusCode::OK, &signed_in))
}

/// POST /accounts/federated/complete
///
/// The bearer token is the federated provider session; no account exists yet.
pub async fn handle_federated_complete<B>(
    state: &AppState,
    ctx: &OpContext,
    req: Request<B>,
) -> Result<Response<BoxBody>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let session = caller_session(state, ctx, req.headers(), SignInMethod::Federated).await?;
    let body: FederatedCompleteRequest = parse_json_body(req).await?;
    let session_account_id = body
        .account_id
        .unwrap_or_else(|| session.account_id.clone());

    let signed_up = state
        .engine
        .accounts
        .complete_federated_signup(
            ctx,
            &session,
            &session_account_id,
            &body.email,
            body.role,
            body.profile,
        )
        .await?;

    Ok(json_response(StatusCode::CREATED, &signed_up))
}

/// POST /accounts/verify-email
///
/// The code from the verification email is the only proof accepted; a bearer
/// token is neither needed nor sufficient.
pub async fn handle_verify_email<B>(
    state: &AppState,
    ctx: &OpContext,
    req: Request<B>,
) -> Result<Response<BoxBody>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let body: VerifyEmailRequest = parse_json_body(req).await?;
    let account = state
        .engine
        .accounts
        .confirm_email_verified(ctx, &body.code)
        .await?;

    info!(account_id = %account.id, "Email verification confirmed over HTTP");
    Ok(json_response(StatusCode::OK, &account))
}

/// POST /accounts/verify-email/resend
pub async fn handle_resend_verification<B>(
    state: &AppState,
    ctx: &OpContext,
    req: Request<B>,
) -> Result<Response<BoxBody>> {
    let caller = authenticate(state, ctx, req.headers()).await?;
    let sent = state
        .engine
        .accounts
        .resend_verification(ctx, &caller.account.id)
        .await?;

    Ok(json_response(StatusCode::ACCEPTED, &serde_json::json!({ "sent": sent })))
}

/// POST /accounts/password-reset
///
/// Always 202, whether or not the address has a password identity.
pub async fn handle_password_reset<B>(
    state: &AppState,
    ctx: &OpContext,
    req: Request<B>,
) -> Result<Response<BoxBody>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let body: PasswordResetRequest = parse_json_body(req).await?;
    state
        .engine
        .accounts
        .request_password_reset(ctx, &body.email)
        .await?;

    Ok(json_response(StatusCode::ACCEPTED, &serde_json::json!({ "status": "sent" })))
}

/// POST /accounts/password-reset/confirm
pub async fn handle_password_reset_confirm<B>(
    state: &AppState,
    ctx: &OpContext,
    req: Request<B>,
) -> Result<Response<BoxBody>>
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let body: PasswordResetConfirmRequest = parse_json_body(req).await?;
    state
        .engine
        .accounts
        .confirm_password_reset(ctx, &body.code, &body.new_password)
        .await?;

    Ok(json_response(StatusCode::OK, &serde_json::json!({ "status": "updated" })))
}

/// GET /accounts/me
pub async fn handle_me<B>(state: &AppState, ctx: &OpContext, req: Request<B>) -> Result<Response<BoxBody>> {
    let caller = authenticate(state, ctx, req.headers()).await?;
    Ok(json_response(StatusCode::OK, &caller.account))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::StagedIdentity;
    use crate::routes::test_support::{json, request, state};
    use hyper::Method;
    use serde_json::json;

    #[tokio::test]
    async fn test_signup_then_me() {
        let (state, gateway) = state();
        let ctx = OpContext::new();

        let response = handle_signup(
            &state,
            &ctx,
            request(
                Method::POST,
                "/accounts/signup",
                None,
                json!({
                    "email": "Pat@Example.com",
                    "password": "hunter22",
                    "role": "dependent",
                    "profile": { "name": "Pat" }
                }),
            ),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json(response).await;
        let token = body["session"]["token"].as_str().unwrap().to_string();
        assert_eq!(body["account"]["normalized_email"], "pat@example.com");
        assert_eq!(body["account"]["status"], "pending_verification");

        let me = handle_me(&state, &ctx, request(Method::GET, "/accounts/me", Some(&token), json!(null)))
            .await
            .unwrap();
        assert_eq!(json(me).await["role"], "dependent");

        // A bearer token alone does not verify the address
        let err = handle_verify_email(
            &state,
            &ctx,
            request(
                Method::POST,
                "/accounts/verify-email",
                Some(&token),
                json!({ "code": token }),
            ),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

        let resent = handle_resend_verification(
            &state,
            &ctx,
            request(Method::POST, "/accounts/verify-email/resend", Some(&token), json!(null)),
        )
        .await
        .unwrap();
        assert_eq!(resent.status(), StatusCode::ACCEPTED);
        assert_eq!(json(resent).await["sent"], true);

        let account_id = body["account"]["id"].as_str().unwrap();
        let code = {
            use crate::gateway::CredentialGateway;
            gateway
                .issue_verification_code(account_id, "Pat@Example.com")
                .await
                .unwrap()
        };
        let verified = handle_verify_email(
            &state,
            &ctx,
            request(Method::POST, "/accounts/verify-email", None, json!({ "code": code })),
        )
        .await
        .unwrap();
        assert_eq!(json(verified).await["status"], "active");
    }

    #[tokio::test]
    async fn test_password_reset_is_silent_about_unknown_addresses() {
        let (state, _) = state();
        let ctx = OpContext::new();

        let response = handle_password_reset(
            &state,
            &ctx,
            request(
                Method::POST,
                "/accounts/password-reset",
                None,
                json!({ "email": "nobody@example.com" }),
            ),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let err = handle_password_reset_confirm(
            &state,
            &ctx,
            request(
                Method::POST,
                "/accounts/password-reset/confirm",
                None,
                json!({ "code": "not-a-code", "newPassword": "hunter23" }),
            ),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_ACTION_CODE");
    }

    #[tokio::test]
    async fn test_federated_completion_over_http() {
        let (state, gateway) = state();
        let ctx = OpContext::new();
        gateway
            .stage_federated(StagedIdentity::new("fed@example.com", Some("Fed".into())))
            .unwrap();

        let session = gateway_session(&gateway).await;
        let response = handle_federated_complete(
            &state,
            &ctx,
            request(
                Method::POST,
                "/accounts/federated/complete",
                Some(&session.token),
                json!({
                    "email": "fed@example.com",
                    "role": "dependent",
                    "profile": { "name": "Fed" }
                }),
            ),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json(response).await["account"]["sign_in_method"], "federated");
    }

    async fn gateway_session(
        gateway: &crate::gateway::LocalCredentialGateway,
    ) -> crate::gateway::ProviderSession {
        use crate::gateway::CredentialGateway;
        gateway.begin_federated_sign_in().await.unwrap()
    }

    #[tokio::test]
    async fn test_login_with_wrong_portal_is_rejected() {
        let (state, _) = state();
        let ctx = OpContext::new();
        state
            .engine
            .accounts
            .signup_direct(
                &ctx,
                "dep@example.com",
                "hunter22",
                Role::Dependent,
                ProfileFields {
                    name: Some("Dee".into()),
                    ..ProfileFields::default()
                },
            )
            .await
            .unwrap();

        let err = handle_login(
            &state,
            &ctx,
            request(
                Method::POST,
                "/accounts/login",
                None,
                json!({ "email": "dep@example.com", "password": "hunter22", "role": "manager" }),
            ),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);
    }
}
