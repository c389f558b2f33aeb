// Bearer authentication for the reporting API. Token parsing and
// verification live in the gate so both surfaces accept the same credential.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::auth::gate::authenticate_bearer;
use crate::auth::jwt::JwtAccessTokenService;
use crate::error::{ErrorCode, RealtimeError};

/// Resolves the caller's `Identity` and stores it as a request extension.
pub async fn require_bearer_auth(
    State(jwt_service): State<Arc<JwtAccessTokenService>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate_bearer(&jwt_service, request.headers()) {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(error) => {
            RealtimeError::new(ErrorCode::AuthInvalidToken, error.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::require_bearer_auth;
    use crate::auth::jwt::{Identity, JwtAccessTokenService};
    use axum::{
        body::{to_bytes, Body},
        extract::Extension,
        http::{header::AUTHORIZATION, Request, StatusCode},
        middleware,
        response::Response,
        routing::get,
        Router,
    };
    use std::sync::Arc;
    use tower::ServiceExt;
    use uuid::Uuid;

    const TEST_SECRET: &str = "atelier_test_secret_that_is_definitely_long_enough";

    fn service() -> Arc<JwtAccessTokenService> {
        Arc::new(JwtAccessTokenService::new(TEST_SECRET).expect("service should initialize"))
    }

    fn whoami_app(jwt_service: Arc<JwtAccessTokenService>) -> Router {
        Router::new()
            .route(
                "/whoami",
                get(|Extension(identity): Extension<Identity>| async move {
                    format!("{}@{}", identity.user_id, identity.tenant_id)
                }),
            )
            .layer(middleware::from_fn_with_state(jwt_service, require_bearer_auth))
    }

    async fn call(app: Router, authorization: Option<String>) -> Response {
        let mut request = Request::builder().uri("/whoami");
        if let Some(value) = authorization {
            request = request.header(AUTHORIZATION, value);
        }
        app.oneshot(request.body(Body::empty()).expect("request should build"))
            .await
            .expect("request should return a response")
    }

    async fn error_message(response: Response) -> String {
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        let parsed: serde_json::Value = serde_json::from_slice(&body).expect("body is json");
        parsed["error"]["message"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn missing_header_is_unauthorized() {
        let response = call(whoami_app(service()), None).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_message(response).await, "missing access token");
    }

    #[tokio::test]
    async fn forged_token_is_unauthorized() {
        let response = call(whoami_app(service()), Some("Bearer forged".to_string())).await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_message(response).await, "invalid access token");
    }

    #[tokio::test]
    async fn valid_token_exposes_the_identity_to_handlers() {
        let service = service();
        let identity = Identity { user_id: Uuid::new_v4(), tenant_id: Uuid::new_v4() };
        let token = service.issue_token(identity).expect("token should be issued");

        let response = call(whoami_app(service), Some(format!("Bearer {token}"))).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body should read");
        assert_eq!(body, format!("{}@{}", identity.user_id, identity.tenant_id));
    }
}
