use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::policy::{self, ForwardedRequest};
use crate::AppState;

/// Identity of the key a request was authorized under, available to
/// handlers as `Extension<AuthorizedKey>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    pub id: String,
}

/// Axum middleware that resolves the presented API key and checks the
/// request's forwarded host, real IP and the key's expiry against its policy.
///
/// Unknown or missing credentials get 401; policy denials get 403 with the
/// denial code as the error.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(record) = presented_credential(request.headers()).and_then(|c| state.keys.resolve(c))
    else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        )
            .into_response();
    };

    let forwarded = ForwardedRequest::from_headers(request.headers());
    if let Err(denial) = policy::validate(&record.policy, &forwarded, policy::unix_now()) {
        warn!(
            key_id = %record.id,
            reason = %denial,
            host = %forwarded.forwarded_host,
            port = %forwarded.forwarded_port,
            real_ip = %forwarded.real_ip,
            "api key denied"
        );
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": denial.code()})),
        )
            .into_response();
    }

    debug!(key_id = %record.id, "api key authorized");
    request.extensions_mut().insert(AuthorizedKey {
        id: record.id.clone(),
    });
    next.run(request).await
}

/// `Authorization: Bearer <key>` first, then `X-Api-Key`.
fn presented_credential(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    bearer
        .or_else(|| {
            headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        })
        .filter(|c| !c.is_empty())
}
