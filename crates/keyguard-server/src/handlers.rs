use axum::{response::IntoResponse, Extension, Json};
use serde_json::json;

use crate::auth::AuthorizedKey;

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Whoami ────────────────────────────────────────────────────────────────────

/// Reports which key the guard authorized this request under.
pub async fn whoami(Extension(key): Extension<AuthorizedKey>) -> impl IntoResponse {
    Json(json!({"key_id": key.id}))
}
