pub mod auth;
pub mod handlers;
pub mod keys;
pub mod policy;
pub mod server;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Issued keys, looked up by presented credential.
    pub keys: keys::KeyStore,
}

pub use policy::{validate, ApiKeyPolicy, Denial, ForwardedRequest};
pub use server::{router, run, ServerConfig};
