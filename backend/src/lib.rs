pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod orgs;
pub mod retry;
pub mod store;

use std::sync::Arc;

use orgs::Authority;
use store::Store;

/// Shared application state available to all handlers via axum's State extractor.
#[derive(Clone)]
pub struct AppState {
    pub authority: Authority,
    pub store: Arc<dyn Store>,
    pub jwt_secret: String,
}

impl axum::extract::FromRef<AppState> for Authority {
    fn from_ref(state: &AppState) -> Self {
        state.authority.clone()
    }
}
