pub mod auth;
pub mod invitations;
pub mod members;
pub mod organizations;

use axum::{Router, routing::{get, post, put, delete}};
use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        // Identity
        .route("/api/auth/me", get(auth::me))
        // Organizations
        .route("/api/organizations", get(organizations::list).post(organizations::create))
        .route(
            "/api/organizations/active",
            get(organizations::get_active).put(organizations::set_active),
        )
        .route("/api/organizations/slug/:slug", get(organizations::get_by_slug))
        .route(
            "/api/organizations/:id",
            get(organizations::get).put(organizations::update).delete(organizations::delete),
        )
        // Members
        .route("/api/organizations/:id/members", get(members::list))
        .route(
            "/api/organizations/:id/members/:user_id",
            put(members::update_role).delete(members::remove),
        )
        .route("/api/organizations/:id/leave", post(members::leave))
        // Invitations
        .route(
            "/api/organizations/:id/invitations",
            get(invitations::list_for_org).post(invitations::create),
        )
        .route("/api/organizations/:id/invitations/:invitation_id", delete(invitations::cancel))
        .route("/api/invitations", get(invitations::list_mine))
        .route("/api/invitations/:token/accept", post(invitations::accept))
        .route("/api/invitations/:token/decline", post(invitations::decline))
        .with_state(state)
}
