use axum::{extract::State, Json};

use crate::{auth::AuthUser, error::Result, models::user::MeResponse, orgs::Authority};

pub async fn me(State(authority): State<Authority>, auth: AuthUser) -> Result<Json<MeResponse>> {
    let active_organization = authority
        .active_organization(&auth.session, &auth.user)
        .await?;

    Ok(Json(MeResponse {
        user: auth.user,
        active_organization,
    }))
}
