use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::Result,
    models::membership::{Member, Membership, UpdateMemberRoleRequest},
    orgs::Authority,
};

pub async fn list(
    State(authority): State<Authority>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
) -> Result<Json<Vec<Member>>> {
    let members = authority.list_members(org_id, &auth.user).await?;
    Ok(Json(members))
}

pub async fn update_role(
    State(authority): State<Authority>,
    auth: AuthUser,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateMemberRoleRequest>,
) -> Result<Json<Membership>> {
    let membership = authority
        .update_role(org_id, user_id, req.role, &auth.user)
        .await?;
    Ok(Json(membership))
}

pub async fn remove(
    State(authority): State<Authority>,
    auth: AuthUser,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Membership>> {
    let removed = authority.remove_member(org_id, user_id, &auth.user).await?;
    Ok(Json(removed))
}

pub async fn leave(
    State(authority): State<Authority>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
) -> Result<Json<Membership>> {
    let left = authority.leave(org_id, &auth.user).await?;
    Ok(Json(left))
}
