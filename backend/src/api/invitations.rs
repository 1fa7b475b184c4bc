use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthUser,
    error::Result,
    models::invitation::{
        CreateInvitationRequest, Invitation, InvitationAcceptance, InvitationWithDetails,
    },
    orgs::Authority,
};

pub async fn list_for_org(
    State(authority): State<Authority>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
) -> Result<Json<Vec<Invitation>>> {
    let invitations = authority.list_org_invitations(org_id, &auth.user).await?;
    Ok(Json(invitations))
}

pub async fn create(
    State(authority): State<Authority>,
    auth: AuthUser,
    Path(org_id): Path<Uuid>,
    Json(req): Json<CreateInvitationRequest>,
) -> Result<Json<Invitation>> {
    req.validate()?;

    let invitation = authority
        .create_invitation(org_id, &req.email, req.role, &auth.user)
        .await?;
    Ok(Json(invitation))
}

pub async fn cancel(
    State(authority): State<Authority>,
    auth: AuthUser,
    Path((org_id, invitation_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Invitation>> {
    let invitation = authority
        .cancel_invitation(org_id, invitation_id, &auth.user)
        .await?;
    Ok(Json(invitation))
}

pub async fn list_mine(
    State(authority): State<Authority>,
    auth: AuthUser,
) -> Result<Json<Vec<InvitationWithDetails>>> {
    let invitations = authority.list_my_invitations(&auth.user).await?;
    Ok(Json(invitations))
}

pub async fn accept(
    State(authority): State<Authority>,
    auth: AuthUser,
    Path(token): Path<String>,
) -> Result<Json<InvitationAcceptance>> {
    let acceptance = authority.accept_invitation(&token, &auth.user).await?;
    Ok(Json(acceptance))
}

pub async fn decline(
    State(authority): State<Authority>,
    auth: AuthUser,
    Path(token): Path<String>,
) -> Result<Json<Invitation>> {
    let invitation = authority.decline_invitation(&token, &auth.user).await?;
    Ok(Json(invitation))
}
