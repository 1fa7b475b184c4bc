use axum::{
    extract::{Path, State},
    Json,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthUser,
    error::Result,
    models::{
        common::ActiveOrganizationResponse,
        membership::Role,
        organization::{
            CreateOrganizationRequest, Organization, OrganizationWithRole,
            SetActiveOrganizationRequest, UpdateOrganizationRequest,
        },
    },
    orgs::Authority,
};

pub async fn list(
    State(authority): State<Authority>,
    auth: AuthUser,
) -> Result<Json<Vec<OrganizationWithRole>>> {
    let orgs = authority.list_for_user(auth.user.id).await?;
    Ok(Json(orgs))
}

pub async fn create(
    State(authority): State<Authority>,
    auth: AuthUser,
    Json(req): Json<CreateOrganizationRequest>,
) -> Result<Json<OrganizationWithRole>> {
    req.validate()?;

    let organization = authority.create_organization(&req.name, &auth.user).await?;

    Ok(Json(OrganizationWithRole {
        organization,
        role: Role::Owner,
    }))
}

pub async fn get(
    State(authority): State<Authority>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<OrganizationWithRole>> {
    let org = authority.get_organization(id, &auth.user).await?;
    Ok(Json(org))
}

pub async fn get_by_slug(
    State(authority): State<Authority>,
    auth: AuthUser,
    Path(slug): Path<String>,
) -> Result<Json<OrganizationWithRole>> {
    let org = authority.get_organization_by_slug(&slug, &auth.user).await?;
    Ok(Json(org))
}

pub async fn update(
    State(authority): State<Authority>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateOrganizationRequest>,
) -> Result<Json<Organization>> {
    req.validate()?;

    let org = authority.rename_organization(id, &req.name, &auth.user).await?;
    Ok(Json(org))
}

pub async fn delete(
    State(authority): State<Authority>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Organization>> {
    let org = authority.delete_organization(id, &auth.user).await?;
    Ok(Json(org))
}

pub async fn get_active(
    State(authority): State<Authority>,
    auth: AuthUser,
) -> Result<Json<ActiveOrganizationResponse<OrganizationWithRole>>> {
    let organization = authority
        .active_organization(&auth.session, &auth.user)
        .await?;
    Ok(Json(ActiveOrganizationResponse { organization }))
}

pub async fn set_active(
    State(authority): State<Authority>,
    auth: AuthUser,
    Json(req): Json<SetActiveOrganizationRequest>,
) -> Result<Json<OrganizationWithRole>> {
    let org = authority
        .set_active_organization(&auth.session, req.organization_id, &auth.user)
        .await?;
    Ok(Json(org))
}
