use serde::Serialize;

/// Body of `GET /api/organizations/active`; `organization` is null when the
/// caller belongs to no organization.
#[derive(Debug, Serialize)]
pub struct ActiveOrganizationResponse<T: Serialize> {
    pub organization: Option<T>,
}
