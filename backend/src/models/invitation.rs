use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use validator::Validate;

use super::membership::Role;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "invitation_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
}

impl InvitationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, InvitationStatus::Pending)
    }

    /// Status moves only out of `pending`; terminal states are never left.
    pub fn can_transition_to(self, next: InvitationStatus) -> bool {
        self == InvitationStatus::Pending && next.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Invitation {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub email: String,
    pub role: Role,
    /// Only ever handed to the invitee (see [`InvitationWithDetails`]).
    #[serde(skip_serializing)]
    pub token: String,
    pub invited_by: Uuid,
    pub status: InvitationStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Invitation {
    pub fn is_past_expiry(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }
}

/// An invitation addressed to the caller, with enough context to render it
/// and the token needed to answer it.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct InvitationWithDetails {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub invitation: Invitation,
    pub token: String,
    pub organization_name: String,
    pub invited_by_name: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateInvitationRequest {
    #[validate(email(message = "email must be a valid address"))]
    pub email: String,
    pub role: Role,
}

/// Result of a successful acceptance.
#[derive(Debug, Clone, Serialize)]
pub struct InvitationAcceptance {
    pub invitation: Invitation,
    pub membership: super::membership::Membership,
}
