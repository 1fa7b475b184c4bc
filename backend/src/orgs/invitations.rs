use rand_core::{OsRng, RngCore};
use time::OffsetDateTime;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::ValidateEmail;

use super::policy::{self, Action};
use super::{caller_role, Authority};
use crate::error::{AppError, Result};
use crate::models::{
    invitation::{Invitation, InvitationAcceptance, InvitationStatus, InvitationWithDetails},
    membership::{Membership, Role},
    user::{normalize_email, User},
};
use crate::retry::with_backoff;
use crate::store::StoreTx;

const TOKEN_BYTES: usize = 32;

/// 256 bits from the OS RNG, hex encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Resolve `token` to a pending invitation addressed to `caller`, holding the
/// organization and invitation locks.
///
/// An invitation found pending but past its expiry is moved to `expired` and
/// that transition is committed before `Expired` is returned.
async fn lock_answerable(
    tx: &mut dyn StoreTx,
    token: &str,
    caller: &User,
    now: OffsetDateTime,
) -> Result<Invitation> {
    let found = tx
        .find_invitation_by_token(token)
        .await?
        .ok_or_else(|| AppError::not_found("Invitation not found"))?;
    tx.lock_organization(found.organization_id)
        .await?
        .ok_or_else(|| AppError::not_found("Invitation not found"))?;
    let invitation = tx
        .lock_invitation(found.id)
        .await?
        .ok_or_else(|| AppError::not_found("Invitation not found"))?;

    match invitation.status {
        InvitationStatus::Pending if invitation.is_past_expiry(now) => {
            tx.set_invitation_status(invitation.id, InvitationStatus::Expired, now)
                .await?;
            tx.commit().await?;
            info!(invitation_id = %invitation.id, "Invitation expired");
            return Err(AppError::Expired);
        }
        InvitationStatus::Pending => {}
        InvitationStatus::Expired => return Err(AppError::Expired),
        InvitationStatus::Accepted => {
            return Err(AppError::InvalidState("Invitation has already been accepted".into()));
        }
        InvitationStatus::Declined => {
            return Err(AppError::InvalidState("Invitation has already been declined".into()));
        }
    }

    if !caller.has_email(&invitation.email) {
        return Err(AppError::EmailMismatch);
    }
    Ok(invitation)
}

impl Authority {
    /// Invite `email` into the organization at `role`.
    #[instrument(skip(self, email, caller), fields(user_id = %caller.id))]
    pub async fn create_invitation(
        &self,
        org_id: Uuid,
        email: &str,
        role: Role,
        caller: &User,
    ) -> Result<Invitation> {
        let email = normalize_email(email);
        if !email.validate_email() {
            return Err(AppError::BadRequest("A valid email address is required".into()));
        }
        policy::check_invitation_role(role)?;
        let email = email.as_str();
        let ttl = self.settings.invitation_ttl;

        let retry = &self.settings.retry;
        let invitation = with_backoff(retry, "invitations.create", move || async move {
            let mut tx = self.store.begin().await?;
            tx.lock_organization(org_id)
                .await?
                .ok_or_else(|| AppError::not_found("Organization not found"))?;
            let actor = caller_role(tx.as_mut(), org_id, caller.id).await?;
            policy::authorize(actor, Action::ManageInvitations)?;

            if tx.is_member_email(org_id, email).await? {
                return Err(AppError::Conflict(
                    "That user is already a member of this organization".into(),
                ));
            }

            let now = self.clock.now();
            let expires_at = now.checked_add(ttl).ok_or_else(|| {
                AppError::Internal(anyhow::anyhow!("invitation expiry out of range"))
            })?;
            // a lapsed invitation must not block a fresh one
            tx.expire_lapsed_for_org(org_id, now).await?;
            if tx.find_pending_invitation(org_id, email).await?.is_some() {
                return Err(AppError::Conflict(
                    "A pending invitation already exists for that email".into(),
                ));
            }

            let invitation = Invitation {
                id: Uuid::new_v4(),
                organization_id: org_id,
                email: email.to_string(),
                role,
                token: generate_token(),
                invited_by: caller.id,
                status: InvitationStatus::Pending,
                expires_at,
                created_at: now,
                updated_at: now,
            };
            tx.insert_invitation(&invitation).await?;
            tx.commit().await?;
            Ok(invitation)
        })
        .await?;

        info!(
            org_id = %org_id,
            invitation_id = %invitation.id,
            role = %invitation.role,
            "Invitation created"
        );
        Ok(invitation)
    }

    /// Withdraw a pending invitation. Returns the removed record.
    #[instrument(skip(self, caller), fields(user_id = %caller.id))]
    pub async fn cancel_invitation(
        &self,
        org_id: Uuid,
        invitation_id: Uuid,
        caller: &User,
    ) -> Result<Invitation> {
        let retry = &self.settings.retry;
        let invitation = with_backoff(retry, "invitations.cancel", move || async move {
            let mut tx = self.store.begin().await?;
            tx.lock_organization(org_id)
                .await?
                .ok_or_else(|| AppError::not_found("Organization not found"))?;
            let actor = caller_role(tx.as_mut(), org_id, caller.id).await?;
            policy::authorize(actor, Action::ManageInvitations)?;

            let invitation = tx
                .lock_invitation(invitation_id)
                .await?
                .filter(|i| i.organization_id == org_id)
                .ok_or_else(|| AppError::not_found("Invitation not found"))?;
            if invitation.status != InvitationStatus::Pending {
                return Err(AppError::InvalidState(
                    "Only pending invitations can be cancelled".into(),
                ));
            }

            tx.delete_invitation(invitation.id).await?;
            tx.commit().await?;
            Ok(invitation)
        })
        .await?;

        info!(org_id = %org_id, invitation_id = %invitation.id, "Invitation cancelled");
        Ok(invitation)
    }

    /// Accept an invitation, joining its organization.
    ///
    /// A caller who already belongs to the organization keeps their role
    /// unless the invitation grants a higher one.
    #[instrument(skip(self, token, caller), fields(user_id = %caller.id))]
    pub async fn accept_invitation(
        &self,
        token: &str,
        caller: &User,
    ) -> Result<InvitationAcceptance> {
        let retry = &self.settings.retry;
        let acceptance = with_backoff(retry, "invitations.accept", move || async move {
            let mut tx = self.store.begin().await?;
            let now = self.clock.now();
            let invitation = lock_answerable(tx.as_mut(), token, caller, now).await?;
            let org_id = invitation.organization_id;

            let membership = match tx.find_membership(org_id, caller.id).await? {
                Some(existing) if invitation.role.outranks(existing.role) => {
                    tx.set_membership_role(org_id, caller.id, invitation.role, now)
                        .await?
                }
                Some(existing) => existing,
                None => {
                    let membership = Membership {
                        id: Uuid::new_v4(),
                        organization_id: org_id,
                        user_id: caller.id,
                        role: invitation.role,
                        created_at: now,
                        updated_at: now,
                    };
                    tx.insert_membership(&membership).await?;
                    membership
                }
            };

            let invitation = tx
                .set_invitation_status(invitation.id, InvitationStatus::Accepted, now)
                .await?;
            tx.commit().await?;
            Ok(InvitationAcceptance {
                invitation,
                membership,
            })
        })
        .await?;

        info!(
            org_id = %acceptance.membership.organization_id,
            invitation_id = %acceptance.invitation.id,
            role = %acceptance.membership.role,
            "Invitation accepted"
        );
        Ok(acceptance)
    }

    #[instrument(skip(self, token, caller), fields(user_id = %caller.id))]
    pub async fn decline_invitation(&self, token: &str, caller: &User) -> Result<Invitation> {
        let retry = &self.settings.retry;
        let invitation = with_backoff(retry, "invitations.decline", move || async move {
            let mut tx = self.store.begin().await?;
            let now = self.clock.now();
            let invitation = lock_answerable(tx.as_mut(), token, caller, now).await?;
            let invitation = tx
                .set_invitation_status(invitation.id, InvitationStatus::Declined, now)
                .await?;
            tx.commit().await?;
            Ok(invitation)
        })
        .await?;

        info!(invitation_id = %invitation.id, "Invitation declined");
        Ok(invitation)
    }

    /// Pending invitations addressed to the caller, newest first.
    pub async fn list_my_invitations(&self, caller: &User) -> Result<Vec<InvitationWithDetails>> {
        let email = normalize_email(&caller.email);
        let email = email.as_str();

        with_backoff(&self.settings.retry, "invitations.list_mine", move || async move {
            let mut tx = self.store.begin().await?;
            let now = self.clock.now();
            let expired = tx.expire_lapsed_for_email(email, now).await?;
            let pending = tx.pending_invitations_for_email(email, now).await?;
            tx.commit().await?;
            if expired > 0 {
                info!(count = expired, "Expired lapsed invitations");
            }
            Ok(pending)
        })
        .await
    }

    /// Pending invitations of an organization. Callers who may not manage
    /// invitations, including non-members, get an empty list.
    pub async fn list_org_invitations(
        &self,
        org_id: Uuid,
        caller: &User,
    ) -> Result<Vec<Invitation>> {
        with_backoff(&self.settings.retry, "invitations.list_org", move || async move {
            let mut tx = self.store.begin().await?;
            if tx.lock_organization(org_id).await?.is_none() {
                return Ok(Vec::new());
            }
            let actor = caller_role(tx.as_mut(), org_id, caller.id).await?;
            if policy::authorize(actor, Action::ManageInvitations).is_err() {
                return Ok(Vec::new());
            }

            let now = self.clock.now();
            tx.expire_lapsed_for_org(org_id, now).await?;
            let pending = tx.pending_invitations_for_org(org_id, now).await?;
            tx.commit().await?;
            Ok(pending)
        })
        .await
    }
}
