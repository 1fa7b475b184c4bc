use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Store, StoreTx};
use crate::error::{AppError, Result};
use crate::models::{
    invitation::{Invitation, InvitationStatus, InvitationWithDetails},
    membership::{Member, Membership, Role},
    organization::{Organization, OrganizationWithRole},
    user::{normalize_email, User},
};

#[derive(Debug, Clone, Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    organizations: HashMap<Uuid, Organization>,
    memberships: HashMap<(Uuid, Uuid), Membership>,
    invitations: HashMap<Uuid, Invitation>,
}

/// In-process store for tests and local development.
///
/// A transaction holds the single table lock for its whole lifetime and works
/// on a staged copy, so transactions are fully serialized and an uncommitted
/// one leaves no trace. Cloning shares the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx {
            guard: Some(guard),
            staged,
        }))
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.tables.lock().await.users.get(&id).cloned())
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let email_taken = tables
            .users
            .values()
            .any(|u| u.id != user.id && u.email == user.email);
        if email_taken {
            return Err(AppError::Conflict(format!("Email {} already registered", user.email)));
        }
        tables.users.insert(user.id, user.clone());
        Ok(())
    }
}

pub struct MemoryTx {
    guard: Option<OwnedMutexGuard<Tables>>,
    staged: Tables,
}

impl MemoryTx {
    fn org_with_role(&self, m: &Membership) -> Option<OrganizationWithRole> {
        self.staged
            .organizations
            .get(&m.organization_id)
            .map(|org| OrganizationWithRole {
                organization: org.clone(),
                role: m.role,
            })
    }
}

fn newest_first(a: &Invitation, b: &Invitation) -> std::cmp::Ordering {
    b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id))
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn commit(&mut self) -> Result<()> {
        let mut guard = self
            .guard
            .take()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("transaction already finished")))?;
        *guard = std::mem::take(&mut self.staged);
        Ok(())
    }

    async fn find_user(&mut self, id: Uuid) -> Result<Option<User>> {
        Ok(self.staged.users.get(&id).cloned())
    }

    async fn find_organization(&mut self, id: Uuid) -> Result<Option<Organization>> {
        Ok(self.staged.organizations.get(&id).cloned())
    }

    async fn find_organization_by_slug(&mut self, slug: &str) -> Result<Option<Organization>> {
        Ok(self
            .staged
            .organizations
            .values()
            .find(|o| o.slug == slug)
            .cloned())
    }

    async fn lock_organization(&mut self, id: Uuid) -> Result<Option<Organization>> {
        // The whole store is already held by this transaction.
        self.find_organization(id).await
    }

    async fn slug_taken(&mut self, slug: &str) -> Result<bool> {
        Ok(self.staged.organizations.values().any(|o| o.slug == slug))
    }

    async fn insert_organization(&mut self, org: &Organization) -> Result<()> {
        if self.slug_taken(&org.slug).await? || self.staged.organizations.contains_key(&org.id) {
            return Err(AppError::Conflict(format!("Slug {} already taken", org.slug)));
        }
        self.staged.organizations.insert(org.id, org.clone());
        Ok(())
    }

    async fn rename_organization(
        &mut self,
        id: Uuid,
        name: &str,
        now: OffsetDateTime,
    ) -> Result<Organization> {
        let org = self
            .staged
            .organizations
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("Organization not found"))?;
        org.name = name.to_string();
        org.updated_at = now;
        Ok(org.clone())
    }

    async fn delete_organization(&mut self, id: Uuid) -> Result<()> {
        if self.staged.organizations.remove(&id).is_none() {
            return Err(AppError::not_found("Organization not found"));
        }
        self.staged.memberships.retain(|(org_id, _), _| *org_id != id);
        self.staged.invitations.retain(|_, inv| inv.organization_id != id);
        Ok(())
    }

    async fn organizations_for_user(&mut self, user_id: Uuid) -> Result<Vec<OrganizationWithRole>> {
        let mut orgs: Vec<OrganizationWithRole> = self
            .staged
            .memberships
            .values()
            .filter(|m| m.user_id == user_id)
            .filter_map(|m| self.org_with_role(m))
            .collect();
        orgs.sort_by(|a, b| {
            a.organization
                .name
                .cmp(&b.organization.name)
                .then(a.organization.id.cmp(&b.organization.id))
        });
        Ok(orgs)
    }

    async fn find_membership(&mut self, org_id: Uuid, user_id: Uuid) -> Result<Option<Membership>> {
        Ok(self.staged.memberships.get(&(org_id, user_id)).cloned())
    }

    async fn first_membership_for_user(
        &mut self,
        user_id: Uuid,
    ) -> Result<Option<OrganizationWithRole>> {
        let first = self
            .staged
            .memberships
            .values()
            .filter(|m| m.user_id == user_id)
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(first.and_then(|m| self.org_with_role(m)))
    }

    async fn insert_membership(&mut self, membership: &Membership) -> Result<()> {
        let key = (membership.organization_id, membership.user_id);
        if self.staged.memberships.contains_key(&key) {
            return Err(AppError::Conflict("User is already a member".into()));
        }
        if !self
            .staged
            .organizations
            .contains_key(&membership.organization_id)
        {
            return Err(AppError::not_found("Organization not found"));
        }
        self.staged.memberships.insert(key, membership.clone());
        Ok(())
    }

    async fn set_membership_role(
        &mut self,
        org_id: Uuid,
        user_id: Uuid,
        role: Role,
        now: OffsetDateTime,
    ) -> Result<Membership> {
        let m = self
            .staged
            .memberships
            .get_mut(&(org_id, user_id))
            .ok_or_else(|| AppError::not_found("Member not found"))?;
        m.role = role;
        m.updated_at = now;
        Ok(m.clone())
    }

    async fn delete_membership(&mut self, org_id: Uuid, user_id: Uuid) -> Result<()> {
        self.staged
            .memberships
            .remove(&(org_id, user_id))
            .map(|_| ())
            .ok_or_else(|| AppError::not_found("Member not found"))
    }

    async fn count_owners(&mut self, org_id: Uuid) -> Result<i64> {
        Ok(self
            .staged
            .memberships
            .values()
            .filter(|m| m.organization_id == org_id && m.role.is_owner())
            .count() as i64)
    }

    async fn list_members(&mut self, org_id: Uuid) -> Result<Vec<Member>> {
        let mut members: Vec<Member> = self
            .staged
            .memberships
            .values()
            .filter(|m| m.organization_id == org_id)
            .filter_map(|m| {
                let user = self.staged.users.get(&m.user_id)?;
                Some(Member {
                    id: m.id,
                    organization_id: m.organization_id,
                    user_id: m.user_id,
                    role: m.role,
                    email: user.email.clone(),
                    name: user.name.clone(),
                    picture: user.picture.clone(),
                    created_at: m.created_at,
                    updated_at: m.updated_at,
                })
            })
            .collect();
        members.sort_by(|a, b| {
            b.role
                .rank()
                .cmp(&a.role.rank())
                .then_with(|| a.name.cmp(&b.name))
                .then(a.user_id.cmp(&b.user_id))
        });
        Ok(members)
    }

    async fn is_member_email(&mut self, org_id: Uuid, email: &str) -> Result<bool> {
        let email = normalize_email(email);
        Ok(self
            .staged
            .memberships
            .values()
            .filter(|m| m.organization_id == org_id)
            .filter_map(|m| self.staged.users.get(&m.user_id))
            .any(|u| normalize_email(&u.email) == email))
    }

    async fn insert_invitation(&mut self, invitation: &Invitation) -> Result<()> {
        let clash = self.staged.invitations.values().any(|i| {
            i.token == invitation.token
                || (i.organization_id == invitation.organization_id
                    && i.email == invitation.email
                    && i.status == InvitationStatus::Pending
                    && invitation.status == InvitationStatus::Pending)
        });
        if clash {
            return Err(AppError::Conflict(
                "A pending invitation already exists for this email".into(),
            ));
        }
        self.staged
            .invitations
            .insert(invitation.id, invitation.clone());
        Ok(())
    }

    async fn find_invitation(&mut self, id: Uuid) -> Result<Option<Invitation>> {
        Ok(self.staged.invitations.get(&id).cloned())
    }

    async fn find_invitation_by_token(&mut self, token: &str) -> Result<Option<Invitation>> {
        Ok(self
            .staged
            .invitations
            .values()
            .find(|i| i.token == token)
            .cloned())
    }

    async fn lock_invitation(&mut self, id: Uuid) -> Result<Option<Invitation>> {
        self.find_invitation(id).await
    }

    async fn find_pending_invitation(
        &mut self,
        org_id: Uuid,
        email: &str,
    ) -> Result<Option<Invitation>> {
        Ok(self
            .staged
            .invitations
            .values()
            .find(|i| {
                i.organization_id == org_id
                    && i.email == email
                    && i.status == InvitationStatus::Pending
            })
            .cloned())
    }

    async fn set_invitation_status(
        &mut self,
        id: Uuid,
        status: InvitationStatus,
        now: OffsetDateTime,
    ) -> Result<Invitation> {
        let inv = self
            .staged
            .invitations
            .get_mut(&id)
            .ok_or_else(|| AppError::not_found("Invitation not found"))?;
        if !inv.status.can_transition_to(status) {
            return Err(AppError::InvalidState(format!(
                "Invitation cannot move from {:?} to {:?}",
                inv.status, status
            )));
        }
        inv.status = status;
        inv.updated_at = now;
        Ok(inv.clone())
    }

    async fn delete_invitation(&mut self, id: Uuid) -> Result<()> {
        self.staged
            .invitations
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| AppError::not_found("Invitation not found"))
    }

    async fn pending_invitations_for_org(
        &mut self,
        org_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Vec<Invitation>> {
        let mut invs: Vec<Invitation> = self
            .staged
            .invitations
            .values()
            .filter(|i| {
                i.organization_id == org_id
                    && i.status == InvitationStatus::Pending
                    && !i.is_past_expiry(now)
            })
            .cloned()
            .collect();
        invs.sort_by(newest_first);
        Ok(invs)
    }

    async fn pending_invitations_for_email(
        &mut self,
        email: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<InvitationWithDetails>> {
        let mut invs: Vec<&Invitation> = self
            .staged
            .invitations
            .values()
            .filter(|i| {
                i.email == email && i.status == InvitationStatus::Pending && !i.is_past_expiry(now)
            })
            .collect();
        invs.sort_by(|a, b| newest_first(a, b));

        Ok(invs
            .into_iter()
            .filter_map(|i| {
                let org = self.staged.organizations.get(&i.organization_id)?;
                let inviter = self.staged.users.get(&i.invited_by)?;
                Some(InvitationWithDetails {
                    invitation: i.clone(),
                    token: i.token.clone(),
                    organization_name: org.name.clone(),
                    invited_by_name: inviter.name.clone(),
                })
            })
            .collect())
    }

    async fn expire_lapsed_for_org(&mut self, org_id: Uuid, now: OffsetDateTime) -> Result<u64> {
        let mut n = 0;
        for inv in self.staged.invitations.values_mut() {
            if inv.organization_id == org_id
                && inv.status == InvitationStatus::Pending
                && inv.is_past_expiry(now)
            {
                inv.status = InvitationStatus::Expired;
                inv.updated_at = now;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn expire_lapsed_for_email(&mut self, email: &str, now: OffsetDateTime) -> Result<u64> {
        let mut n = 0;
        for inv in self.staged.invitations.values_mut() {
            if inv.email == email
                && inv.status == InvitationStatus::Pending
                && inv.is_past_expiry(now)
            {
                inv.status = InvitationStatus::Expired;
                inv.updated_at = now;
                n += 1;
            }
        }
        Ok(n)
    }
}
