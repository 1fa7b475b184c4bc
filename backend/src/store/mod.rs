//! Storage for organizations, memberships and invitations.
//!
//! The authority never talks to a database directly. Every operation opens a
//! [`StoreTx`], takes the locks it needs, reads, checks, writes and commits.
//! Dropping a transaction without calling [`StoreTx::commit`] discards all of
//! its writes.
//!
//! Lock order is always organization first, then invitation.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    invitation::{Invitation, InvitationStatus, InvitationWithDetails},
    membership::{Member, Membership, Role},
    organization::{Organization, OrganizationWithRole},
    user::User,
};

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;

    async fn find_user(&self, id: Uuid) -> Result<Option<User>>;

    /// Register or refresh a user record on behalf of the identity provider.
    async fn upsert_user(&self, user: &User) -> Result<()>;
}

#[async_trait]
pub trait StoreTx: Send {
    async fn commit(&mut self) -> Result<()>;

    // === Users ===

    async fn find_user(&mut self, id: Uuid) -> Result<Option<User>>;

    // === Organizations ===

    async fn find_organization(&mut self, id: Uuid) -> Result<Option<Organization>>;

    async fn find_organization_by_slug(&mut self, slug: &str) -> Result<Option<Organization>>;

    /// Fetch the organization and hold its lock until the transaction ends.
    /// Every membership or invitation mutation takes this lock first.
    async fn lock_organization(&mut self, id: Uuid) -> Result<Option<Organization>>;

    async fn slug_taken(&mut self, slug: &str) -> Result<bool>;

    async fn insert_organization(&mut self, org: &Organization) -> Result<()>;

    async fn rename_organization(
        &mut self,
        id: Uuid,
        name: &str,
        now: OffsetDateTime,
    ) -> Result<Organization>;

    /// Remove the organization together with its memberships and invitations.
    async fn delete_organization(&mut self, id: Uuid) -> Result<()>;

    /// Ordered by organization name, then id.
    async fn organizations_for_user(&mut self, user_id: Uuid) -> Result<Vec<OrganizationWithRole>>;

    // === Memberships ===

    async fn find_membership(&mut self, org_id: Uuid, user_id: Uuid) -> Result<Option<Membership>>;

    /// The user's earliest-created membership, with its organization.
    async fn first_membership_for_user(
        &mut self,
        user_id: Uuid,
    ) -> Result<Option<OrganizationWithRole>>;

    async fn insert_membership(&mut self, membership: &Membership) -> Result<()>;

    async fn set_membership_role(
        &mut self,
        org_id: Uuid,
        user_id: Uuid,
        role: Role,
        now: OffsetDateTime,
    ) -> Result<Membership>;

    async fn delete_membership(&mut self, org_id: Uuid, user_id: Uuid) -> Result<()>;

    async fn count_owners(&mut self, org_id: Uuid) -> Result<i64>;

    /// Ordered owner, admin, member, then by name.
    async fn list_members(&mut self, org_id: Uuid) -> Result<Vec<Member>>;

    async fn is_member_email(&mut self, org_id: Uuid, email: &str) -> Result<bool>;

    // === Invitations ===

    async fn insert_invitation(&mut self, invitation: &Invitation) -> Result<()>;

    async fn find_invitation(&mut self, id: Uuid) -> Result<Option<Invitation>>;

    async fn find_invitation_by_token(&mut self, token: &str) -> Result<Option<Invitation>>;

    /// Re-read the invitation under its row lock. Callers hold the owning
    /// organization's lock already.
    async fn lock_invitation(&mut self, id: Uuid) -> Result<Option<Invitation>>;

    async fn find_pending_invitation(
        &mut self,
        org_id: Uuid,
        email: &str,
    ) -> Result<Option<Invitation>>;

    async fn set_invitation_status(
        &mut self,
        id: Uuid,
        status: InvitationStatus,
        now: OffsetDateTime,
    ) -> Result<Invitation>;

    async fn delete_invitation(&mut self, id: Uuid) -> Result<()>;

    /// Pending and not yet past expiry, newest first.
    async fn pending_invitations_for_org(
        &mut self,
        org_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Vec<Invitation>>;

    /// Pending and not yet past expiry, newest first.
    async fn pending_invitations_for_email(
        &mut self,
        email: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<InvitationWithDetails>>;

    /// Move pending invitations past their expiry to `expired`. Returns the count.
    async fn expire_lapsed_for_org(&mut self, org_id: Uuid, now: OffsetDateTime) -> Result<u64>;

    /// Move pending invitations past their expiry to `expired`. Returns the count.
    async fn expire_lapsed_for_email(&mut self, email: &str, now: OffsetDateTime) -> Result<u64>;
}
