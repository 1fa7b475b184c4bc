use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::policy::{self, Action};
use super::{caller_role, Authority};
use crate::error::{AppError, Result};
use crate::models::{
    membership::{Membership, Role},
    organization::{slug_candidate, slugify, Organization, OrganizationWithRole},
    user::User,
};
use crate::retry::with_backoff;
use crate::store::StoreTx;

const NAME_MAX_LEN: usize = 100;
/// Collision suffixes tried before giving up on a slug stem.
const SLUG_ATTEMPTS: u32 = 1000;
/// Whole-transaction re-runs when a concurrent create claims our slug first.
const SLUG_RACE_RETRIES: u32 = 3;

fn validate_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("Organization name is required".into()));
    }
    if name.chars().count() > NAME_MAX_LEN {
        return Err(AppError::BadRequest(format!(
            "Organization name must be at most {} characters",
            NAME_MAX_LEN
        )));
    }
    Ok(name)
}

impl Authority {
    /// Create an organization with `owner` as its sole owner.
    #[instrument(skip(self, owner), fields(user_id = %owner.id))]
    pub async fn create_organization(&self, name: &str, owner: &User) -> Result<Organization> {
        let name = validate_name(name)?;
        let stem = slugify(name);
        let stem = stem.as_str();

        let retry = &self.settings.retry;
        let mut race = 0;
        loop {
            let attempt = with_backoff(retry, "organization.create", move || async move {
                let mut tx = self.store.begin().await?;

                let mut slug = None;
                for n in 1..=SLUG_ATTEMPTS {
                    let candidate = slug_candidate(stem, n);
                    if !tx.slug_taken(&candidate).await? {
                        slug = Some(candidate);
                        break;
                    }
                }
                let slug = slug.ok_or_else(|| {
                    AppError::Conflict(format!("No free slug left for '{}'", stem))
                })?;

                let now = self.clock.now();
                let org = Organization {
                    id: Uuid::new_v4(),
                    name: name.to_string(),
                    slug,
                    created_at: now,
                    updated_at: now,
                };
                tx.insert_organization(&org).await?;
                tx.insert_membership(&Membership {
                    id: Uuid::new_v4(),
                    organization_id: org.id,
                    user_id: owner.id,
                    role: Role::Owner,
                    created_at: now,
                    updated_at: now,
                })
                .await?;
                tx.commit().await?;
                Ok(org)
            })
            .await;

            match attempt {
                Ok(org) => {
                    info!(org_id = %org.id, slug = %org.slug, "Organization created");
                    return Ok(org);
                }
                Err(e) if e.kind() == "conflict" && race < SLUG_RACE_RETRIES => {
                    race += 1;
                    warn!(attempt = race, "Slug claimed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[instrument(skip(self, caller), fields(user_id = %caller.id))]
    pub async fn rename_organization(
        &self,
        org_id: Uuid,
        name: &str,
        caller: &User,
    ) -> Result<Organization> {
        let name = validate_name(name)?;

        let org = with_backoff(&self.settings.retry, "organization.rename", move || async move {
            let mut tx = self.store.begin().await?;
            tx.lock_organization(org_id)
                .await?
                .ok_or_else(|| AppError::not_found("Organization not found"))?;
            let role = caller_role(tx.as_mut(), org_id, caller.id).await?;
            policy::authorize(role, Action::RenameOrganization)?;

            let org = tx.rename_organization(org_id, name, self.clock.now()).await?;
            tx.commit().await?;
            Ok(org)
        })
        .await?;

        info!(org_id = %org.id, "Organization renamed");
        Ok(org)
    }

    /// Delete an organization along with all of its memberships and invitations.
    #[instrument(skip(self, caller), fields(user_id = %caller.id))]
    pub async fn delete_organization(&self, org_id: Uuid, caller: &User) -> Result<Organization> {
        let org = with_backoff(&self.settings.retry, "organization.delete", move || async move {
            let mut tx = self.store.begin().await?;
            let org = tx
                .lock_organization(org_id)
                .await?
                .ok_or_else(|| AppError::not_found("Organization not found"))?;
            let role = caller_role(tx.as_mut(), org_id, caller.id).await?;
            policy::authorize(role, Action::DeleteOrganization)?;

            tx.delete_organization(org_id).await?;
            tx.commit().await?;
            Ok(org)
        })
        .await?;

        info!(org_id = %org.id, "Organization deleted");
        Ok(org)
    }

    /// Organizations the user belongs to, with their role in each.
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<OrganizationWithRole>> {
        with_backoff(&self.settings.retry, "organization.list", move || async move {
            let mut tx = self.store.begin().await?;
            tx.organizations_for_user(user_id).await
        })
        .await
    }

    pub async fn get_organization(
        &self,
        org_id: Uuid,
        caller: &User,
    ) -> Result<OrganizationWithRole> {
        with_backoff(&self.settings.retry, "organization.get", move || async move {
            let mut tx = self.store.begin().await?;
            let org = tx
                .find_organization(org_id)
                .await?
                .ok_or_else(|| AppError::not_found("Organization not found"))?;
            visible_to(tx.as_mut(), org, caller).await
        })
        .await
    }

    pub async fn get_organization_by_slug(
        &self,
        slug: &str,
        caller: &User,
    ) -> Result<OrganizationWithRole> {
        with_backoff(&self.settings.retry, "organization.get_by_slug", move || async move {
            let mut tx = self.store.begin().await?;
            let org = tx
                .find_organization_by_slug(slug)
                .await?
                .ok_or_else(|| AppError::not_found("Organization not found"))?;
            visible_to(tx.as_mut(), org, caller).await
        })
        .await
    }
}

async fn visible_to(
    tx: &mut dyn StoreTx,
    organization: Organization,
    caller: &User,
) -> Result<OrganizationWithRole> {
    let role = caller_role(tx, organization.id, caller.id).await?;
    policy::authorize(role, Action::ViewOrganization)?;
    // authorize rejects non-members, so the role is present here
    let role = role.ok_or_else(|| AppError::forbidden("Not a member of this organization"))?;
    Ok(OrganizationWithRole { organization, role })
}

#[cfg(test)]
mod tests {
    use super::super::testing::Harness;
    use crate::error::AppError;
    use crate::models::membership::Role;
    use crate::store::Store;

    #[tokio::test]
    async fn create_makes_caller_sole_owner() {
        let h = Harness::new();
        let alice = h.user("Alice").await;

        let org = h.authority.create_organization("Acme", &alice).await.unwrap();
        assert_eq!(org.slug, "acme");

        let mine = h.authority.list_for_user(alice.id).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].role, Role::Owner);

        let mut tx = h.store.begin().await.unwrap();
        assert_eq!(tx.count_owners(org.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn colliding_names_get_suffixed_slugs() {
        let h = Harness::new();
        let alice = h.user("Alice").await;

        let a = h.authority.create_organization("Acme", &alice).await.unwrap();
        let b = h.authority.create_organization("ACME", &alice).await.unwrap();
        let c = h.authority.create_organization("acme!", &alice).await.unwrap();
        assert_eq!(a.slug, "acme");
        assert_eq!(b.slug, "acme-2");
        assert_eq!(c.slug, "acme-3");
    }

    #[tokio::test]
    async fn blank_names_are_rejected() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let err = h.authority.create_organization("   ", &alice).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn rename_requires_admin() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let bob = h.user("Bob").await;
        let org = h.authority.create_organization("Acme", &alice).await.unwrap();

        let err = h
            .authority
            .rename_organization(org.id, "Evil", &bob)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let renamed = h
            .authority
            .rename_organization(org.id, "  Acme Corp ", &alice)
            .await
            .unwrap();
        assert_eq!(renamed.name, "Acme Corp");
        assert_eq!(renamed.slug, "acme");
    }

    #[tokio::test]
    async fn unknown_org_is_not_found() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let err = h
            .authority
            .rename_organization(uuid::Uuid::new_v4(), "X", &alice)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_cascades() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let org = h.authority.create_organization("Acme", &alice).await.unwrap();
        h.authority
            .create_invitation(org.id, "bob@example.com", Role::Member, &alice)
            .await
            .unwrap();

        let deleted = h.authority.delete_organization(org.id, &alice).await.unwrap();
        assert_eq!(deleted.id, org.id);

        assert!(h.authority.list_for_user(alice.id).await.unwrap().is_empty());
        let mut tx = h.store.begin().await.unwrap();
        assert!(tx.find_organization(org.id).await.unwrap().is_none());
        assert!(tx
            .find_pending_invitation(org.id, "bob@example.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn get_hides_orgs_from_outsiders() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let mallory = h.user("Mallory").await;
        let org = h.authority.create_organization("Acme", &alice).await.unwrap();

        let seen = h.authority.get_organization_by_slug("acme", &alice).await.unwrap();
        assert_eq!(seen.organization.id, org.id);
        assert_eq!(seen.role, Role::Owner);

        let err = h.authority.get_organization(org.id, &mallory).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }
}
