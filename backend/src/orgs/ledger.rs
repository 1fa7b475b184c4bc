use tracing::{info, instrument};
use uuid::Uuid;

use super::policy::{self, Action};
use super::{caller_role, Authority};
use crate::error::{AppError, Result};
use crate::models::{
    membership::{Member, Membership, Role},
    user::User,
};
use crate::retry::with_backoff;
use crate::store::StoreTx;

async fn lock_org(tx: &mut dyn StoreTx, org_id: Uuid) -> Result<()> {
    tx.lock_organization(org_id)
        .await?
        .ok_or_else(|| AppError::not_found("Organization not found"))?;
    Ok(())
}

async fn target_membership(
    tx: &mut dyn StoreTx,
    org_id: Uuid,
    user_id: Uuid,
) -> Result<Membership> {
    tx.find_membership(org_id, user_id)
        .await?
        .ok_or_else(|| AppError::not_found("Member not found"))
}

impl Authority {
    /// Members of an organization, visible to any of its members.
    pub async fn list_members(&self, org_id: Uuid, caller: &User) -> Result<Vec<Member>> {
        with_backoff(&self.settings.retry, "members.list", move || async move {
            let mut tx = self.store.begin().await?;
            tx.find_organization(org_id)
                .await?
                .ok_or_else(|| AppError::not_found("Organization not found"))?;
            let role = caller_role(tx.as_mut(), org_id, caller.id).await?;
            policy::authorize(role, Action::ViewMembers)?;
            tx.list_members(org_id).await
        })
        .await
    }

    /// Change another member's role. Setting the role a member already
    /// holds succeeds without writing anything.
    #[instrument(skip(self, caller), fields(user_id = %caller.id))]
    pub async fn update_role(
        &self,
        org_id: Uuid,
        target_user_id: Uuid,
        new_role: Role,
        caller: &User,
    ) -> Result<Membership> {
        let retry = &self.settings.retry;
        let membership = with_backoff(retry, "members.update_role", move || async move {
            let mut tx = self.store.begin().await?;
            lock_org(tx.as_mut(), org_id).await?;

            let role = caller_role(tx.as_mut(), org_id, caller.id).await?;
            policy::authorize(role, Action::ManageMembers)?;
            let target = target_membership(tx.as_mut(), org_id, target_user_id).await?;
            policy::authorize(
                role,
                Action::ChangeRole {
                    target_is_self: target_user_id == caller.id,
                    target_role: target.role,
                    new_role,
                },
            )?;

            if target.role == new_role {
                return Ok(target);
            }
            if target.role.is_owner() {
                let owners = tx.count_owners(org_id).await?;
                policy::check_owner_floor(target.role, Some(new_role), owners)?;
            }

            let updated = tx
                .set_membership_role(org_id, target_user_id, new_role, self.clock.now())
                .await?;
            tx.commit().await?;
            Ok(updated)
        })
        .await?;

        info!(
            org_id = %org_id,
            target = %target_user_id,
            role = %membership.role,
            "Member role updated"
        );
        Ok(membership)
    }

    /// Remove another member. Returns the membership that was deleted.
    #[instrument(skip(self, caller), fields(user_id = %caller.id))]
    pub async fn remove_member(
        &self,
        org_id: Uuid,
        target_user_id: Uuid,
        caller: &User,
    ) -> Result<Membership> {
        let removed = with_backoff(&self.settings.retry, "members.remove", move || async move {
            let mut tx = self.store.begin().await?;
            lock_org(tx.as_mut(), org_id).await?;

            let role = caller_role(tx.as_mut(), org_id, caller.id).await?;
            policy::authorize(role, Action::ManageMembers)?;
            let target = target_membership(tx.as_mut(), org_id, target_user_id).await?;
            policy::authorize(
                role,
                Action::RemoveMember {
                    target_is_self: target_user_id == caller.id,
                    target_role: target.role,
                },
            )?;
            if target.role.is_owner() {
                let owners = tx.count_owners(org_id).await?;
                policy::check_owner_floor(target.role, None, owners)?;
            }

            tx.delete_membership(org_id, target_user_id).await?;
            tx.commit().await?;
            Ok(target)
        })
        .await?;

        info!(org_id = %org_id, target = %target_user_id, "Member removed");
        Ok(removed)
    }

    /// Drop the caller's own membership. The last owner cannot leave.
    #[instrument(skip(self, caller), fields(user_id = %caller.id))]
    pub async fn leave(&self, org_id: Uuid, caller: &User) -> Result<Membership> {
        let left = with_backoff(&self.settings.retry, "members.leave", move || async move {
            let mut tx = self.store.begin().await?;
            lock_org(tx.as_mut(), org_id).await?;

            let own = tx
                .find_membership(org_id, caller.id)
                .await?
                .ok_or_else(|| AppError::forbidden("Not a member of this organization"))?;
            if own.role.is_owner() {
                let owners = tx.count_owners(org_id).await?;
                policy::check_owner_floor(own.role, None, owners)?;
            }

            tx.delete_membership(org_id, caller.id).await?;
            tx.commit().await?;
            Ok(own)
        })
        .await?;

        info!(org_id = %org_id, "Member left organization");
        Ok(left)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::super::testing::Harness;
    use crate::error::AppError;
    use crate::models::{membership::Role, user::User};
    use crate::store::Store;

    async fn join(h: &Harness, org_id: Uuid, inviter: &User, who: &User, role: Role) {
        h.authority
            .create_invitation(org_id, &who.email, role, inviter)
            .await
            .unwrap();
        let mine = h.authority.list_my_invitations(who).await.unwrap();
        let token = mine
            .iter()
            .find(|i| i.invitation.organization_id == org_id)
            .unwrap()
            .token
            .clone();
        h.authority.accept_invitation(&token, who).await.unwrap();
    }

    async fn owners(h: &Harness, org_id: Uuid) -> i64 {
        let mut tx = h.store.begin().await.unwrap();
        tx.count_owners(org_id).await.unwrap()
    }

    #[tokio::test]
    async fn members_are_listed_by_role_then_name() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let zed = h.user("Zed").await;
        let bob = h.user("Bob").await;
        let org = h.authority.create_organization("Acme", &alice).await.unwrap();
        join(&h, org.id, &alice, &zed, Role::Admin).await;
        join(&h, org.id, &alice, &bob, Role::Member).await;

        let members = h.authority.list_members(org.id, &bob).await.unwrap();
        let names: Vec<_> = members.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["Alice", "Zed", "Bob"]);
        assert_eq!(members[1].email, "zed@example.com");
    }

    #[tokio::test]
    async fn outsiders_cannot_list_members() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let mallory = h.user("Mallory").await;
        let org = h.authority.create_organization("Acme", &alice).await.unwrap();
        let err = h.authority.list_members(org.id, &mallory).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn sole_owner_cannot_demote_or_leave() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let org = h.authority.create_organization("Acme", &alice).await.unwrap();

        let err = h.authority.leave(org.id, &alice).await.unwrap_err();
        assert!(matches!(err, AppError::LastOwnerViolation));
        assert_eq!(owners(&h, org.id).await, 1);
    }

    #[tokio::test]
    async fn promoting_then_leaving_keeps_an_owner() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let bob = h.user("Bob").await;
        let org = h.authority.create_organization("Acme", &alice).await.unwrap();
        join(&h, org.id, &alice, &bob, Role::Admin).await;

        let promoted = h
            .authority
            .update_role(org.id, bob.id, Role::Owner, &alice)
            .await
            .unwrap();
        assert_eq!(promoted.role, Role::Owner);
        assert_eq!(owners(&h, org.id).await, 2);

        h.authority.leave(org.id, &alice).await.unwrap();
        assert_eq!(owners(&h, org.id).await, 1);

        let err = h.authority.leave(org.id, &bob).await.unwrap_err();
        assert!(matches!(err, AppError::LastOwnerViolation));
    }

    #[tokio::test]
    async fn admins_cannot_touch_owners() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let bob = h.user("Bob").await;
        let org = h.authority.create_organization("Acme", &alice).await.unwrap();
        join(&h, org.id, &alice, &bob, Role::Admin).await;

        let err = h
            .authority
            .update_role(org.id, alice.id, Role::Member, &bob)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let err = h.authority.remove_member(org.id, alice.id, &bob).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn members_cannot_change_roles() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let bob = h.user("Bob").await;
        let carol = h.user("Carol").await;
        let org = h.authority.create_organization("Acme", &alice).await.unwrap();
        join(&h, org.id, &alice, &bob, Role::Member).await;
        join(&h, org.id, &alice, &carol, Role::Member).await;

        let err = h
            .authority
            .update_role(org.id, carol.id, Role::Admin, &bob)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn unchanged_role_is_a_no_op() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let bob = h.user("Bob").await;
        let org = h.authority.create_organization("Acme", &alice).await.unwrap();
        join(&h, org.id, &alice, &bob, Role::Member).await;

        let before = h.authority.list_members(org.id, &alice).await.unwrap();
        let same = h
            .authority
            .update_role(org.id, bob.id, Role::Member, &alice)
            .await
            .unwrap();
        assert_eq!(same.role, Role::Member);
        let after = h.authority.list_members(org.id, &alice).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn remove_deletes_the_membership() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let bob = h.user("Bob").await;
        let org = h.authority.create_organization("Acme", &alice).await.unwrap();
        join(&h, org.id, &alice, &bob, Role::Member).await;

        let removed = h.authority.remove_member(org.id, bob.id, &alice).await.unwrap();
        assert_eq!(removed.user_id, bob.id);
        assert!(h.authority.list_for_user(bob.id).await.unwrap().is_empty());

        let err = h.authority.remove_member(org.id, bob.id, &alice).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn removing_yourself_is_forbidden() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let org = h.authority.create_organization("Acme", &alice).await.unwrap();
        let err = h.authority.remove_member(org.id, alice.id, &alice).await.unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn concurrent_owner_departures_leave_one_owner() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let bob = h.user("Bob").await;
        let org = h.authority.create_organization("Acme", &alice).await.unwrap();
        join(&h, org.id, &alice, &bob, Role::Admin).await;
        h.authority
            .update_role(org.id, bob.id, Role::Owner, &alice)
            .await
            .unwrap();

        let authority = Arc::new(h.authority.clone());
        let (a, b) = {
            let (auth_a, auth_b) = (authority.clone(), authority.clone());
            let (alice, bob) = (alice.clone(), bob.clone());
            let org_id = org.id;
            (
                tokio::spawn(async move { auth_a.leave(org_id, &alice).await }),
                tokio::spawn(async move { auth_b.leave(org_id, &bob).await }),
            )
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let ok = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(ok, 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(AppError::LastOwnerViolation))));
        assert_eq!(owners(&h, org.id).await, 1);
    }

    #[tokio::test]
    async fn concurrent_demotions_by_a_third_owner_keep_an_owner() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let bob = h.user("Bob").await;
        let carol = h.user("Carol").await;
        let org = h.authority.create_organization("Acme", &carol).await.unwrap();
        for who in [&alice, &bob] {
            join(&h, org.id, &carol, who, Role::Admin).await;
            h.authority
                .update_role(org.id, who.id, Role::Owner, &carol)
                .await
                .unwrap();
        }
        assert_eq!(owners(&h, org.id).await, 3);

        let authority = Arc::new(h.authority.clone());
        let handles: Vec<_> = [alice.id, bob.id]
            .into_iter()
            .map(|target| {
                let authority = authority.clone();
                let carol = carol.clone();
                let org_id = org.id;
                tokio::spawn(async move {
                    authority.update_role(org_id, target, Role::Admin, &carol).await
                })
            })
            .collect();
        for handle in handles {
            let demoted = handle.await.unwrap().unwrap();
            assert_eq!(demoted.role, Role::Admin);
        }

        assert_eq!(owners(&h, org.id).await, 1);
    }

    #[tokio::test]
    async fn co_owners_demoting_each_other_leave_one_owner() {
        let h = Harness::new();
        let alice = h.user("Alice").await;
        let bob = h.user("Bob").await;
        let org = h.authority.create_organization("Acme", &alice).await.unwrap();
        join(&h, org.id, &alice, &bob, Role::Admin).await;
        h.authority
            .update_role(org.id, bob.id, Role::Owner, &alice)
            .await
            .unwrap();

        let authority = Arc::new(h.authority.clone());
        let (a, b) = {
            let (auth_a, auth_b) = (authority.clone(), authority.clone());
            let (alice, bob) = (alice.clone(), bob.clone());
            let org_id = org.id;
            let (alice_id, bob_id) = (alice.id, bob.id);
            (
                tokio::spawn(async move {
                    auth_a.update_role(org_id, bob_id, Role::Admin, &alice).await
                }),
                tokio::spawn(async move {
                    auth_b.update_role(org_id, alice_id, Role::Admin, &bob).await
                }),
            )
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        // whoever commits second has already lost ownership
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(r, Err(AppError::Forbidden(_)))));
        assert_eq!(owners(&h, org.id).await, 1);
    }
}
