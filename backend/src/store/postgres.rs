use async_trait::async_trait;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{Store, StoreTx};
use crate::error::{AppError, Result};
use crate::models::{
    invitation::{Invitation, InvitationStatus, InvitationWithDetails},
    membership::{Member, Membership, Role},
    organization::{Organization, OrganizationWithRole},
    user::User,
};

const ORG_COLUMNS: &str = "id, name, slug, created_at, updated_at";
const MEMBERSHIP_COLUMNS: &str = "id, organization_id, user_id, role, created_at, updated_at";
const INVITATION_COLUMNS: &str =
    "id, organization_id, email, role, token, invited_by, status, expires_at, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx: Some(tx) }))
    }

    async fn find_user(&self, id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, email, name, picture, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, name, picture, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET email = EXCLUDED.email, name = EXCLUDED.name, picture = EXCLUDED.picture
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.picture)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// A Postgres transaction. Dropped without commit, sqlx rolls it back.
pub struct PgTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgTx {
    fn conn(&mut self) -> Result<&mut PgConnection> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("transaction already finished")))
    }
}

#[async_trait]
impl StoreTx for PgTx {
    async fn commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("transaction already finished")))?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_user(&mut self, id: Uuid) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, email, name, picture, created_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(user)
    }

    async fn find_organization(&mut self, id: Uuid) -> Result<Option<Organization>> {
        let org = sqlx::query_as::<_, Organization>(&format!(
            "SELECT {ORG_COLUMNS} FROM organizations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(org)
    }

    async fn find_organization_by_slug(&mut self, slug: &str) -> Result<Option<Organization>> {
        let org = sqlx::query_as::<_, Organization>(&format!(
            "SELECT {ORG_COLUMNS} FROM organizations WHERE slug = $1"
        ))
        .bind(slug)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(org)
    }

    async fn lock_organization(&mut self, id: Uuid) -> Result<Option<Organization>> {
        let org = sqlx::query_as::<_, Organization>(&format!(
            "SELECT {ORG_COLUMNS} FROM organizations WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(org)
    }

    async fn slug_taken(&mut self, slug: &str) -> Result<bool> {
        let taken = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM organizations WHERE slug = $1)",
        )
        .bind(slug)
        .fetch_one(self.conn()?)
        .await?;
        Ok(taken)
    }

    async fn insert_organization(&mut self, org: &Organization) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO organizations (id, name, slug, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(org.id)
        .bind(&org.name)
        .bind(&org.slug)
        .bind(org.created_at)
        .bind(org.updated_at)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn rename_organization(
        &mut self,
        id: Uuid,
        name: &str,
        now: OffsetDateTime,
    ) -> Result<Organization> {
        sqlx::query_as::<_, Organization>(&format!(
            "UPDATE organizations SET name = $2, updated_at = $3 WHERE id = $1 RETURNING {ORG_COLUMNS}"
        ))
        .bind(id)
        .bind(name)
        .bind(now)
        .fetch_optional(self.conn()?)
        .await?
        .ok_or_else(|| AppError::not_found("Organization not found"))
    }

    async fn delete_organization(&mut self, id: Uuid) -> Result<()> {
        // Children first, in case the FK cascade is ever relaxed.
        let cascade = [
            "DELETE FROM organization_invitations WHERE organization_id = $1",
            "DELETE FROM organization_members WHERE organization_id = $1",
        ];
        for q in cascade {
            sqlx::query(q).bind(id).execute(self.conn()?).await?;
        }

        let deleted = sqlx::query("DELETE FROM organizations WHERE id = $1")
            .bind(id)
            .execute(self.conn()?)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(AppError::not_found("Organization not found"));
        }
        Ok(())
    }

    async fn organizations_for_user(&mut self, user_id: Uuid) -> Result<Vec<OrganizationWithRole>> {
        let orgs = sqlx::query_as::<_, OrganizationWithRole>(
            r#"
            SELECT o.id, o.name, o.slug, o.created_at, o.updated_at, m.role
            FROM organizations o
            JOIN organization_members m ON m.organization_id = o.id
            WHERE m.user_id = $1
            ORDER BY o.name, o.id
            "#,
        )
        .bind(user_id)
        .fetch_all(self.conn()?)
        .await?;
        Ok(orgs)
    }

    async fn find_membership(&mut self, org_id: Uuid, user_id: Uuid) -> Result<Option<Membership>> {
        let m = sqlx::query_as::<_, Membership>(&format!(
            "SELECT {MEMBERSHIP_COLUMNS} FROM organization_members \
             WHERE organization_id = $1 AND user_id = $2"
        ))
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(m)
    }

    async fn first_membership_for_user(
        &mut self,
        user_id: Uuid,
    ) -> Result<Option<OrganizationWithRole>> {
        let org = sqlx::query_as::<_, OrganizationWithRole>(
            r#"
            SELECT o.id, o.name, o.slug, o.created_at, o.updated_at, m.role
            FROM organizations o
            JOIN organization_members m ON m.organization_id = o.id
            WHERE m.user_id = $1
            ORDER BY m.created_at, m.id
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(org)
    }

    async fn insert_membership(&mut self, membership: &Membership) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO organization_members
                (id, organization_id, user_id, role, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(membership.id)
        .bind(membership.organization_id)
        .bind(membership.user_id)
        .bind(membership.role)
        .bind(membership.created_at)
        .bind(membership.updated_at)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn set_membership_role(
        &mut self,
        org_id: Uuid,
        user_id: Uuid,
        role: Role,
        now: OffsetDateTime,
    ) -> Result<Membership> {
        sqlx::query_as::<_, Membership>(&format!(
            "UPDATE organization_members SET role = $3, updated_at = $4 \
             WHERE organization_id = $1 AND user_id = $2 \
             RETURNING {MEMBERSHIP_COLUMNS}"
        ))
        .bind(org_id)
        .bind(user_id)
        .bind(role)
        .bind(now)
        .fetch_optional(self.conn()?)
        .await?
        .ok_or_else(|| AppError::not_found("Member not found"))
    }

    async fn delete_membership(&mut self, org_id: Uuid, user_id: Uuid) -> Result<()> {
        let deleted = sqlx::query(
            "DELETE FROM organization_members WHERE organization_id = $1 AND user_id = $2",
        )
        .bind(org_id)
        .bind(user_id)
        .execute(self.conn()?)
        .await?
        .rows_affected();
        if deleted == 0 {
            return Err(AppError::not_found("Member not found"));
        }
        Ok(())
    }

    async fn count_owners(&mut self, org_id: Uuid) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM organization_members WHERE organization_id = $1 AND role = 'owner'",
        )
        .bind(org_id)
        .fetch_one(self.conn()?)
        .await?;
        Ok(count)
    }

    async fn list_members(&mut self, org_id: Uuid) -> Result<Vec<Member>> {
        let members = sqlx::query_as::<_, Member>(
            r#"
            SELECT m.id, m.organization_id, m.user_id, m.role,
                   u.email, u.name, u.picture,
                   m.created_at, m.updated_at
            FROM organization_members m
            JOIN users u ON u.id = m.user_id
            WHERE m.organization_id = $1
            ORDER BY
                CASE m.role
                    WHEN 'owner' THEN 1
                    WHEN 'admin' THEN 2
                    ELSE 3
                END,
                u.name, m.user_id
            "#,
        )
        .bind(org_id)
        .fetch_all(self.conn()?)
        .await?;
        Ok(members)
    }

    async fn is_member_email(&mut self, org_id: Uuid, email: &str) -> Result<bool> {
        let found = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM organization_members m
                JOIN users u ON u.id = m.user_id
                WHERE m.organization_id = $1 AND lower(u.email) = $2
            )
            "#,
        )
        .bind(org_id)
        .bind(email)
        .fetch_one(self.conn()?)
        .await?;
        Ok(found)
    }

    async fn insert_invitation(&mut self, inv: &Invitation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO organization_invitations
                (id, organization_id, email, role, token, invited_by, status,
                 expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(inv.id)
        .bind(inv.organization_id)
        .bind(&inv.email)
        .bind(inv.role)
        .bind(&inv.token)
        .bind(inv.invited_by)
        .bind(inv.status)
        .bind(inv.expires_at)
        .bind(inv.created_at)
        .bind(inv.updated_at)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn find_invitation(&mut self, id: Uuid) -> Result<Option<Invitation>> {
        let inv = sqlx::query_as::<_, Invitation>(&format!(
            "SELECT {INVITATION_COLUMNS} FROM organization_invitations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(inv)
    }

    async fn find_invitation_by_token(&mut self, token: &str) -> Result<Option<Invitation>> {
        let inv = sqlx::query_as::<_, Invitation>(&format!(
            "SELECT {INVITATION_COLUMNS} FROM organization_invitations WHERE token = $1"
        ))
        .bind(token)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(inv)
    }

    async fn lock_invitation(&mut self, id: Uuid) -> Result<Option<Invitation>> {
        let inv = sqlx::query_as::<_, Invitation>(&format!(
            "SELECT {INVITATION_COLUMNS} FROM organization_invitations WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(inv)
    }

    async fn find_pending_invitation(
        &mut self,
        org_id: Uuid,
        email: &str,
    ) -> Result<Option<Invitation>> {
        let inv = sqlx::query_as::<_, Invitation>(&format!(
            "SELECT {INVITATION_COLUMNS} FROM organization_invitations \
             WHERE organization_id = $1 AND email = $2 AND status = 'pending'"
        ))
        .bind(org_id)
        .bind(email)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(inv)
    }

    async fn set_invitation_status(
        &mut self,
        id: Uuid,
        status: InvitationStatus,
        now: OffsetDateTime,
    ) -> Result<Invitation> {
        if !InvitationStatus::Pending.can_transition_to(status) {
            return Err(AppError::InvalidState(format!(
                "Invitation cannot move to {:?}",
                status
            )));
        }
        sqlx::query_as::<_, Invitation>(&format!(
            "UPDATE organization_invitations SET status = $2, updated_at = $3 \
             WHERE id = $1 AND status = 'pending' RETURNING {INVITATION_COLUMNS}"
        ))
        .bind(id)
        .bind(status)
        .bind(now)
        .fetch_optional(self.conn()?)
        .await?
        .ok_or_else(|| AppError::InvalidState("Invitation is no longer pending".into()))
    }

    async fn delete_invitation(&mut self, id: Uuid) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM organization_invitations WHERE id = $1")
            .bind(id)
            .execute(self.conn()?)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(AppError::not_found("Invitation not found"));
        }
        Ok(())
    }

    async fn pending_invitations_for_org(
        &mut self,
        org_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<Vec<Invitation>> {
        let invs = sqlx::query_as::<_, Invitation>(&format!(
            "SELECT {INVITATION_COLUMNS} FROM organization_invitations \
             WHERE organization_id = $1 AND status = 'pending' AND expires_at >= $2 \
             ORDER BY created_at DESC, id"
        ))
        .bind(org_id)
        .bind(now)
        .fetch_all(self.conn()?)
        .await?;
        Ok(invs)
    }

    async fn pending_invitations_for_email(
        &mut self,
        email: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<InvitationWithDetails>> {
        let invs = sqlx::query_as::<_, InvitationWithDetails>(
            r#"
            SELECT i.id, i.organization_id, i.email, i.role, i.token, i.invited_by, i.status,
                   i.expires_at, i.created_at, i.updated_at,
                   o.name AS organization_name, u.name AS invited_by_name
            FROM organization_invitations i
            JOIN organizations o ON o.id = i.organization_id
            JOIN users u ON u.id = i.invited_by
            WHERE i.email = $1 AND i.status = 'pending' AND i.expires_at >= $2
            ORDER BY i.created_at DESC, i.id
            "#,
        )
        .bind(email)
        .bind(now)
        .fetch_all(self.conn()?)
        .await?;
        Ok(invs)
    }

    async fn expire_lapsed_for_org(&mut self, org_id: Uuid, now: OffsetDateTime) -> Result<u64> {
        let n = sqlx::query(
            r#"
            UPDATE organization_invitations
            SET status = 'expired', updated_at = $2
            WHERE organization_id = $1 AND status = 'pending' AND expires_at < $2
            "#,
        )
        .bind(org_id)
        .bind(now)
        .execute(self.conn()?)
        .await?
        .rows_affected();
        Ok(n)
    }

    async fn expire_lapsed_for_email(&mut self, email: &str, now: OffsetDateTime) -> Result<u64> {
        let n = sqlx::query(
            r#"
            UPDATE organization_invitations
            SET status = 'expired', updated_at = $2
            WHERE email = $1 AND status = 'pending' AND expires_at < $2
            "#,
        )
        .bind(email)
        .bind(now)
        .execute(self.conn()?)
        .await?
        .rows_affected();
        Ok(n)
    }
}
