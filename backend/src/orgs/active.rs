use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::Authority;
use crate::error::{AppError, Result};
use crate::models::{organization::OrganizationWithRole, user::User};
use crate::retry::with_backoff;
use crate::store::StoreTx;

/// An authenticated session: the token's `sid` and its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    user_id: Uuid,
    organization_id: Uuid,
    expires_at: OffsetDateTime,
}

/// Session id to active organization. A binding is only a pointer: it is
/// checked against the membership ledger every time it is read, and it is
/// forgotten once its session expires.
#[derive(Clone, Default)]
pub struct ActiveBindings {
    sessions: Arc<RwLock<HashMap<String, Binding>>>,
}

impl ActiveBindings {
    async fn get(&self, session_id: &str, user_id: Uuid, now: OffsetDateTime) -> Option<Uuid> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .filter(|b| b.user_id == user_id && b.expires_at > now)
            .map(|b| b.organization_id)
    }

    /// Bind the session, dropping every binding whose session has expired.
    async fn set(
        &self,
        session: &Session,
        user_id: Uuid,
        organization_id: Uuid,
        now: OffsetDateTime,
    ) {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, b| b.expires_at > now);
        let pruned = before - sessions.len();
        if pruned > 0 {
            debug!(pruned, "Dropped bindings of expired sessions");
        }
        if session.expires_at > now {
            sessions.insert(
                session.id.clone(),
                Binding {
                    user_id,
                    organization_id,
                    expires_at: session.expires_at,
                },
            );
        }
    }

    async fn clear(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id);
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Authority {
    /// The session's active organization.
    ///
    /// A binding whose membership has gone away is replaced by the caller's
    /// earliest membership, or dropped when they have none left.
    #[instrument(skip(self, session, caller), fields(user_id = %caller.id))]
    pub async fn active_organization(
        &self,
        session: &Session,
        caller: &User,
    ) -> Result<Option<OrganizationWithRole>> {
        let now = self.clock.now();
        let bound = self.bindings.get(&session.id, caller.id, now).await;

        let retry = &self.settings.retry;
        let (current, fallback) = with_backoff(retry, "active.get", move || async move {
            let mut tx = self.store.begin().await?;
            if let Some(org_id) = bound {
                if let Some(found) = bound_membership(tx.as_mut(), org_id, caller.id).await? {
                    return Ok((Some(found), None));
                }
            }
            Ok((None, tx.first_membership_for_user(caller.id).await?))
        })
        .await?;

        if current.is_some() {
            return Ok(current);
        }
        match &fallback {
            Some(org) => {
                debug!(
                    org_id = %org.organization.id,
                    "Active organization fell back to first membership"
                );
                self.bindings
                    .set(session, caller.id, org.organization.id, now)
                    .await;
            }
            None => self.bindings.clear(&session.id).await,
        }
        Ok(fallback)
    }

    /// Point the session at `org_id`. The caller must belong to it.
    #[instrument(skip(self, session, caller), fields(user_id = %caller.id))]
    pub async fn set_active_organization(
        &self,
        session: &Session,
        org_id: Uuid,
        caller: &User,
    ) -> Result<OrganizationWithRole> {
        let org = with_backoff(&self.settings.retry, "active.set", move || async move {
            let mut tx = self.store.begin().await?;
            bound_membership(tx.as_mut(), org_id, caller.id)
                .await?
                .ok_or_else(|| AppError::forbidden("Not a member of this organization"))
        })
        .await?;

        let now = self.clock.now();
        self.bindings.set(session, caller.id, org_id, now).await;
        Ok(org)
    }
}

async fn bound_membership(
    tx: &mut dyn StoreTx,
    org_id: Uuid,
    user_id: Uuid,
) -> Result<Option<OrganizationWithRole>> {
    let Some(membership) = tx.find_membership(org_id, user_id).await? else {
        return Ok(None);
    };
    Ok(tx
        .find_organization(org_id)
        .await?
        .map(|organization| OrganizationWithRole {
            organization,
            role: membership.role,
        }))
}
