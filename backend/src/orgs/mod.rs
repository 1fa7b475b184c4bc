//! The organization authority: directory, membership ledger, invitations and
//! the per-session active organization.
//!
//! Every mutating operation runs as one store transaction: lock the
//! organization, read current state, ask [`policy`] whether the change is
//! allowed, write, commit. Transient storage faults re-run the whole
//! transaction through [`crate::retry::with_backoff`].

mod active;
mod directory;
mod invitations;
mod ledger;
pub mod policy;

pub use active::{ActiveBindings, Session};

use std::sync::Arc;

use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::models::membership::Role;
use crate::retry::RetryPolicy;
use crate::store::{Store, StoreTx};

#[derive(Debug, Clone, Copy)]
pub struct AuthoritySettings {
    /// Lifetime of a freshly issued invitation.
    pub invitation_ttl: time::Duration,
    pub retry: RetryPolicy,
}

impl Default for AuthoritySettings {
    fn default() -> Self {
        Self {
            invitation_ttl: time::Duration::days(7),
            retry: RetryPolicy::default(),
        }
    }
}

/// Shared handle to the organization services. Cheap to clone.
#[derive(Clone)]
pub struct Authority {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    bindings: ActiveBindings,
    settings: AuthoritySettings,
}

impl Authority {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, settings: AuthoritySettings) -> Self {
        Self {
            store,
            clock,
            bindings: ActiveBindings::default(),
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn settings(&self) -> &AuthoritySettings {
        &self.settings
    }
}

/// The caller's role in `org_id`, if they belong to it.
async fn caller_role(tx: &mut dyn StoreTx, org_id: Uuid, user_id: Uuid) -> Result<Option<Role>> {
    Ok(tx.find_membership(org_id, user_id).await?.map(|m| m.role))
}
