//! Role-based rules consulted before any mutation.
//!
//! Everything here is a pure function of the caller's role and the target's
//! current state; callers read that state inside the same transaction that
//! performs the write.

use crate::error::{AppError, Result};
use crate::models::membership::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ViewOrganization,
    ViewMembers,
    RenameOrganization,
    DeleteOrganization,
    ManageMembers,
    ManageInvitations,
    ChangeRole {
        target_is_self: bool,
        target_role: Role,
        new_role: Role,
    },
    RemoveMember {
        target_is_self: bool,
        target_role: Role,
    },
}

/// Decide whether a caller holding `caller` (None = not a member) may perform `action`.
pub fn authorize(caller: Option<Role>, action: Action) -> Result<()> {
    let role = caller.ok_or_else(|| AppError::forbidden("Not a member of this organization"))?;

    match action {
        Action::ViewOrganization | Action::ViewMembers => Ok(()),
        Action::RenameOrganization | Action::ManageMembers | Action::ManageInvitations => {
            require_manager(role)
        }
        Action::DeleteOrganization => {
            if role.is_owner() {
                Ok(())
            } else {
                Err(AppError::forbidden("Only owners can delete an organization"))
            }
        }
        Action::ChangeRole {
            target_is_self,
            target_role,
            new_role,
        } => {
            require_manager(role)?;
            if target_is_self {
                return Err(AppError::forbidden("You cannot change your own role"));
            }
            if !role.is_owner() && target_role.is_owner() {
                return Err(AppError::forbidden("Admins cannot modify owners"));
            }
            if !role.is_owner() && new_role.is_owner() {
                return Err(AppError::forbidden("Only owners can grant ownership"));
            }
            Ok(())
        }
        Action::RemoveMember {
            target_is_self,
            target_role,
        } => {
            require_manager(role)?;
            if target_is_self {
                return Err(AppError::forbidden(
                    "Use leave to remove yourself from an organization",
                ));
            }
            if !role.is_owner() && target_role.is_owner() {
                return Err(AppError::forbidden("Admins cannot remove owners"));
            }
            Ok(())
        }
    }
}

fn require_manager(role: Role) -> Result<()> {
    if role.can_manage_members() {
        Ok(())
    } else {
        Err(AppError::forbidden("Insufficient permissions"))
    }
}

/// Reject a change that would take the organization's last owner away.
///
/// `next_role` is the target's role after the change, `None` when the
/// membership is being deleted. `owner_count` must be read under the
/// organization lock held for the write.
pub fn check_owner_floor(current: Role, next_role: Option<Role>, owner_count: i64) -> Result<()> {
    let loses_owner = current.is_owner() && !next_role.map(Role::is_owner).unwrap_or(false);
    if loses_owner && owner_count <= 1 {
        return Err(AppError::LastOwnerViolation);
    }
    Ok(())
}

/// Invitations may grant `admin` or `member`, never `owner`.
pub fn check_invitation_role(role: Role) -> Result<()> {
    if role.is_owner() {
        return Err(AppError::BadRequest(
            "Invitations can only grant the admin or member role".into(),
        ));
    }
    Ok(())
}
