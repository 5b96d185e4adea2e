//! Authorization rules shared by every backend.
//!
//! Backends only decide how roles and statuses are stored; whether an actor
//! may do something is decided here.

use {
    realmvault_protocol::{RealmError, RealmGrantedRole, RealmStatus, Role, UserId},
    std::collections::HashMap,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ReadData,
    WriteData,
    Maintenance,
    ChangeRole {
        /// The author is the target of the change.
        self_change: bool,
        current: Option<Role>,
        requested: Option<Role>,
    },
}

#[must_use]
pub fn authorize(action: Action, author_role: Option<Role>) -> bool {
    let Some(author_role) = author_role else {
        return false;
    };
    match action {
        Action::ReadData => true,
        Action::WriteData => author_role.can_write(),
        Action::Maintenance => author_role == Role::Owner,
        Action::ChangeRole {
            self_change,
            current,
            requested,
        } => {
            if self_change {
                return false;
            }
            let touches_management = [current, requested]
                .into_iter()
                .flatten()
                .any(|role| role >= Role::Manager);
            if touches_management {
                author_role == Role::Owner
            } else {
                author_role >= Role::Manager
            }
        }
    }
}

pub fn check(action: Action, author_role: Option<Role>) -> Result<(), RealmError> {
    if authorize(action, author_role) {
        Ok(())
    } else {
        Err(RealmError::AccessDenied)
    }
}

/// Checks that `user` currently holds any role in the realm.
pub fn check_member(roles: &HashMap<UserId, Role>, user: &UserId) -> Result<(), RealmError> {
    check(Action::ReadData, roles.get(user).copied())
}

pub fn check_role_change(
    roles: &HashMap<UserId, Role>,
    new_role: &RealmGrantedRole,
) -> Result<(), RealmError> {
    let author = new_role.granted_by.user_id();
    check(
        Action::ChangeRole {
            self_change: *author == new_role.user_id,
            current: roles.get(&new_role.user_id).copied(),
            requested: new_role.role,
        },
        roles.get(author).copied(),
    )
}

/// A realm can only be created by its first owner granting the role to themself.
pub fn check_self_granted_owner(grant: &RealmGrantedRole) -> Result<(), RealmError> {
    if grant.role == Some(Role::Owner) && *grant.granted_by.user_id() == grant.user_id {
        Ok(())
    } else {
        Err(RealmError::AccessDenied)
    }
}

pub fn check_not_in_maintenance(status: &RealmStatus) -> Result<(), RealmError> {
    if status.in_maintenance() {
        Err(RealmError::InMaintenance)
    } else {
        Ok(())
    }
}
