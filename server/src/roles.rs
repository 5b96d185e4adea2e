use {
    realmvault_protocol::{DateTimeUtc, RealmGrantedRole, Role, UserId},
    std::collections::HashMap,
};

/// Append-only history of the role grants of one realm.
///
/// Authorization is the caller's job: `append` never rejects.
#[derive(Debug, Clone, Default)]
pub struct RoleLedger {
    grants: Vec<RealmGrantedRole>,
}

impl RoleLedger {
    #[must_use]
    pub fn new(grants: Vec<RealmGrantedRole>) -> Self {
        Self { grants }
    }

    pub fn append(&mut self, grant: RealmGrantedRole) {
        self.grants.push(grant);
    }

    #[must_use]
    pub fn grants(&self) -> &[RealmGrantedRole] {
        &self.grants
    }

    /// Replays the grants chronologically; the last grant of a user wins and a
    /// revocation removes the user.
    #[must_use]
    pub fn current_roles(&self) -> HashMap<UserId, Role> {
        let mut grants: Vec<_> = self.grants.iter().collect();
        // Stable: grants sharing a timestamp keep their insertion order.
        grants.sort_by_key(|grant| grant.granted_on);
        let mut roles = HashMap::new();
        for grant in grants {
            if let Some(role) = grant.role {
                roles.insert(grant.user_id.clone(), role);
            } else {
                roles.remove(&grant.user_id);
            }
        }
        roles
    }

    #[must_use]
    pub fn role_of(&self, user: &UserId) -> Option<Role> {
        self.current_roles().get(user).copied()
    }

    #[must_use]
    pub fn certificates_since(&self, since: Option<DateTimeUtc>) -> Vec<Vec<u8>> {
        self.grants
            .iter()
            .filter(|grant| since.is_none_or(|since| grant.granted_on > since))
            .map(|grant| grant.certificate.clone())
            .collect()
    }
}
