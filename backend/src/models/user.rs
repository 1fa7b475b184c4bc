use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::organization::OrganizationWithRole;

/// A verified user as supplied by the identity provider. Read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub picture: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl User {
    /// Case-insensitive comparison against an invitation address.
    pub fn has_email(&self, email: &str) -> bool {
        normalize_email(&self.email) == normalize_email(email)
    }
}

/// Body of `GET /api/auth/me`.
#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user: User,
    pub active_organization: Option<OrganizationWithRole>,
}

/// Canonical form used for storing and comparing invitation addresses.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_case_and_whitespace() {
        assert_eq!(normalize_email("  Bob@Example.COM "), "bob@example.com");
    }
}
