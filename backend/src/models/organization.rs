use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;
use validator::Validate;

use super::membership::Role;

/// Longest slug stem derived from a name, before any collision suffix.
pub const SLUG_MAX_LEN: usize = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// An organization as seen by one of its members.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct OrganizationWithRole {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub organization: Organization,
    pub role: Role,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrganizationRequest {
    #[validate(length(min = 1, max = 100, message = "name must be 1-100 characters"))]
    pub name: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateOrganizationRequest {
    #[validate(length(min = 1, max = 100, message = "name must be 1-100 characters"))]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct SetActiveOrganizationRequest {
    pub organization_id: Uuid,
}

/// Derive the slug stem for an organization name.
///
/// Lower-cases, collapses every run of non-alphanumeric characters into a
/// single `-`, trims dashes from both ends and caps the result at
/// [`SLUG_MAX_LEN`]. Names with no usable characters fall back to `org`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;

    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch);
        } else {
            pending_dash = true;
        }
    }

    if slug.len() > SLUG_MAX_LEN {
        slug.truncate(SLUG_MAX_LEN);
        while slug.ends_with('-') {
            slug.pop();
        }
    }

    if slug.is_empty() {
        "org".to_string()
    } else {
        slug
    }
}

/// The `n`th candidate for a slug stem: the stem itself, then `stem-2`, `stem-3`, ...
pub fn slug_candidate(stem: &str, n: u32) -> String {
    if n <= 1 {
        stem.to_string()
    } else {
        format!("{}-{}", stem, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_lowercases_and_dashes() {
        assert_eq!(slugify("Acme"), "acme");
        assert_eq!(slugify("Acme Widgets, Inc."), "acme-widgets-inc");
        assert_eq!(slugify("  --Hello   World--  "), "hello-world");
    }

    #[test]
    fn slugify_falls_back_for_symbol_only_names() {
        assert_eq!(slugify("!!!"), "org");
        assert_eq!(slugify("日本"), "org");
    }

    #[test]
    fn slugify_truncates_without_trailing_dash() {
        let slug = slugify("abcdefghijklmnopqrstuvwxyz abcdefghij");
        assert!(slug.len() <= SLUG_MAX_LEN);
        assert!(!slug.ends_with('-'));
        assert_eq!(slug, "abcdefghijklmnopqrstuvwxyz-abc");
    }

    #[test]
    fn slug_candidates_are_suffixed_after_the_first() {
        assert_eq!(slug_candidate("acme", 1), "acme");
        assert_eq!(slug_candidate("acme", 2), "acme-2");
        assert_eq!(slug_candidate("acme", 10), "acme-10");
    }
}
