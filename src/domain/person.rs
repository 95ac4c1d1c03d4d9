//! Person domain types.
//!
//! People are shared by every message and conversation they participate in,
//! keyed by normalized email address.

use serde::{Deserialize, Serialize};

/// A participant identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    /// Normalized email address (identity key).
    pub email: String,
    /// Display name, if one has ever been seen.
    pub display_name: Option<String>,
}

impl Person {
    /// Creates a person from a raw address, normalizing the email.
    pub fn new(email: &str, display_name: Option<&str>) -> Self {
        Self {
            email: normalize_email(email),
            display_name: display_name
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_owned),
        }
    }

    /// Returns the display name or email if no name is set.
    pub fn display(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.email)
    }
}

/// Normalizes an email address for identity comparisons.
///
/// Trims whitespace and surrounding angle brackets, and lowercases.
pub fn normalize_email(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn person_new_normalizes() {
        let person = Person::new(" <Bob@Example.com> ", Some("  Bob "));
        assert_eq!(person.email, "bob@example.com");
        assert_eq!(person.display_name.as_deref(), Some("Bob"));
    }

    #[test]
    fn blank_name_is_none() {
        let person = Person::new("bob@example.com", Some("   "));
        assert!(person.display_name.is_none());
        assert_eq!(person.display(), "bob@example.com");
    }
}
