//! Dismissal credentials.
//!
//! A credential is the identifier read from the physical tag that must be
//! scanned to end an alarm. It is an opaque string, compared without regard
//! to case; there is no partial or prefix matching.
//!
//! The identifier is not treated as a secret and the comparison is plain
//! equality, so a device able to report the same identifier string can
//! dismiss the alarm.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque, case-insensitive tag identifier.
///
/// The original spelling is preserved for display and persistence; only
/// comparison folds case.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive exact match.
    pub fn matches(&self, other: &Credential) -> bool {
        validate(self, other)
    }
}

impl PartialEq for Credential {
    fn eq(&self, other: &Self) -> bool {
        validate(self, other)
    }
}

impl Eq for Credential {}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Credential {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Credential {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Whether `scanned` is the credential `expected`.
///
/// Exact match after case folding. Has no side effects.
pub fn validate(scanned: &Credential, expected: &Credential) -> bool {
    // Fast path for the common hex-identifier case; fall back to full
    // Unicode case folding for anything else.
    if scanned.0.is_ascii() && expected.0.is_ascii() {
        return scanned.0.eq_ignore_ascii_case(&expected.0);
    }
    scanned.0.to_lowercase() == expected.0.to_lowercase()
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("0455b45f396180", "0455B45F396180", true; "lowercase scan of uppercase tag")]
    #[test_case("0455B45F396180", "0455B45F396180", true; "identical")]
    #[test_case("0455B45F39618", "0455B45F396180", false; "one digit short")]
    #[test_case("0455B45F3961800", "0455B45F396180", false; "one digit long")]
    #[test_case("AAAA", "0455B45F396180", false; "different tag")]
    #[test_case("", "0455B45F396180", false; "empty scan")]
    #[test_case("0455B45F396180 ", "0455B45F396180", false; "trailing space is significant")]
    #[test_case("ÄBC", "äbc", true; "non-ascii case folding")]
    fn validates(scanned: &str, expected: &str, valid: bool) {
        assert_eq!(validate(&scanned.into(), &expected.into()), valid);
    }

    #[test]
    fn preserves_original_spelling() {
        let credential = Credential::new("0455b45F");
        assert_eq!(credential.to_string(), "0455b45F");
        assert_eq!(
            serde_json::to_string(&credential).unwrap(),
            "\"0455b45F\""
        );
    }

    #[test]
    fn equality_folds_case() {
        assert_eq!(Credential::new("abc"), Credential::new("ABC"));
        assert!(Credential::new("abc").matches(&Credential::new("aBc")));
    }
}
