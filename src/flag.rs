// Keyed one-way derivation of challenge flags. A flag binds a challenge
// to the launching user and course, so copied flags fail verification
// for anyone else.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

/// Derive the flag for a challenge, optionally bound to a user and course.
/// Same inputs always yield the same flag.
pub fn derive_flag(
    key: &str,
    challenge_id: &str,
    user_id: Option<&str>,
    course_id: Option<&str>,
) -> String {
    format!("flag{{{}}}", hex::encode(flag_mac(key, challenge_id, user_id, course_id)))
}

/// Recompute-and-compare verification. The MAC comparison runs in
/// constant time via `Mac::verify_slice`.
pub fn verify_flag(
    key: &str,
    submitted: &str,
    challenge_id: &str,
    user_id: Option<&str>,
    course_id: Option<&str>,
) -> bool {
    let inner = match submitted.strip_prefix("flag{").and_then(|s| s.strip_suffix('}')) {
        Some(inner) => inner,
        None => return false,
    };
    let digest = match hex::decode(inner) {
        Ok(d) => d,
        Err(_) => return false,
    };

    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(canonical_components(challenge_id, user_id, course_id).as_bytes());
    mac.verify_slice(&digest).is_ok()
}

fn flag_mac(
    key: &str,
    challenge_id: &str,
    user_id: Option<&str>,
    course_id: Option<&str>,
) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(canonical_components(challenge_id, user_id, course_id).as_bytes());
    mac.finalize().into_bytes().to_vec()
}

// Canonical JSON over whichever components are present. BTreeMap keeps
// the key order deterministic.
fn canonical_components(
    challenge_id: &str,
    user_id: Option<&str>,
    course_id: Option<&str>,
) -> String {
    let mut components = BTreeMap::new();
    components.insert("challenge", challenge_id);
    if let Some(user) = user_id {
        components.insert("user", user);
    }
    if let Some(course) = course_id {
        components.insert("course", course);
    }
    serde_json::to_string(&components).expect("string map serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "test-flag-key";

    #[test]
    fn derived_flag_verifies() {
        let flag = derive_flag(KEY, "sql-injection", Some("u1"), Some("101"));
        assert!(flag.starts_with("flag{") && flag.ends_with('}'));
        assert!(verify_flag(KEY, &flag, "sql-injection", Some("u1"), Some("101")));
    }

    #[test]
    fn changing_any_component_changes_the_flag() {
        let base = derive_flag(KEY, "xss", Some("u1"), Some("101"));
        assert_ne!(base, derive_flag(KEY, "csrf", Some("u1"), Some("101")));
        assert_ne!(base, derive_flag(KEY, "xss", Some("u2"), Some("101")));
        assert_ne!(base, derive_flag(KEY, "xss", Some("u1"), Some("102")));
        assert_ne!(base, derive_flag(KEY, "xss", None, Some("101")));
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_flag(KEY, "xss", Some("u1"), None);
        let b = derive_flag(KEY, "xss", Some("u1"), None);
        assert_eq!(a, b);
    }

    #[test]
    fn wrong_context_fails_verification() {
        let flag = derive_flag(KEY, "xss", Some("u1"), Some("101"));
        assert!(!verify_flag(KEY, &flag, "xss", Some("u2"), Some("101")));
        assert!(!verify_flag(KEY, &flag, "xss", Some("u1"), None));
        assert!(!verify_flag("other-key", &flag, "xss", Some("u1"), Some("101")));
    }

    #[test]
    fn malformed_submissions_are_rejected() {
        assert!(!verify_flag(KEY, "flag{zzzz}", "xss", None, None));
        assert!(!verify_flag(KEY, "no-wrapper", "xss", None, None));
        assert!(!verify_flag(KEY, "flag{", "xss", None, None));
    }
}
