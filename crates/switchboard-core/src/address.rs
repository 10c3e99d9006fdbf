//! Protocol address handling.
//!
//! Contacts are keyed by the normalized phone form of an address: the user
//! part before `@`, without any `:device` suffix, reduced to ASCII digits.
//! Group and broadcast scope is decided on the raw address, before
//! normalization throws the domain away.

/// Address suffixes that denote multi-party conversations.
const NON_DIRECT_SUFFIXES: &[&str] = &["@g.us", "@broadcast", "@newsletter"];

/// True when the address names a one-to-one conversation.
pub fn is_direct(raw: &str) -> bool {
    let raw = raw.trim();
    if raw.is_empty() {
        return false;
    }
    let lower = raw.to_ascii_lowercase();
    !NON_DIRECT_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// Canonical contact key for a raw protocol address.
///
/// `"5559999:12@s.whatsapp.net"` and `"+1 (555) 9999"` both reduce to
/// their digits. An address without any digits is kept, trimmed and
/// lowercased, so it still maps to a stable key.
pub fn normalize(raw: &str) -> String {
    let user = raw.trim().split('@').next().unwrap_or_default();
    let user = user.split(':').next().unwrap_or_default();
    let digits: String = user.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        user.trim().to_ascii_lowercase()
    } else {
        digits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_and_broadcast_are_not_direct() {
        assert!(!is_direct("120363025@g.us"));
        assert!(!is_direct("status@broadcast"));
        assert!(!is_direct("1234@newsletter"));
        assert!(!is_direct("   "));
        assert!(is_direct("5559999@s.whatsapp.net"));
        assert!(is_direct("5559999"));
    }

    #[test]
    fn suffix_check_is_case_insensitive() {
        assert!(!is_direct("1203@G.US"));
    }

    #[test]
    fn normalize_strips_domain_and_device() {
        assert_eq!(normalize("5559999@s.whatsapp.net"), "5559999");
        assert_eq!(normalize("5551234:17@s.whatsapp.net"), "5551234");
        assert_eq!(normalize("5559999"), "5559999");
    }

    #[test]
    fn normalize_drops_formatting() {
        assert_eq!(normalize("+1 (555) 999-0000"), "15559990000");
    }

    #[test]
    fn normalize_keeps_non_numeric_handles() {
        assert_eq!(normalize("  Alice@lid "), "alice");
    }
}
