//! Jabber ID helpers.
//!
//! A JID is `local@domain` (bare) or `local@domain/resource` (full). These
//! helpers deliberately operate on string slices: the crate never needs a
//! parsed JID type, only the three projections below.

/// Strip the resource part, turning a full JID into a bare one.
///
/// A JID without a `/` is returned unchanged.
pub fn bare_jid(jid: &str) -> &str {
    match jid.find('/') {
        Some(index) => &jid[..index],
        None => jid,
    }
}

/// The domain part of a (bare or full) JID.
pub fn domain(jid: &str) -> &str {
    let bare = bare_jid(jid);
    match bare.find('@') {
        Some(index) => &bare[index + 1..],
        None => bare,
    }
}

/// The local (user) part of a JID, or `None` for domain-only JIDs.
pub fn local_part(jid: &str) -> Option<&str> {
    let bare = bare_jid(jid);
    match bare.find('@') {
        Some(0) | None => None,
        Some(index) => Some(&bare[..index]),
    }
}

/// The resource part of a full JID, or `None` for bare JIDs.
pub fn resource(jid: &str) -> Option<&str> {
    jid.find('/').map(|index| &jid[index + 1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_jid_strips_resource() {
        assert_eq!(bare_jid("romeo@example.com/balcony"), "romeo@example.com");
        assert_eq!(bare_jid("romeo@example.com"), "romeo@example.com");
    }

    #[test]
    fn domain_of_full_and_bare() {
        assert_eq!(domain("romeo@example.com/balcony"), "example.com");
        assert_eq!(domain("romeo@example.com"), "example.com");
        assert_eq!(domain("example.com"), "example.com");
    }

    #[test]
    fn local_part_of_jid() {
        assert_eq!(local_part("romeo@example.com/balcony"), Some("romeo"));
        assert_eq!(local_part("example.com"), None);
        assert_eq!(local_part("@example.com"), None);
    }

    #[test]
    fn resource_of_jid() {
        assert_eq!(resource("romeo@example.com/balcony"), Some("balcony"));
        assert_eq!(resource("romeo@example.com"), None);
    }
}
