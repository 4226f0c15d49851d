//! Entity capabilities (XEP-0115).
//!
//! The host application describes what each account supports through
//! [`CapabilityQuery`]; this module turns that into the `ver` hash and the
//! `<presence><c/></presence>` announcement, and remembers what was last
//! announced per full JID so unchanged capabilities are not re-broadcast
//! on every tick.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ring::digest;

use crate::codec::escape_text;
use crate::stanza::Stanza;

pub const CAPS_NS: &str = "http://jabber.org/protocol/caps";

/// One disco#info identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub category: String,
    pub kind: String,
    pub lang: String,
    pub name: String,
}

impl Identity {
    pub fn new(
        category: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            kind: kind.into(),
            lang: String::new(),
            name: name.into(),
        }
    }
}

/// The discovery payload the hash is computed over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoInfo {
    pub identities: Vec<Identity>,
    pub features: Vec<String>,
}

/// Host-side description of per-account capabilities.
pub trait CapabilityQuery: Send + Sync {
    /// Capabilities of the given full JID.
    fn disco_info(&self, jid: &str) -> DiscoInfo;

    /// The caps node URI identifying the client software.
    fn node(&self) -> &str;
}

/// XEP-0115 §5 verification string: identities sorted by
/// category/type/lang, then sorted features, each terminated by `<`,
/// hashed with SHA-1 and base64-encoded.
pub fn ver_hash(info: &DiscoInfo) -> String {
    let mut identities = info.identities.clone();
    identities.sort_by(|a, b| {
        a.category
            .cmp(&b.category)
            .then(a.kind.cmp(&b.kind))
            .then(a.lang.cmp(&b.lang))
    });
    let mut features = info.features.clone();
    features.sort();
    features.dedup();

    let mut s = String::new();
    for identity in &identities {
        s.push_str(&identity.category);
        s.push('/');
        s.push_str(&identity.kind);
        s.push('/');
        s.push_str(&identity.lang);
        s.push('/');
        s.push_str(&identity.name);
        s.push('<');
    }
    for feature in &features {
        s.push_str(feature);
        s.push('<');
    }

    // SHA-1 is what the XEP mandates; it is not used for anything
    // security-relevant here.
    let hash = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, s.as_bytes());
    BASE64.encode(hash.as_ref())
}

/// Build the announcement presence carrying the caps element.
pub fn announcement(node: &str, ver: &str) -> Stanza {
    let xml = format!(
        "<presence><c xmlns='{CAPS_NS}' hash='sha-1' node='{}' ver='{}'/></presence>",
        escape_text(node),
        escape_text(ver)
    );
    Stanza::from_xml("presence", "", xml)
}

/// Bounded LRU of `full JID -> last announced ver hash`.
///
/// Eviction drops the least recently touched entry, which at worst causes
/// one redundant re-announcement for that JID later.
#[derive(Debug)]
pub struct VerificationCache {
    capacity: usize,
    // Most recently used at the front. Linear scans are fine at the
    // capacities involved here.
    entries: Vec<(String, String)>,
}

impl VerificationCache {
    pub const DEFAULT_CAPACITY: usize = 100;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::new(),
        }
    }

    /// Whether `jid` most recently announced `ver`. Touches the entry.
    pub fn is_current(&mut self, jid: &str, ver: &str) -> bool {
        if let Some(index) = self.entries.iter().position(|(j, _)| j == jid) {
            let entry = self.entries.remove(index);
            let hit = entry.1 == ver;
            self.entries.insert(0, entry);
            return hit;
        }
        false
    }

    /// Record that `jid` announced `ver`.
    pub fn record(&mut self, jid: &str, ver: &str) {
        if let Some(index) = self.entries.iter().position(|(j, _)| j == jid) {
            self.entries.remove(index);
        }
        self.entries.insert(0, (jid.to_string(), ver.to_string()));
        self.entries.truncate(self.capacity);
    }

    /// Drop the entry for `jid`, forcing the next check to miss. Used when
    /// a re-announcement is due regardless of the cached value.
    pub fn invalidate(&mut self, jid: &str) {
        self.entries.retain(|(j, _)| j != jid);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for VerificationCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The worked example from XEP-0115 §5.2 ("Exodus 0.9.1").
    fn exodus() -> DiscoInfo {
        DiscoInfo {
            identities: vec![Identity::new("client", "pc", "Exodus 0.9.1")],
            features: vec![
                "http://jabber.org/protocol/muc".to_string(),
                "http://jabber.org/protocol/disco#items".to_string(),
                "http://jabber.org/protocol/caps".to_string(),
                "http://jabber.org/protocol/disco#info".to_string(),
            ],
        }
    }

    #[test]
    fn xep0115_worked_example() {
        assert_eq!(ver_hash(&exodus()), "QgayPKawpkPSDYmwT/WM94uAlu0=");
    }

    #[test]
    fn hash_is_order_independent() {
        let mut reversed = exodus();
        reversed.features.reverse();
        assert_eq!(ver_hash(&reversed), ver_hash(&exodus()));
    }

    #[test]
    fn hash_changes_with_features() {
        let mut extended = exodus();
        extended.features.push("urn:xmpp:ping".to_string());
        assert_ne!(ver_hash(&extended), ver_hash(&exodus()));
    }

    #[test]
    fn announcement_carries_caps_element() {
        let stanza = announcement("https://example.org/client", "QgayPKawpkPSDYmwT/WM94uAlu0=");
        assert_eq!(stanza.name(), "presence");
        assert!(stanza.xml().contains(CAPS_NS));
        assert!(stanza.xml().contains("ver='QgayPKawpkPSDYmwT/WM94uAlu0='"));
        assert!(stanza.xml().contains("hash='sha-1'"));
    }

    #[test]
    fn cache_hits_and_misses() {
        let mut cache = VerificationCache::new(10);
        assert!(!cache.is_current("a@b/r", "v1"));
        cache.record("a@b/r", "v1");
        assert!(cache.is_current("a@b/r", "v1"));
        assert!(!cache.is_current("a@b/r", "v2"));
        cache.record("a@b/r", "v2");
        assert!(cache.is_current("a@b/r", "v2"));
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let mut cache = VerificationCache::new(2);
        cache.record("one@x/r", "v");
        cache.record("two@x/r", "v");
        // Touch "one" so "two" becomes the eviction candidate.
        assert!(cache.is_current("one@x/r", "v"));
        cache.record("three@x/r", "v");
        assert_eq!(cache.len(), 2);
        assert!(cache.is_current("one@x/r", "v"));
        assert!(!cache.is_current("two@x/r", "v"));
    }

    #[test]
    fn invalidate_forces_a_miss() {
        let mut cache = VerificationCache::new(10);
        cache.record("a@b/r", "v1");
        cache.invalidate("a@b/r");
        assert!(!cache.is_current("a@b/r", "v1"));
    }
}
