//! The in-memory stanza model.
//!
//! A [`Stanza`] is one top-level XML element of an XMPP stream, carried both
//! as structured fields (root name, namespace, attribute list) and as its
//! serialized XML. The two views must agree on the root element; the
//! attribute list may additionally carry values that override what is inline
//! in the XML (the list wins on serialization, see [`crate::codec`]).

/// A single XML attribute, keyed by `(name, namespace)`.
///
/// Unprefixed attributes live in the empty namespace `""`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub namespace: String,
    pub value: String,
}

impl Attribute {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            value: value.into(),
        }
    }
}

/// One XMPP stream fragment.
///
/// Immutable except for the `via` routing tag and attribute upserts.
#[derive(Debug, Clone)]
pub struct Stanza {
    name: String,
    namespace: String,
    via: Option<String>,
    attributes: Vec<Attribute>,
    xml: String,
}

impl Stanza {
    /// Create a stanza. `name` and `namespace` must match the root element
    /// of `xml`; the empty string is the canonical "no namespace" value.
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        via: Option<String>,
        xml: impl Into<String>,
        attributes: Vec<Attribute>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            via,
            attributes,
            xml: xml.into(),
        }
    }

    /// Convenience constructor for locally originated stanzas with no
    /// structured attributes, e.g. `<presence/>` probes.
    pub fn from_xml(
        name: impl Into<String>,
        namespace: impl Into<String>,
        xml: impl Into<String>,
    ) -> Self {
        Self::new(name, namespace, None, xml, Vec::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn xml(&self) -> &str {
        &self.xml
    }

    /// The local full JID this stanza arrived on or should depart through.
    pub fn via(&self) -> Option<&str> {
        self.via.as_deref()
    }

    pub fn set_via(&mut self, via: impl Into<String>) {
        self.via = Some(via.into());
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Upsert an attribute: replace the entry with the same
    /// `(name, namespace)` key, or append.
    pub fn set_attribute(&mut self, attribute: Attribute) {
        for existing in self.attributes.iter_mut() {
            if existing.name == attribute.name && existing.namespace == attribute.namespace {
                *existing = attribute;
                return;
            }
        }
        self.attributes.push(attribute);
    }

    /// Look up an attribute by name in the empty namespace.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attribute_ns(name, "")
    }

    /// Look up an attribute by name and namespace.
    pub fn attribute_ns(&self, name: &str, namespace: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|a| a.name == name && a.namespace == namespace)
    }

    /// Attribute value shorthand for the empty namespace.
    pub fn attribute_value(&self, name: &str) -> Option<&str> {
        self.attribute(name).map(|a| a.value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Stanza {
        Stanza::new(
            "message",
            "jabber:client",
            None,
            "<message to='a@b'><body>hi</body></message>",
            vec![Attribute::new("to", "", "a@b")],
        )
    }

    #[test]
    fn attribute_lookup_by_name_and_namespace() {
        let mut stanza = message();
        stanza.set_attribute(Attribute::new("lang", "http://www.w3.org/XML/1998/namespace", "en"));
        assert_eq!(stanza.attribute_value("to"), Some("a@b"));
        assert!(stanza.attribute("lang").is_none());
        assert!(stanza
            .attribute_ns("lang", "http://www.w3.org/XML/1998/namespace")
            .is_some());
    }

    #[test]
    fn set_attribute_replaces_by_key() {
        let mut stanza = message();
        stanza.set_attribute(Attribute::new("to", "", "c@d"));
        assert_eq!(stanza.attribute_value("to"), Some("c@d"));
        assert_eq!(stanza.attributes().len(), 1);
    }

    #[test]
    fn set_attribute_appends_new_key() {
        let mut stanza = message();
        stanza.set_attribute(Attribute::new("type", "", "chat"));
        assert_eq!(stanza.attributes().len(), 2);
        assert_eq!(stanza.attribute_value("type"), Some("chat"));
    }

    #[test]
    fn via_is_mutable() {
        let mut stanza = message();
        assert_eq!(stanza.via(), None);
        stanza.set_via("a@b/mobile");
        assert_eq!(stanza.via(), Some("a@b/mobile"));
    }
}
