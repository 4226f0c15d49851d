//! XMPP XML codec: stanza framing, parsing and serialization.
//!
//! Three layers live here:
//!
//! - [`next_frame`] finds the boundary of one complete top-level element in
//!   a raw byte buffer fed from the socket, handling the `<stream:stream>`
//!   open and close tags that never nest like ordinary stanzas.
//! - [`read_stanza`] turns one complete element into a [`Stanza`],
//!   re-serializing it so that every element uses the empty namespace
//!   prefix (some servers reject prefixed stanza roots), and capturing the
//!   root name, namespace and attributes as structured fields.
//! - [`write_stanza`] renders a [`Stanza`] back to bytes, merging the
//!   structured attribute list with the attributes inline in the raw XML.
//!   On a key collision the attribute list wins.
//!
//! All parser failures, including quick-xml internal errors on malformed
//! input, surface as `ErrorKind::Malformed`.

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::{NsReader, Reader};

use crate::error::{Result, XmppError};
use crate::stanza::{Attribute, Stanza};

/// Namespace of `<stream:stream>` and `<stream:features>`.
pub const STREAMS_NS: &str = "http://etherx.jabber.org/streams";

/// The predeclared `xml:` namespace.
const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

/// One framing unit extracted from the inbound byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The server's `<stream:stream ...>` opening tag, verbatim.
    StreamOpen(String),
    /// The `</stream:stream>` closing tag.
    StreamClose,
    /// One complete top-level element, verbatim.
    Stanza(String),
}

/// Extract the next complete frame from `buffer`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame;
/// the caller keeps the bytes and retries after the next socket read. On
/// success the second tuple field is the number of bytes consumed.
///
/// Bytes that can never become a valid frame, no matter what follows, are
/// a malformed-stream error. Without that distinction a garbage-emitting
/// peer would grow the buffer forever while looking alive.
pub fn next_frame(buffer: &[u8]) -> Result<Option<(Frame, usize)>> {
    // The stream close tag has no opening counterpart in the buffer and
    // must be matched textually before the XML scan.
    let Some(first) = buffer
        .iter()
        .position(|&b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
    else {
        return Ok(None);
    };
    if buffer[first..].starts_with(b"</stream:stream>") {
        return Ok(Some((Frame::StreamClose, first + b"</stream:stream>".len())));
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut start: Option<usize> = None;

    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event() {
            // Stream-level metadata before the stanza.
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_))
            | Ok(Event::DocType(_)) => continue,
            Ok(Event::Start(e)) => {
                if depth == 0 && is_stream_tag(&e) {
                    let end = reader.buffer_position() as usize;
                    let text = String::from_utf8_lossy(&buffer[..end]).into_owned();
                    return Ok(Some((Frame::StreamOpen(text), end)));
                }
                if depth == 0 {
                    start = Some(pos);
                }
                depth += 1;
            }
            Ok(Event::Empty(e)) => {
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    if is_stream_tag(&e) {
                        let text = String::from_utf8_lossy(&buffer[..end]).into_owned();
                        return Ok(Some((Frame::StreamOpen(text), end)));
                    }
                    let text = String::from_utf8_lossy(&buffer[pos..end]).into_owned();
                    return Ok(Some((Frame::Stanza(text), end)));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(from) = start {
                        let end = reader.buffer_position() as usize;
                        let text = String::from_utf8_lossy(&buffer[from..end]).into_owned();
                        return Ok(Some((Frame::Stanza(text), end)));
                    }
                }
            }
            // Incomplete stanza, wait for more bytes. Every SyntaxError
            // variant means the input ended inside a construct.
            Ok(Event::Eof) => return Ok(None),
            Err(quick_xml::Error::Syntax(_)) => return Ok(None),
            // Ill-formed markup stays ill-formed however many bytes arrive.
            Err(e) => return Err(remap_parse_error(e)),
        }
    }
}

fn is_stream_tag(e: &BytesStart<'_>) -> bool {
    e.name().as_ref() == b"stream:stream" || e.name().local_name().as_ref() == b"stream"
}

/// Parse one complete top-level element into a [`Stanza`].
///
/// The raw XML stored on the stanza is the *normalized* serialization:
/// element namespace prefixes are forced to the empty prefix, namespace
/// declarations are re-emitted only where the effective namespace changes.
pub fn read_stanza(xml: &str) -> Result<Stanza> {
    let mut reader = ns_reader(xml);
    let mut out = String::with_capacity(xml.len());
    let mut ns_stack: Vec<String> = vec![String::new()];
    let mut root: Option<(String, String, Vec<Attribute>)> = None;

    loop {
        match reader.read_event().map_err(remap_parse_error)? {
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => continue,
            Event::Start(e) => {
                let (ns, local, attributes) = emit_start(&reader, &e, &mut out, &mut ns_stack, false)?;
                if root.is_none() {
                    root = Some((local, ns, attributes));
                }
            }
            Event::Empty(e) => {
                let (ns, local, attributes) = emit_start(&reader, &e, &mut out, &mut ns_stack, true)?;
                if root.is_none() {
                    let (name, namespace, attrs) = (local, ns, attributes);
                    return Ok(Stanza::new(name, namespace, None, out, attrs));
                }
            }
            Event::Text(e) => {
                out.push_str(std::str::from_utf8(&e).map_err(|err| {
                    XmppError::with_source(crate::error::ErrorKind::Malformed, "non-utf8 text", err)
                })?);
            }
            Event::CData(e) => {
                out.push_str("<![CDATA[");
                out.push_str(&String::from_utf8_lossy(&e));
                out.push_str("]]>");
            }
            Event::End(e) => {
                out.push_str("</");
                out.push_str(&String::from_utf8_lossy(e.name().local_name().as_ref()));
                out.push('>');
                ns_stack.pop();
                if ns_stack.len() == 1 {
                    let (name, namespace, attrs) =
                        root.ok_or_else(|| XmppError::malformed("end tag before any start tag"))?;
                    return Ok(Stanza::new(name, namespace, None, out, attrs));
                }
            }
            Event::Eof => {
                return Err(XmppError::malformed("unexpected end of stream"));
            }
        }
    }
}

/// Copy one complete element subtree, applying the same empty-prefix
/// normalization as [`read_stanza`] but without structured capture.
///
/// `inherited_ns` is the default namespace in effect at the insertion
/// point of the output; namespace declarations are only emitted where the
/// subtree deviates from it.
pub fn copy_stanza_tree(xml: &str, inherited_ns: &str) -> Result<String> {
    let mut reader = ns_reader(xml);
    let mut out = String::with_capacity(xml.len());
    copy_subtree_events(&mut reader, &mut out, inherited_ns)?;
    Ok(out)
}

/// Serialize a stanza, merging its attribute list over the attributes
/// inline in the raw XML. List entries win on a `(namespace, name)` key
/// collision; inline attributes not shadowed by the list are preserved.
pub fn write_stanza(stanza: &Stanza) -> Result<String> {
    let mut reader = ns_reader(stanza.xml());

    // Locate the root element, skipping stream-level metadata.
    let root = loop {
        match reader.read_event().map_err(remap_parse_error)? {
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => continue,
            Event::Start(e) => break (e.into_owned(), false),
            Event::Empty(e) => break (e.into_owned(), true),
            _ => return Err(XmppError::malformed("stanza xml has no root element")),
        }
    };
    let (root_tag, root_empty) = root;

    let mut out = String::with_capacity(stanza.xml().len() + 32);
    out.push('<');
    out.push_str(stanza.name());
    if !stanza.namespace().is_empty() {
        out.push_str(" xmlns='");
        out.push_str(&escape_text(stanza.namespace()));
        out.push('\'');
    }

    // List attributes first, then inline attributes that were not
    // overridden, in document order.
    let mut written: Vec<(String, String)> = Vec::new();
    for attr in stanza.attributes() {
        emit_attribute(&mut out, &attr.namespace, &attr.name, &escape_text(&attr.value));
        written.push((attr.namespace.clone(), attr.name.clone()));
    }
    for attr in root_tag.attributes() {
        let attr = attr.map_err(|e| {
            XmppError::with_source(crate::error::ErrorKind::Malformed, "bad attribute", e)
        })?;
        if is_xmlns(attr.key.as_ref()) {
            continue;
        }
        let (ns, local) = resolve_attribute(&reader, attr.key)?;
        if written.iter().any(|(wns, wname)| *wns == ns && *wname == local) {
            continue;
        }
        let raw = String::from_utf8_lossy(&attr.value).into_owned();
        emit_attribute(&mut out, &ns, &local, &raw);
    }

    if root_empty {
        out.push_str("/>");
        return Ok(out);
    }

    out.push('>');
    copy_subtree_events(&mut reader, &mut out, stanza.namespace())?;
    out.push_str("</");
    out.push_str(stanza.name());
    out.push('>');
    Ok(out)
}

/// Copy events until the depth returns to the level at which the reader
/// currently stands. Assumes the opening tag of the enclosing element has
/// already been consumed.
fn copy_subtree_events(
    reader: &mut NsReader<&[u8]>,
    out: &mut String,
    inherited_ns: &str,
) -> Result<()> {
    let mut ns_stack: Vec<String> = vec![inherited_ns.to_string()];
    loop {
        match reader.read_event().map_err(remap_parse_error)? {
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => continue,
            Event::Start(e) => {
                emit_start(reader, &e, out, &mut ns_stack, false)?;
            }
            Event::Empty(e) => {
                emit_start(reader, &e, out, &mut ns_stack, true)?;
            }
            Event::Text(e) => {
                out.push_str(&String::from_utf8_lossy(&e));
            }
            Event::CData(e) => {
                out.push_str("<![CDATA[");
                out.push_str(&String::from_utf8_lossy(&e));
                out.push_str("]]>");
            }
            Event::End(e) => {
                if ns_stack.len() == 1 {
                    // Matching end tag of the enclosing element.
                    return Ok(());
                }
                out.push_str("</");
                out.push_str(&String::from_utf8_lossy(e.name().local_name().as_ref()));
                out.push('>');
                ns_stack.pop();
            }
            Event::Eof => return Ok(()),
        }
    }
}

/// Emit a start (or empty) tag with the empty element prefix, declaring
/// the namespace inline when it differs from the inherited default.
///
/// Returns the resolved namespace, local name and structured attributes of
/// the element.
fn emit_start(
    reader: &NsReader<&[u8]>,
    e: &BytesStart<'_>,
    out: &mut String,
    ns_stack: &mut Vec<String>,
    empty: bool,
) -> Result<(String, String, Vec<Attribute>)> {
    let ns = resolve_element_ns(reader, e)?;
    let local = String::from_utf8_lossy(e.name().local_name().as_ref()).into_owned();

    let inherited = ns_stack.last().cloned().unwrap_or_default();
    out.push('<');
    out.push_str(&local);
    if ns != inherited {
        out.push_str(" xmlns='");
        out.push_str(&escape_text(&ns));
        out.push('\'');
    }

    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| {
            XmppError::with_source(crate::error::ErrorKind::Malformed, "bad attribute", err)
        })?;
        if is_xmlns(attr.key.as_ref()) {
            continue;
        }
        let (attr_ns, attr_local) = resolve_attribute(reader, attr.key)?;
        let raw = String::from_utf8_lossy(&attr.value).into_owned();
        emit_attribute(out, &attr_ns, &attr_local, &raw);
        let value = attr.unescape_value().map_err(remap_parse_error)?.into_owned();
        attributes.push(Attribute::new(attr_local, attr_ns, value));
    }

    if empty {
        out.push_str("/>");
    } else {
        out.push('>');
        ns_stack.push(ns.clone());
    }
    Ok((ns, local, attributes))
}

/// Append one attribute, re-qualifying namespaced attributes.
///
/// `escaped_value` must already be escaped for single-quoted context.
fn emit_attribute(out: &mut String, ns: &str, name: &str, escaped_value: &str) {
    out.push(' ');
    if ns == XML_NS {
        out.push_str("xml:");
    } else if !ns.is_empty() {
        // Attributes in foreign namespaces are rare in XMPP; declare an
        // ad-hoc prefix inline.
        out.push_str("xmlns:a0='");
        out.push_str(&escape_text(ns));
        out.push_str("' a0:");
    }
    out.push_str(name);
    out.push_str("='");
    out.push_str(escaped_value);
    out.push('\'');
}

fn resolve_element_ns(reader: &NsReader<&[u8]>, e: &BytesStart<'_>) -> Result<String> {
    match reader.resolve_element(e.name()).0 {
        ResolveResult::Bound(ns) => Ok(String::from_utf8_lossy(ns.as_ref()).into_owned()),
        ResolveResult::Unbound => Ok(String::new()),
        // Stream fragments arrive without the enclosing <stream:stream>
        // element that binds the stream prefix.
        ResolveResult::Unknown(prefix) if prefix == b"stream" => Ok(STREAMS_NS.to_string()),
        ResolveResult::Unknown(prefix) => Err(XmppError::malformed(format!(
            "unbound namespace prefix '{}'",
            String::from_utf8_lossy(&prefix)
        ))),
    }
}

fn resolve_attribute(
    reader: &NsReader<&[u8]>,
    key: quick_xml::name::QName<'_>,
) -> Result<(String, String)> {
    let local = String::from_utf8_lossy(key.local_name().as_ref()).into_owned();
    let ns = match reader.resolve_attribute(key).0 {
        ResolveResult::Bound(ns) => String::from_utf8_lossy(ns.as_ref()).into_owned(),
        ResolveResult::Unbound => String::new(),
        ResolveResult::Unknown(prefix) if prefix == b"xml" => XML_NS.to_string(),
        ResolveResult::Unknown(prefix) => {
            return Err(XmppError::malformed(format!(
                "unbound attribute prefix '{}'",
                String::from_utf8_lossy(&prefix)
            )))
        }
    };
    Ok((ns, local))
}

fn is_xmlns(key: &[u8]) -> bool {
    key == b"xmlns" || key.starts_with(b"xmlns:")
}

/// Escape a string for use as XML text or attribute content.
pub fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn ns_reader(xml: &str) -> NsReader<&[u8]> {
    let mut reader = NsReader::from_reader(xml.as_bytes());
    // End-name checking stays on: a mismatched close tag must surface as a
    // malformed stream, not as a silently reshaped tree.
    reader.config_mut().trim_text(false);
    reader
}

/// Remap any quick-xml failure to a malformed-stream error. The parser's
/// own error variants (including internal ones raised on garbage input)
/// must never leak out of the codec.
fn remap_parse_error(e: quick_xml::Error) -> XmppError {
    XmppError::with_source(crate::error::ErrorKind::Malformed, "xml parse failed", e)
}

// ---------------------------------------------------------------------------
// Minimal element tree for negotiation-time inspection.
// ---------------------------------------------------------------------------

/// A parsed XML element, used to inspect `<stream:features>`, SASL replies
/// and bind results without another serialization pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub namespace: String,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

/// Child node of an [`Element`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    /// First child element matching the namespace/name criteria; `None`
    /// criteria match anything.
    pub fn first_child(&self, namespace: Option<&str>, name: Option<&str>) -> Option<&Element> {
        self.children.iter().find_map(|node| match node {
            Node::Element(el) if el.matches(namespace, name) => Some(el),
            _ => None,
        })
    }

    pub fn has_child(&self, namespace: Option<&str>, name: Option<&str>) -> bool {
        self.first_child(namespace, name).is_some()
    }

    /// All child elements matching the criteria, in document order.
    pub fn children_named<'a>(
        &'a self,
        namespace: Option<&'a str>,
        name: Option<&'a str>,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter_map(move |node| match node {
            Node::Element(el) if el.matches(namespace, name) => Some(el),
            _ => None,
        })
    }

    fn matches(&self, namespace: Option<&str>, name: Option<&str>) -> bool {
        namespace.map_or(true, |ns| self.namespace == ns)
            && name.map_or(true, |n| self.name == n)
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    pub fn attribute_value(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name == name && a.namespace.is_empty())
            .map(|a| a.value.as_str())
    }
}

/// Parse one complete element into a tree.
pub fn parse_tree(xml: &str) -> Result<Element> {
    let mut reader = ns_reader(xml);
    let mut stack: Vec<Element> = Vec::new();

    loop {
        match reader.read_event().map_err(remap_parse_error)? {
            Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => continue,
            Event::Start(e) => {
                stack.push(element_from_start(&reader, &e)?);
            }
            Event::Empty(e) => {
                let element = element_from_start(&reader, &e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(element)),
                    None => return Ok(element),
                }
            }
            Event::Text(e) => {
                if let Some(parent) = stack.last_mut() {
                    let text = e.unescape().map_err(remap_parse_error)?.into_owned();
                    parent.children.push(Node::Text(text));
                }
            }
            Event::CData(e) => {
                if let Some(parent) = stack.last_mut() {
                    let text = String::from_utf8_lossy(&e).into_owned();
                    parent.children.push(Node::Text(text));
                }
            }
            Event::End(_) => {
                let done = stack
                    .pop()
                    .ok_or_else(|| XmppError::malformed("end tag before any start tag"))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(Node::Element(done)),
                    None => return Ok(done),
                }
            }
            Event::Eof => return Err(XmppError::malformed("unexpected end of stream")),
        }
    }
}

fn element_from_start(reader: &NsReader<&[u8]>, e: &BytesStart<'_>) -> Result<Element> {
    let namespace = resolve_element_ns(reader, e)?;
    let name = String::from_utf8_lossy(e.name().local_name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| {
            XmppError::with_source(crate::error::ErrorKind::Malformed, "bad attribute", err)
        })?;
        if is_xmlns(attr.key.as_ref()) {
            continue;
        }
        let (ns, local) = resolve_attribute(reader, attr.key)?;
        let value = attr.unescape_value().map_err(remap_parse_error)?.into_owned();
        attributes.push(Attribute::new(local, ns, value));
    }
    Ok(Element {
        name,
        namespace,
        attributes,
        children: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- framing ---

    #[test]
    fn frame_stream_opening() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>";
        let (frame, consumed) = next_frame(buf).unwrap().unwrap();
        assert!(matches!(frame, Frame::StreamOpen(ref s) if s.contains("<stream:stream")));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn frame_stream_closing() {
        let (frame, consumed) = next_frame(b"  </stream:stream>").unwrap().unwrap();
        assert_eq!(frame, Frame::StreamClose);
        assert_eq!(consumed, b"  </stream:stream>".len());
    }

    #[test]
    fn frame_self_closing_stanza() {
        let (frame, consumed) = next_frame(b"<presence/>").unwrap().unwrap();
        assert_eq!(frame, Frame::Stanza("<presence/>".to_string()));
        assert_eq!(consumed, 11);
    }

    #[test]
    fn frame_nested_stanza() {
        let buf = b"<iq type='result'><query xmlns='jabber:iq:roster'><item jid='a@b'/></query></iq>";
        let (frame, consumed) = next_frame(buf).unwrap().unwrap();
        let Frame::Stanza(text) = frame else { panic!() };
        assert!(text.starts_with("<iq"));
        assert!(text.ends_with("</iq>"));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn frame_multiple_stanzas_sequentially() {
        let buf = b"<presence from='a@b'/><message to='c@d'><body>Hello</body></message>";
        let mut offset = 0;
        let (frame1, c1) = next_frame(&buf[offset..]).unwrap().unwrap();
        offset += c1;
        let Frame::Stanza(s1) = frame1 else { panic!() };
        assert!(s1.contains("presence"));
        let (frame2, c2) = next_frame(&buf[offset..]).unwrap().unwrap();
        offset += c2;
        let Frame::Stanza(s2) = frame2 else { panic!() };
        assert!(s2.contains("Hello"));
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn frame_incomplete_returns_none() {
        assert!(next_frame(b"<iq type='get'><query xmlns='jabber:iq:roster'>").unwrap().is_none());
        assert!(next_frame(b"").unwrap().is_none());
        assert!(next_frame(b"   \n ").unwrap().is_none());
        assert!(next_frame(b"<messa").unwrap().is_none());
    }

    #[test]
    fn frame_unfixable_garbage_is_malformed() {
        // Complete but ill-formed markup can never become a frame, no
        // matter how many bytes follow.
        let err = next_frame(b"<!DOCTYPE>").unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn frame_features_complete_only_when_closed() {
        assert!(next_frame(b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
            .unwrap()
            .is_none());
        let buf = b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>";
        let (frame, consumed) = next_frame(buf).unwrap().unwrap();
        assert!(matches!(frame, Frame::Stanza(ref s) if s.contains("starttls")));
        assert_eq!(consumed, buf.len());
    }

    // --- read_stanza ---

    #[test]
    fn read_captures_root_fields() {
        let stanza = read_stanza(
            "<iq xmlns='jabber:client' type='result' id='b1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>a@b/r</jid></bind></iq>",
        )
        .unwrap();
        assert_eq!(stanza.name(), "iq");
        assert_eq!(stanza.namespace(), "jabber:client");
        assert_eq!(stanza.attribute_value("type"), Some("result"));
        assert_eq!(stanza.attribute_value("id"), Some("b1"));
        assert!(stanza.xml().contains("<jid>a@b/r</jid>"));
    }

    #[test]
    fn read_normalizes_named_prefix_to_empty() {
        let stanza = read_stanza(
            "<n0:iq xmlns:n0='jabber:client' to='romeo@example.com'><n0:query/></n0:iq>",
        )
        .unwrap();
        assert_eq!(stanza.name(), "iq");
        assert_eq!(stanza.namespace(), "jabber:client");
        assert!(stanza.xml().starts_with("<iq xmlns='jabber:client'"));
        assert!(!stanza.xml().contains("n0"));
        // The child inherits jabber:client and needs no re-declaration.
        assert!(stanza.xml().contains("<query/>"));
    }

    #[test]
    fn read_empty_namespace_defaults_to_empty_string() {
        let stanza = read_stanza("<presence/>").unwrap();
        assert_eq!(stanza.namespace(), "");
        assert_eq!(stanza.xml(), "<presence/>");
    }

    #[test]
    fn read_keeps_child_namespace_declarations() {
        let stanza = read_stanza(
            "<message xmlns='jabber:client'><active xmlns='http://jabber.org/protocol/chatstates'/></message>",
        )
        .unwrap();
        assert!(stanza
            .xml()
            .contains("<active xmlns='http://jabber.org/protocol/chatstates'/>"));
    }

    #[test]
    fn read_resolves_unbound_stream_prefix() {
        let stanza = read_stanza("<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>").unwrap();
        assert_eq!(stanza.name(), "features");
        assert_eq!(stanza.namespace(), STREAMS_NS);
    }

    #[test]
    fn read_preserves_text_and_entities() {
        let stanza =
            read_stanza("<message><body>5 &lt; 6 &amp; 7</body></message>").unwrap();
        assert!(stanza.xml().contains("5 &lt; 6 &amp; 7"));
    }

    #[test]
    fn read_truncated_input_is_malformed() {
        let err = read_stanza("<iq><query>").unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn read_garbage_is_malformed_not_panic() {
        for input in ["<iq", "</>", "<a></b></a>", "<a x='1", "<\u{0}>"] {
            match read_stanza(input) {
                Ok(_) => {}
                Err(e) => assert!(e.is_malformed(), "{input:?} gave {e:?}"),
            }
        }
    }

    // --- round-trip / write_stanza ---

    #[test]
    fn round_trip_is_xml_equivalent() {
        let input = "<message xmlns='jabber:client' to='a@b' type='chat'><body>Hello, world!</body><active xmlns='http://jabber.org/protocol/chatstates'/></message>";
        let stanza = read_stanza(input).unwrap();
        let output = write_stanza(&stanza).unwrap();
        let reparsed = parse_tree(&output).unwrap();
        let original = parse_tree(input).unwrap();
        assert_eq!(reparsed, original);
    }

    #[test]
    fn round_trip_empty_element() {
        let stanza = read_stanza("<presence xmlns='jabber:client'/>").unwrap();
        let output = write_stanza(&stanza).unwrap();
        assert_eq!(parse_tree(&output).unwrap(), parse_tree("<presence xmlns='jabber:client'/>").unwrap());
    }

    #[test]
    fn write_attribute_list_wins_over_inline() {
        let mut stanza = read_stanza("<message xmlns='jabber:client' to='old@example.com'><body>x</body></message>").unwrap();
        stanza.set_attribute(Attribute::new("to", "", "new@example.com"));
        let output = write_stanza(&stanza).unwrap();
        assert!(output.contains("to='new@example.com'"));
        assert!(!output.contains("old@example.com"));
    }

    #[test]
    fn write_preserves_unshadowed_inline_attributes() {
        let mut stanza =
            read_stanza("<message xmlns='jabber:client' id='m1' to='a@b'/>").unwrap();
        stanza.set_attribute(Attribute::new("from", "", "me@example.com/r"));
        let output = write_stanza(&stanza).unwrap();
        assert!(output.contains("id='m1'"));
        assert!(output.contains("to='a@b'"));
        assert!(output.contains("from='me@example.com/r'"));
    }

    #[test]
    fn write_escapes_list_attribute_values() {
        let mut stanza = read_stanza("<presence/>").unwrap();
        stanza.set_attribute(Attribute::new("status", "", "a<b&'c'"));
        let output = write_stanza(&stanza).unwrap();
        assert!(output.contains("status='a&lt;b&amp;&apos;c&apos;'"));
    }

    // --- copy_stanza_tree ---

    #[test]
    fn copy_tree_normalizes_prefixes() {
        let out = copy_stanza_tree(
            "<n0:ping xmlns:n0='urn:xmpp:ping'/>",
            "jabber:client",
        )
        .unwrap();
        assert_eq!(out, "<ping xmlns='urn:xmpp:ping'/>");
    }

    #[test]
    fn copy_tree_skips_redundant_declaration() {
        let out = copy_stanza_tree("<body xmlns='jabber:client'>hi</body>", "jabber:client").unwrap();
        assert_eq!(out, "<body>hi</body>");
    }

    // --- element tree ---

    #[test]
    fn parse_tree_navigation() {
        let features = parse_tree(
            "<stream:features>\
             <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
             <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>PLAIN</mechanism><mechanism>DIGEST-MD5</mechanism>\
             </mechanisms>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
             </stream:features>",
        )
        .unwrap();
        assert_eq!(features.namespace, STREAMS_NS);
        assert!(features.has_child(Some("urn:ietf:params:xml:ns:xmpp-tls"), Some("starttls")));
        assert!(features.has_child(Some("urn:ietf:params:xml:ns:xmpp-bind"), Some("bind")));
        let mechanisms = features
            .first_child(Some("urn:ietf:params:xml:ns:xmpp-sasl"), Some("mechanisms"))
            .unwrap();
        let names: Vec<String> = mechanisms
            .children_named(None, Some("mechanism"))
            .map(|m| m.text())
            .collect();
        assert_eq!(names, vec!["PLAIN", "DIGEST-MD5"]);
    }

    #[test]
    fn parse_tree_text_and_attributes() {
        let iq = parse_tree("<iq type='result' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>user@example.com/resource</jid></bind></iq>").unwrap();
        assert_eq!(iq.attribute_value("type"), Some("result"));
        let jid = iq
            .first_child(Some("urn:ietf:params:xml:ns:xmpp-bind"), Some("bind"))
            .and_then(|bind| bind.first_child(None, Some("jid")))
            .unwrap();
        assert_eq!(jid.text(), "user@example.com/resource");
    }

    #[test]
    fn parse_tree_truncated_is_malformed() {
        assert!(parse_tree("<features><bind/>").unwrap_err().is_malformed());
    }
}
