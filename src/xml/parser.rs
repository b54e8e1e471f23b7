//! Incremental XML framing for XMPP streams.
//!
//! An XMPP session is a single long-lived XML document, so the reader
//! must reassemble complete top-level child elements from arbitrarily
//! split TCP reads, tolerate whitespace between stanzas, and survive a
//! stream restart (TLS upgrade, SASL success) on the same buffer.
//!
//! The scanner tracks element depth byte-by-byte (quotes, comments and
//! CDATA included) and hands each completed top-level slice to minidom
//! for materialization. The slice is parsed inside a synthetic stream
//! envelope so wire elements that rely on the `stream:` prefix or the
//! default `jabber:client` namespace resolve correctly.

use minidom::Element;

use crate::error::{Error, Result};
use crate::ns;

/// Parsed attributes of the server's `<stream:stream>` open tag.
///
/// The open tag is intentionally unclosed XML (its end tag arrives at
/// session end), so it is handled apart from regular elements.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The `from` attribute (server domain).
    pub from: Option<String>,
    /// The `id` attribute (server-assigned stream id).
    pub id: Option<String>,
    /// The `version` attribute, "1.0" for RFC 6120.
    pub version: Option<String>,
    /// The `xml:lang` attribute.
    pub lang: Option<String>,
}

impl StreamHeader {
    fn parse(tag: &str) -> Result<Self> {
        let header = Self {
            from: extract_attribute(tag, "from"),
            id: extract_attribute(tag, "id"),
            version: extract_attribute(tag, "version"),
            lang: extract_attribute(tag, "xml:lang"),
        };
        if let Some(version) = &header.version {
            if version != "1.0" {
                return Err(Error::protocol(format!(
                    "unsupported stream version '{version}'"
                )));
            }
        }
        Ok(header)
    }
}

/// Extract an attribute value from a raw tag string.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let pattern = format!("{name}={quote}");
        if let Some(start) = tag.find(&pattern) {
            let value_start = start + pattern.len();
            if let Some(len) = tag[value_start..].find(quote) {
                return Some(tag[value_start..value_start + len].to_string());
            }
        }
    }
    None
}

/// One framing result from the scanner.
#[derive(Debug)]
pub enum StreamEvent {
    /// The peer's stream envelope opened.
    Header(StreamHeader),
    /// One complete top-level child element.
    Element(Element),
    /// The peer closed the stream envelope.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ScanState {
    /// Between markup, or inside character data.
    Text,
    /// Inside a tag; `quote` is the active attribute quote if any.
    Tag { quote: Option<u8> },
    /// Inside `<!-- -->`.
    Comment,
    /// Inside `<![CDATA[ ]]>`.
    Cdata,
}

/// Incremental scanner over a byte buffer.
pub struct StreamParser {
    buf: Vec<u8>,
    scan: usize,
    depth: usize,
    state: ScanState,
    tag_start: usize,
    element_start: Option<usize>,
    header_seen: bool,
}

impl StreamParser {
    /// Create an empty parser awaiting a stream header.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(8192),
            scan: 0,
            depth: 0,
            state: ScanState::Text,
            tag_start: 0,
            element_start: None,
            header_seen: false,
        }
    }

    /// Append raw bytes read from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Discard all state for a stream restart.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.scan = 0;
        self.depth = 0;
        self.state = ScanState::Text;
        self.tag_start = 0;
        self.element_start = None;
        self.header_seen = false;
    }

    /// Whether the stream header has been consumed since the last reset.
    pub fn header_seen(&self) -> bool {
        self.header_seen
    }

    /// Scan for the next complete event.
    ///
    /// Returns `None` when more bytes are needed.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        while self.scan < self.buf.len() {
            let b = self.buf[self.scan];
            match self.state {
                ScanState::Text => {
                    if b == b'<' {
                        // Need lookahead to classify the markup.
                        let Some(&next) = self.buf.get(self.scan + 1) else {
                            return Ok(None);
                        };
                        match next {
                            b'?' => {
                                // XML prolog; skip to '?>'.
                                let Some(end) = find_from(&self.buf, self.scan, b"?>") else {
                                    return Ok(None);
                                };
                                self.drop_prefix(end + 2);
                                continue;
                            }
                            b'!' => {
                                if self.buf[self.scan + 1..].len() < 3 {
                                    return Ok(None);
                                }
                                if self.buf[self.scan..].starts_with(b"<!--") {
                                    self.state = ScanState::Comment;
                                    self.scan += 4;
                                } else if self.buf[self.scan..].starts_with(b"<![CDATA[") {
                                    if self.depth == 0 {
                                        return Err(Error::protocol(
                                            "character data at stream top level",
                                        ));
                                    }
                                    self.state = ScanState::Cdata;
                                    self.scan += 9;
                                } else if self.buf.len() - self.scan < 9 {
                                    // Could still become a CDATA marker.
                                    return Ok(None);
                                } else {
                                    return Err(Error::protocol(
                                        "restricted XML declaration in stream",
                                    ));
                                }
                                continue;
                            }
                            _ => {
                                self.tag_start = self.scan;
                                if self.depth == 0 && self.element_start.is_none() && next != b'/'
                                {
                                    self.element_start = Some(self.scan);
                                }
                                self.state = ScanState::Tag { quote: None };
                                self.scan += 1;
                                continue;
                            }
                        }
                    }
                    if self.depth == 0 && self.element_start.is_none() && !b.is_ascii_whitespace()
                    {
                        return Err(Error::protocol("character data at stream top level"));
                    }
                    self.scan += 1;
                }
                ScanState::Tag { quote } => {
                    match quote {
                        Some(q) => {
                            if b == q {
                                self.state = ScanState::Tag { quote: None };
                            }
                            self.scan += 1;
                        }
                        None => {
                            if b == b'\'' || b == b'"' {
                                self.state = ScanState::Tag { quote: Some(b) };
                                self.scan += 1;
                            } else if b == b'>' {
                                self.scan += 1;
                                self.state = ScanState::Text;
                                if let Some(event) = self.finish_tag()? {
                                    return Ok(Some(event));
                                }
                            } else {
                                self.scan += 1;
                            }
                        }
                    }
                }
                ScanState::Comment => {
                    let Some(end) = find_from(&self.buf, self.scan, b"-->") else {
                        self.scan = self.buf.len().saturating_sub(2);
                        return Ok(None);
                    };
                    self.scan = end + 3;
                    self.state = ScanState::Text;
                    if self.depth == 0 && self.element_start.is_none() {
                        self.drop_prefix(self.scan);
                    }
                }
                ScanState::Cdata => {
                    let Some(end) = find_from(&self.buf, self.scan, b"]]>") else {
                        self.scan = self.buf.len().saturating_sub(2);
                        return Ok(None);
                    };
                    self.scan = end + 3;
                    self.state = ScanState::Text;
                }
            }
        }
        Ok(None)
    }

    /// Classify the tag that just closed at `self.scan`.
    fn finish_tag(&mut self) -> Result<Option<StreamEvent>> {
        let tag = &self.buf[self.tag_start..self.scan];
        let closing = tag.len() > 1 && tag[1] == b'/';
        let self_closing = tag.len() > 1 && tag[tag.len() - 2] == b'/';

        if closing {
            if self.depth == 0 {
                // Envelope close; everything before it is already consumed.
                if !self.header_seen {
                    return Err(Error::protocol("stream closed before it opened"));
                }
                self.drop_prefix(self.scan);
                return Ok(Some(StreamEvent::Closed));
            }
            self.depth -= 1;
            if self.depth == 0 {
                return self.take_element().map(Some);
            }
            return Ok(None);
        }

        if !self.header_seen && self.depth == 0 {
            // First open tag after (re)start must be the envelope.
            let tag_str = std::str::from_utf8(tag)
                .map_err(|_| Error::parse("stream header is not UTF-8"))?;
            let name = tag_name(tag_str);
            if !(name == "stream:stream" || name == "stream") {
                return Err(Error::protocol(format!(
                    "expected stream envelope, got <{name}>"
                )));
            }
            if self_closing {
                return Err(Error::protocol("self-closing stream envelope"));
            }
            let header = StreamHeader::parse(tag_str)?;
            self.header_seen = true;
            self.element_start = None;
            self.drop_prefix(self.scan);
            return Ok(Some(StreamEvent::Header(header)));
        }

        if self_closing {
            if self.depth == 0 {
                return self.take_element().map(Some);
            }
            return Ok(None);
        }

        self.depth += 1;
        Ok(None)
    }

    /// Materialize the completed top-level slice ending at `self.scan`.
    fn take_element(&mut self) -> Result<StreamEvent> {
        let start = self
            .element_start
            .take()
            .ok_or_else(|| Error::parse("element end without start"))?;
        let slice = std::str::from_utf8(&self.buf[start..self.scan])
            .map_err(|_| Error::parse("stanza is not UTF-8"))?;

        // Parse inside a synthetic envelope so the default and `stream:`
        // namespaces resolve the way they do on the wire.
        let wrapped = format!(
            "<stream:stream xmlns='{}' xmlns:stream='{}'>{}</stream:stream>",
            ns::JABBER_CLIENT,
            ns::STREAM,
            slice
        );
        let root: Element = wrapped
            .parse()
            .map_err(|e| Error::parse(format!("malformed stanza: {e}")))?;
        let element = root
            .children()
            .next()
            .cloned()
            .ok_or_else(|| Error::parse("empty stanza slice"))?;

        self.drop_prefix(self.scan);
        Ok(StreamEvent::Element(element))
    }

    /// Drop consumed bytes and rebase scan positions.
    fn drop_prefix(&mut self, upto: usize) {
        self.buf.drain(..upto);
        self.scan = 0;
        self.tag_start = 0;
        if let Some(start) = self.element_start {
            self.element_start = Some(start.saturating_sub(upto));
        }
    }
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Find `needle` at or after `from`, returning its start offset.
fn find_from(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

/// Tag name of a raw open tag (`<name attr=...>`).
fn tag_name(tag: &str) -> &str {
    let inner = tag.trim_start_matches('<');
    inner
        .split(|c: char| c.is_ascii_whitespace() || c == '>' || c == '/')
        .next()
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "<?xml version='1.0'?>\
        <stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' \
        from='test' id='abc123' version='1.0'>";

    fn opened() -> StreamParser {
        let mut parser = StreamParser::new();
        parser.feed(HEADER.as_bytes());
        match parser.next_event().unwrap() {
            Some(StreamEvent::Header(header)) => {
                assert_eq!(header.id.as_deref(), Some("abc123"));
            }
            other => panic!("expected header, got {other:?}"),
        }
        parser
    }

    #[test]
    fn parses_header_attributes() {
        let mut parser = StreamParser::new();
        parser.feed(HEADER.as_bytes());
        let Some(StreamEvent::Header(header)) = parser.next_event().unwrap() else {
            panic!("no header");
        };
        assert_eq!(header.from.as_deref(), Some("test"));
        assert_eq!(header.version.as_deref(), Some("1.0"));
    }

    #[test]
    fn yields_complete_element() {
        let mut parser = opened();
        parser.feed(b"<message to='a@test'><body>hi</body></message>");
        let Some(StreamEvent::Element(elem)) = parser.next_event().unwrap() else {
            panic!("no element");
        };
        assert_eq!(elem.name(), "message");
        assert_eq!(elem.ns(), ns::JABBER_CLIENT);
        assert_eq!(
            elem.get_child("body", ns::JABBER_CLIENT).unwrap().text(),
            "hi"
        );
    }

    #[test]
    fn tolerates_split_reads_mid_tag() {
        let mut parser = opened();
        let stanza = b"<presence from='a@test/x'><priority>5</priority></presence>";
        for chunk in stanza.chunks(7) {
            parser.feed(chunk);
        }
        let Some(StreamEvent::Element(elem)) = parser.next_event().unwrap() else {
            panic!("no element");
        };
        assert_eq!(elem.name(), "presence");
    }

    #[test]
    fn needs_more_data_returns_none() {
        let mut parser = opened();
        parser.feed(b"<iq type='get' id='1'><ping xmlns='urn:xm");
        assert!(parser.next_event().unwrap().is_none());
        parser.feed(b"pp:ping'/></iq>");
        assert!(matches!(
            parser.next_event().unwrap(),
            Some(StreamEvent::Element(_))
        ));
    }

    #[test]
    fn tolerates_whitespace_between_stanzas() {
        let mut parser = opened();
        parser.feed(b"\n\t  <iq type='result' id='1'/>  \r\n<iq type='result' id='2'/>");
        for id in ["1", "2"] {
            let Some(StreamEvent::Element(elem)) = parser.next_event().unwrap() else {
                panic!("no element");
            };
            assert_eq!(elem.attr("id"), Some(id));
        }
    }

    #[test]
    fn nested_same_name_elements_frame_once() {
        let mut parser = opened();
        parser.feed(b"<message><forwarded xmlns='urn:xmpp:forward:0'><message><body>inner</body></message></forwarded></message>");
        let Some(StreamEvent::Element(elem)) = parser.next_event().unwrap() else {
            panic!("no element");
        };
        assert_eq!(elem.name(), "message");
        assert!(parser.next_event().unwrap().is_none());
    }

    #[test]
    fn angle_bracket_inside_attribute_is_not_structural() {
        let mut parser = opened();
        parser.feed(b"<message id='a>b'><body>x</body></message>");
        let Some(StreamEvent::Element(elem)) = parser.next_event().unwrap() else {
            panic!("no element");
        };
        assert_eq!(elem.attr("id"), Some("a>b"));
    }

    #[test]
    fn stream_features_resolve_stream_prefix() {
        let mut parser = opened();
        parser.feed(
            b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
              <mechanism>SCRAM-SHA-1</mechanism></mechanisms></stream:features>",
        );
        let Some(StreamEvent::Element(elem)) = parser.next_event().unwrap() else {
            panic!("no element");
        };
        assert_eq!(elem.name(), "features");
        assert_eq!(elem.ns(), ns::STREAM);
    }

    #[test]
    fn stream_close_yields_closed() {
        let mut parser = opened();
        parser.feed(b"<presence/></stream:stream>");
        assert!(matches!(
            parser.next_event().unwrap(),
            Some(StreamEvent::Element(_))
        ));
        assert!(matches!(
            parser.next_event().unwrap(),
            Some(StreamEvent::Closed)
        ));
    }

    #[test]
    fn reset_allows_restart_on_same_parser() {
        let mut parser = opened();
        parser.feed(b"<presence/>");
        parser.next_event().unwrap();
        parser.reset();
        assert!(!parser.header_seen());
        parser.feed(HEADER.as_bytes());
        assert!(matches!(
            parser.next_event().unwrap(),
            Some(StreamEvent::Header(_))
        ));
    }

    #[test]
    fn comments_are_skipped() {
        let mut parser = opened();
        parser.feed(b"<!-- keepalive --><iq type='result' id='9'/>");
        let Some(StreamEvent::Element(elem)) = parser.next_event().unwrap() else {
            panic!("no element");
        };
        assert_eq!(elem.attr("id"), Some("9"));
    }

    #[test]
    fn top_level_text_is_a_violation() {
        let mut parser = opened();
        parser.feed(b"garbage<presence/>");
        assert!(matches!(
            parser.next_event(),
            Err(Error::ProtocolViolation(_))
        ));
    }
}
