//! Duplex XML stream over a byte transport.
//!
//! [`XmlStream`] owns the socket through negotiation (open, STARTTLS
//! upgrade, SASL restarts) where reads and writes strictly alternate.
//! Once the session is ready it splits into an [`ElementReader`] and an
//! [`ElementWriter`] so one reader task and one serialized writer task
//! can run concurrently.

use std::sync::Arc;

use minidom::Element;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::ns;
use crate::xml::parser::{StreamEvent, StreamHeader, StreamParser};

/// Byte transport under an XML stream.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Caller-supplied certificate chain validation.
pub type CertVerifier = Arc<dyn rustls::client::danger::ServerCertVerifier>;

const READ_BUFFER_SIZE: usize = 8192;

/// A duplex XML stream bound to one server domain.
pub struct XmlStream {
    transport: Box<dyn Transport>,
    parser: StreamParser,
    domain: String,
    lang: Option<String>,
    peer_header: Option<StreamHeader>,
    encrypted: bool,
    closed: bool,
}

impl XmlStream {
    /// TCP-connect to `host:port` for streams addressed to `domain`.
    #[instrument(name = "xml.connect", skip_all, fields(host = %host, port = port))]
    pub async fn connect(host: &str, port: u16, domain: &str) -> Result<Self> {
        let tcp = TcpStream::connect((host, port)).await?;
        debug!("TCP connection established");
        Ok(Self::from_transport(Box::new(tcp), domain))
    }

    /// Wrap an already-connected transport (tests use an in-memory pipe).
    pub fn from_transport(transport: Box<dyn Transport>, domain: &str) -> Self {
        Self {
            transport,
            parser: StreamParser::new(),
            domain: domain.to_string(),
            lang: None,
            peer_header: None,
            encrypted: false,
            closed: false,
        }
    }

    /// Set the `xml:lang` advertised on the stream envelope.
    pub fn set_lang(&mut self, lang: Option<String>) {
        self.lang = lang;
    }

    /// Whether the transport has been upgraded to TLS.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// The peer's envelope attributes from the most recent open.
    pub fn peer_header(&self) -> Option<&StreamHeader> {
        self.peer_header.as_ref()
    }

    /// Open (or restart) the stream envelope and return the peer's
    /// `<stream:features/>` element.
    #[instrument(name = "xml.open", skip(self))]
    pub async fn open(&mut self) -> Result<Element> {
        self.parser.reset();

        let lang = self
            .lang
            .as_deref()
            .map(|l| format!(" xml:lang='{l}'"))
            .unwrap_or_default();
        let header = format!(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='{}' xmlns:stream='{}' to='{}' version='1.0'{}>",
            ns::JABBER_CLIENT,
            ns::STREAM,
            self.domain,
            lang
        );
        self.transport.write_all(header.as_bytes()).await?;
        self.transport.flush().await?;

        // Peer envelope first, then its features child.
        loop {
            match self.next_wire_event().await? {
                StreamEvent::Header(header) => {
                    debug!(id = ?header.id, from = ?header.from, "Stream opened");
                    self.peer_header = Some(header);
                    break;
                }
                StreamEvent::Closed => return Err(Error::protocol("stream closed during open")),
                StreamEvent::Element(_) => {
                    return Err(Error::protocol("element before stream envelope"))
                }
            }
        }

        match self.next_wire_event().await? {
            StreamEvent::Element(features) if features.is("features", ns::STREAM) => Ok(features),
            StreamEvent::Element(other) => Err(Error::protocol(format!(
                "expected stream features, got <{}>",
                other.name()
            ))),
            StreamEvent::Header(_) => Err(Error::protocol("duplicate stream envelope")),
            StreamEvent::Closed => Err(Error::protocol("stream closed before features")),
        }
    }

    /// Negotiate STARTTLS and upgrade the transport.
    ///
    /// The caller must [`open`](Self::open) again afterwards; RFC 6120
    /// requires a stream restart on the encrypted channel.
    #[instrument(name = "xml.starttls", skip(self, verifier))]
    pub async fn starttls(&mut self, verifier: Option<CertVerifier>) -> Result<()> {
        if self.encrypted {
            return Err(Error::protocol("transport is already encrypted"));
        }

        self.write_element(&Element::bare("starttls", ns::TLS))
            .await?;

        match self.next_wire_event().await? {
            StreamEvent::Element(elem) if elem.is("proceed", ns::TLS) => {}
            StreamEvent::Element(elem) if elem.is("failure", ns::TLS) => {
                return Err(Error::protocol("server refused STARTTLS"));
            }
            _ => return Err(Error::protocol("unexpected reply to starttls")),
        }

        let connector = tls_connector(verifier);
        let server_name = ServerName::try_from(self.domain.clone())
            .map_err(|e| Error::invalid_argument(format!("bad TLS server name: {e}")))?;

        // Swap in a placeholder while the handshake consumes the socket.
        let plain = std::mem::replace(
            &mut self.transport,
            Box::new(tokio::io::empty()) as Box<dyn Transport>,
        );
        let tls = connector.connect(server_name, plain).await?;
        self.transport = Box::new(tls);
        self.parser.reset();
        self.encrypted = true;

        debug!("TLS upgrade complete");
        Ok(())
    }

    /// Serialize one element as a direct child of the stream envelope.
    pub async fn write_element(&mut self, element: &Element) -> Result<()> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        let mut bytes = Vec::new();
        element
            .write_to(&mut bytes)
            .map_err(|e| Error::parse(format!("failed to serialize element: {e}")))?;
        self.transport.write_all(&bytes).await?;
        self.transport.flush().await?;
        Ok(())
    }

    /// Block until one complete top-level element arrives.
    ///
    /// Returns `Ok(None)` when the peer closes the stream envelope.
    pub async fn read_element(&mut self) -> Result<Option<Element>> {
        loop {
            match self.next_wire_event().await? {
                StreamEvent::Element(elem) => return Ok(Some(elem)),
                StreamEvent::Closed => {
                    self.closed = true;
                    return Ok(None);
                }
                StreamEvent::Header(_) => {
                    return Err(Error::protocol("unexpected stream envelope"))
                }
            }
        }
    }

    /// Send the closing envelope and shut the transport down. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.transport.write_all(b"</stream:stream>").await?;
        self.transport.flush().await?;
        let _ = self.transport.shutdown().await;
        Ok(())
    }

    /// Split into independent reader and writer halves.
    pub fn into_split(self) -> (ElementReader, ElementWriter) {
        let (read, write) = tokio::io::split(self.transport);
        (
            ElementReader {
                read,
                parser: self.parser,
            },
            ElementWriter { write },
        )
    }

    async fn next_wire_event(&mut self) -> Result<StreamEvent> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            if let Some(event) = self.parser.next_event()? {
                return Ok(event);
            }
            let n = self.transport.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::ConnectionLost);
            }
            self.parser.feed(&buf[..n]);
        }
    }
}

/// Reading half of a split stream.
pub struct ElementReader {
    read: ReadHalf<Box<dyn Transport>>,
    parser: StreamParser,
}

impl ElementReader {
    /// Block until one complete element arrives; `Ok(None)` on a clean
    /// envelope close.
    pub async fn read_element(&mut self) -> Result<Option<Element>> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match self.parser.next_event()? {
                Some(StreamEvent::Element(elem)) => return Ok(Some(elem)),
                Some(StreamEvent::Closed) => return Ok(None),
                Some(StreamEvent::Header(_)) => {
                    return Err(Error::protocol("unexpected stream envelope"))
                }
                None => {}
            }
            let n = self.read.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::ConnectionLost);
            }
            self.parser.feed(&buf[..n]);
        }
    }
}

/// Writing half of a split stream.
pub struct ElementWriter {
    write: WriteHalf<Box<dyn Transport>>,
}

impl ElementWriter {
    /// Serialize one element onto the wire.
    pub async fn write_element(&mut self, element: &Element) -> Result<()> {
        let mut bytes = Vec::new();
        element
            .write_to(&mut bytes)
            .map_err(|e| Error::parse(format!("failed to serialize element: {e}")))?;
        self.write.write_all(&bytes).await?;
        self.write.flush().await?;
        Ok(())
    }

    /// Send the closing envelope and shut down the write side.
    pub async fn close(&mut self) -> Result<()> {
        self.write.write_all(b"</stream:stream>").await?;
        self.write.flush().await?;
        let _ = self.write.shutdown().await;
        Ok(())
    }
}

fn tls_connector(verifier: Option<CertVerifier>) -> TlsConnector {
    let config = match verifier {
        Some(verifier) => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth(),
        None => {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
    };
    TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER_HEADER: &[u8] = b"<?xml version='1.0'?>\
        <stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' \
        from='test' id='s1' version='1.0'>";
    const PEER_FEATURES: &[u8] = b"<stream:features/>";

    async fn opened_pair() -> (XmlStream, tokio::io::DuplexStream) {
        let (client_io, mut peer) = tokio::io::duplex(64 * 1024);
        let mut stream = XmlStream::from_transport(Box::new(client_io), "test");

        let open = tokio::spawn(async move {
            peer.write_all(PEER_HEADER).await.unwrap();
            peer.write_all(PEER_FEATURES).await.unwrap();
            peer
        });

        let features = stream.open().await.unwrap();
        assert_eq!(features.name(), "features");
        (stream, open.await.unwrap())
    }

    #[tokio::test]
    async fn open_returns_features_element() {
        let (stream, _peer) = opened_pair().await;
        assert_eq!(stream.peer_header().unwrap().id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn write_element_reaches_the_peer() {
        let (mut stream, mut peer) = opened_pair().await;
        let message = Element::builder("message", ns::JABBER_CLIENT)
            .attr("to", "bob@test")
            .append(Element::builder("body", ns::JABBER_CLIENT).append("hi").build())
            .build();
        stream.write_element(&message).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let n = peer.read(&mut buf).await.unwrap();
        let wire = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(wire.contains("<body"), "wire was: {wire}");
        assert!(wire.contains(">hi</body>"), "wire was: {wire}");
    }

    #[tokio::test]
    async fn read_element_returns_none_on_envelope_close() {
        let (mut stream, mut peer) = opened_pair().await;
        peer.write_all(b"<presence/></stream:stream>").await.unwrap();

        assert!(stream.read_element().await.unwrap().is_some());
        assert!(stream.read_element().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut stream, mut peer) = opened_pair().await;
        stream.close().await.unwrap();
        stream.close().await.unwrap();

        let mut buf = vec![0u8; 256];
        let n = peer.read(&mut buf).await.unwrap();
        let wire = String::from_utf8_lossy(&buf[..n]).to_string();
        assert_eq!(wire.matches("</stream:stream>").count(), 1);
    }

    #[tokio::test]
    async fn split_halves_read_and_write_independently() {
        let (stream, mut peer) = opened_pair().await;
        let (mut reader, mut writer) = stream.into_split();

        peer.write_all(b"<iq type='result' id='7'/>").await.unwrap();
        let elem = reader.read_element().await.unwrap().unwrap();
        assert_eq!(elem.attr("id"), Some("7"));

        writer
            .write_element(&Element::bare("presence", ns::JABBER_CLIENT))
            .await
            .unwrap();
        let mut buf = vec![0u8; 256];
        let n = peer.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("<presence"));
    }
}
