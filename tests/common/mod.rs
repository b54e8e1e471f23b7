//! In-process scripted peer for end-to-end tests.
//!
//! The peer plays the server on a loopback socket: it negotiates the
//! plaintext PLAIN + bind sequence and then follows a test-provided
//! script, asserting on what the client puts on the wire.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use minidom::Element;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use rookery_xmpp::xml::{StreamEvent, StreamParser};
use rookery_xmpp::{ClientConfig, TlsPolicy};

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub const SERVER_DOMAIN: &str = "test";
pub const BOUND_RESOURCE: &str = "rk1";

/// The scripted server side of one client connection.
pub struct Peer {
    stream: TcpStream,
    parser: StreamParser,
}

impl Peer {
    /// Write raw bytes to the client.
    pub async fn send(&mut self, raw: &str) {
        self.stream
            .write_all(raw.as_bytes())
            .await
            .expect("peer write");
        self.stream.flush().await.expect("peer flush");
    }

    /// Next framing event from the client, with a step timeout.
    pub async fn next_event(&mut self) -> StreamEvent {
        let mut buf = [0u8; 8192];
        loop {
            if let Some(event) = self.parser.next_event().expect("peer parse") {
                return event;
            }
            let n = tokio::time::timeout(STEP_TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("peer read timed out")
                .expect("peer read");
            assert!(n > 0, "client hung up mid-script");
            self.parser.feed(&buf[..n]);
        }
    }

    /// Next complete element; panics on headers or stream close.
    pub async fn read_element(&mut self) -> Element {
        match self.next_event().await {
            StreamEvent::Element(element) => element,
            other => panic!("expected element, got {other:?}"),
        }
    }

    /// Expect the client to close its stream envelope.
    pub async fn expect_stream_close(&mut self) {
        loop {
            match self.next_event().await {
                StreamEvent::Closed => return,
                StreamEvent::Element(element) => {
                    panic!("expected stream close, got <{}>", element.name())
                }
                StreamEvent::Header(_) => panic!("expected stream close, got header"),
            }
        }
    }

    /// Reset framing across a stream restart.
    pub fn reset(&mut self) {
        self.parser.reset();
    }

    fn send_header_and(&mut self, features: &str) -> String {
        format!(
            "<?xml version='1.0'?>\
             <stream:stream xmlns='jabber:client' \
             xmlns:stream='http://etherx.jabber.org/streams' \
             from='{SERVER_DOMAIN}' id='peer-1' version='1.0'>{features}"
        )
    }

    /// Drive the client through PLAIN auth and resource binding.
    ///
    /// Returns the full JID the peer bound.
    pub async fn negotiate(&mut self, username: &str) -> String {
        // Client envelope, then features with PLAIN only.
        match self.next_event().await {
            StreamEvent::Header(_) => {}
            other => panic!("expected client header, got {other:?}"),
        }
        let greeting = self.send_header_and(
            "<stream:features>\
             <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>PLAIN</mechanism></mechanisms></stream:features>",
        );
        self.send(&greeting).await;

        let auth = self.read_element().await;
        assert_eq!(auth.name(), "auth");
        assert_eq!(auth.attr("mechanism"), Some("PLAIN"));
        // Reset framing before the success goes out; the client's
        // restarted envelope may arrive immediately after.
        self.reset();
        self.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await;
        match self.next_event().await {
            StreamEvent::Header(_) => {}
            other => panic!("expected restarted header, got {other:?}"),
        }
        let greeting = self.send_header_and(
            "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>",
        );
        self.send(&greeting).await;

        let bind = self.read_element().await;
        assert_eq!(bind.name(), "iq");
        let id = bind.attr("id").expect("bind iq id").to_string();
        let jid = format!("{username}@{SERVER_DOMAIN}/{BOUND_RESOURCE}");
        self.send(&format!(
            "<iq type='result' id='{id}'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <jid>{jid}</jid></bind></iq>"
        ))
        .await;
        jid
    }

    /// Answer one roster get with the given item XML snippets.
    pub async fn answer_roster_get(&mut self, items: &[&str]) {
        let iq = self.read_element().await;
        assert_eq!(iq.name(), "iq");
        assert_eq!(iq.attr("type"), Some("get"));
        assert!(
            iq.get_child("query", "jabber:iq:roster").is_some(),
            "expected roster get, got {iq:?}"
        );
        let id = iq.attr("id").unwrap();
        self.send(&format!(
            "<iq type='result' id='{id}'>\
             <query xmlns='jabber:iq:roster'>{}</query></iq>",
            items.concat()
        ))
        .await;
    }
}

/// Start a one-connection server running `script` after negotiation.
pub async fn serve<F, Fut>(username: &'static str, script: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(Peer) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let handle = tokio::spawn(async move {
        let (stream, _peer_addr) = listener.accept().await.expect("accept");
        let mut peer = Peer {
            stream,
            parser: StreamParser::new(),
        };
        peer.negotiate(username).await;
        script(peer).await;
    });
    (addr, handle)
}

/// Client configuration pointed at the scripted peer.
pub fn client_config(addr: SocketAddr, username: &str) -> ClientConfig {
    let mut config = ClientConfig::new(
        "127.0.0.1",
        &format!("{username}@{SERVER_DOMAIN}"),
        "hunter2",
    )
    .expect("config");
    config.port = addr.port();
    config.tls = TlsPolicy::Disabled;
    config.allow_plain_without_tls = true;
    config.default_timeout = Some(Duration::from_secs(5));
    config
}

/// An in-memory sink whose contents tests can inspect.
pub struct SharedSink(pub Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub fn new() -> (Self, Arc<Mutex<Vec<u8>>>) {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        (Self(Arc::clone(&buffer)), buffer)
    }
}

impl tokio::io::AsyncWrite for SharedSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
