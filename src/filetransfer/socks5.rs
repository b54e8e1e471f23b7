//! SOCKS5 bytestreams (XEP-0065).
//!
//! The initiator publishes streamhost candidates; both parties connect
//! to one and authenticate with a SOCKS5 CONNECT whose destination
//! domain is the SHA-1 hex of `sid + initiator bare JID + target bare
//! JID`. Once the chosen host is announced the raw bytes flow over the
//! socket. A configured proxy serves as fallback candidate and is
//! activated by the initiator after the target picks it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use minidom::Element;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result, StanzaError, StanzaErrorCondition, StanzaErrorType};
use crate::extension::{Extension, ExtensionBuild};
use crate::filetransfer::{
    ByteStreamBackend, Direction, FileTransfer, SessionIo, SessionStore, SiSession,
};
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, IqPayload, Stanza};

/// One streamhost candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHost {
    /// The JID answering for this candidate.
    pub jid: Jid,
    /// Host address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl StreamHost {
    fn from_element(element: &Element) -> Option<Self> {
        Some(Self {
            jid: element.attr("jid")?.parse().ok()?,
            host: element.attr("host")?.to_string(),
            port: element.attr("port")?.parse().ok()?,
        })
    }

    fn to_element(&self) -> Element {
        Element::builder("streamhost", ns::BYTESTREAMS)
            .attr("jid", self.jid.to_string())
            .attr("host", self.host.clone())
            .attr("port", self.port.to_string())
            .build()
    }
}

/// The SOCKS5 backend extension.
pub struct Socks5Bytestreams {
    conn: Connection,
    store: Arc<SessionStore>,
    /// Address advertised in our own streamhost candidate.
    advertise_host: Mutex<String>,
    /// Optional relay used when no direct candidate connects.
    proxy: Mutex<Option<StreamHost>>,
}

impl Socks5Bytestreams {
    /// Address to advertise for direct connections (default loopback;
    /// callers on routable hosts set their public address).
    pub fn set_advertised_host(&self, host: impl Into<String>) {
        *self.advertise_host.lock().unwrap() = host.into();
    }

    /// Configure a bytestream proxy used as fallback candidate.
    pub fn set_proxy(&self, proxy: Option<StreamHost>) {
        *self.proxy.lock().unwrap() = proxy;
    }

    /// Target side: answer a streamhost offer by connecting out.
    fn handle_streamhost_offer(&self, iq: &Iq, query: &Element) -> bool {
        let Some(sid) = query.attr("sid").map(str::to_string) else {
            return false;
        };
        let Some(session) = self.store.get(&sid) else {
            let reply = Iq::error_for(
                iq,
                StanzaError::new(StanzaErrorType::Cancel, StanzaErrorCondition::ItemNotFound),
            );
            self.conn.send_stanza_background(Stanza::Iq(reply));
            return true;
        };
        if session.backend != ns::BYTESTREAMS || session.direction != Direction::Receiving {
            let reply = Iq::error_for(
                iq,
                StanzaError::new(StanzaErrorType::Cancel, StanzaErrorCondition::NotAcceptable),
            );
            self.conn.send_stanza_background(Stanza::Iq(reply));
            return true;
        }

        let hosts: Vec<StreamHost> = query
            .children()
            .filter(|c| c.is("streamhost", ns::BYTESTREAMS))
            .filter_map(StreamHost::from_element)
            .collect();
        let request = iq.clone();
        let conn = self.conn.clone();
        let store = Arc::clone(&self.store);
        let own_jid = self.conn.jid();

        tokio::spawn(async move {
            let initiator = session.peer.to_bare();
            let target = own_jid.map(|j| j.to_bare());
            let Some(target) = target else {
                store.abort(&sid, "no bound jid for socks5 handshake");
                return;
            };
            let dst = dst_address(&sid, &initiator, &target);

            let mut connected = None;
            for host in &hosts {
                match connect_candidate(host, &dst).await {
                    Ok(stream) => {
                        connected = Some((host.clone(), stream));
                        break;
                    }
                    Err(error) => {
                        debug!(host = %host.host, error = %error, "streamhost unreachable")
                    }
                }
            }

            let Some((used, stream)) = connected else {
                let reply = Iq::error_for(
                    &request,
                    StanzaError::new(
                        StanzaErrorType::Cancel,
                        StanzaErrorCondition::ItemNotFound,
                    ),
                );
                let _ = conn.send_stanza(&Stanza::Iq(reply)).await;
                store.abort(&sid, "no reachable streamhost");
                return;
            };

            let used_elem = Element::builder("streamhost-used", ns::BYTESTREAMS)
                .attr("jid", used.jid.to_string())
                .build();
            let result = Element::builder("query", ns::BYTESTREAMS)
                .attr("sid", sid.clone())
                .append(used_elem)
                .build();
            if let Err(error) = conn
                .send_stanza(&Stanza::Iq(Iq::result_for(&request, Some(result))))
                .await
            {
                store.abort(&sid, format!("failed to announce streamhost: {error}"));
                return;
            }

            pump_inbound(stream, session, store).await;
        });
        true
    }
}

async fn connect_candidate(host: &StreamHost, dst: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect((host.host.as_str(), host.port)).await?;
    socks5_connect(stream, dst).await
}

/// Receive bytes until the offered size is reached or the peer closes.
async fn pump_inbound(
    mut stream: TcpStream,
    session: Arc<SiSession>,
    store: Arc<SessionStore>,
) {
    let SessionIo::Sink(mut sink) = session.take_io().await else {
        store.abort(&session.sid, "socks5 session has no sink");
        return;
    };

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        if session.is_aborted() {
            return;
        }
        let n = match stream.read(&mut buf).await {
            Ok(n) => n,
            Err(error) => {
                store.abort(&session.sid, format!("socket read failed: {error}"));
                return;
            }
        };
        if n == 0 {
            break;
        }
        if let Err(error) = sink.write_all(&buf[..n]).await {
            store.abort(&session.sid, format!("sink write failed: {error}"));
            return;
        }
        if store.progress(&session, n as u64).is_err() {
            store.abort(&session.sid, "peer sent more than the offered size");
            return;
        }
        if session.is_complete() {
            break;
        }
    }

    let _ = sink.flush().await;
    if session.is_complete() {
        info!(sid = %session.sid, "socks5 transfer complete");
        store.remove(&session.sid);
    } else {
        store.abort(&session.sid, "socket closed before all bytes arrived");
    }
}

#[async_trait]
impl ByteStreamBackend for Socks5Bytestreams {
    fn namespace(&self) -> &'static str {
        ns::BYTESTREAMS
    }

    async fn transfer(&self, session: Arc<SiSession>) -> Result<()> {
        let own_jid = self.conn.jid().ok_or(Error::NotAuthenticated)?;
        let initiator = own_jid.to_bare();
        let target = session.peer.to_bare();
        let dst = dst_address(&session.sid, &initiator, &target);

        // Candidate 1: a local listener answering the SOCKS5 handshake.
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        let advertise = self.advertise_host.lock().unwrap().clone();
        let own_host = StreamHost {
            jid: own_jid.clone(),
            host: advertise,
            port,
        };

        let (accepted_tx, accepted_rx) = oneshot::channel();
        let expected_dst = dst.clone();
        tokio::spawn(async move {
            if let Ok((socket, _addr)) = listener.accept().await {
                let _ = accepted_tx.send(socks5_serve(socket, &expected_dst).await);
            }
        });

        let proxy = self.proxy.lock().unwrap().clone();
        let mut query = Element::builder("query", ns::BYTESTREAMS)
            .attr("sid", session.sid.clone())
            .append(own_host.to_element())
            .build();
        if let Some(proxy) = &proxy {
            query.append_child(proxy.to_element());
        }

        let response = self
            .conn
            .request(Iq::set(query).with_to(session.peer.clone()))
            .await?;
        let payload = response
            .into_result()?
            .ok_or_else(|| Error::protocol("streamhost answer without payload"))?;
        let used = payload
            .get_child("streamhost-used", ns::BYTESTREAMS)
            .and_then(|u| u.attr("jid"))
            .and_then(|j| j.parse::<Jid>().ok())
            .ok_or_else(|| Error::protocol("streamhost answer without streamhost-used"))?;

        let stream = if used == own_jid {
            // Direct: the target connected to our listener.
            accepted_rx
                .await
                .map_err(|_| Error::protocol("target never connected"))??
        } else if proxy.as_ref().is_some_and(|p| p.jid == used) {
            // Relay: connect to the proxy ourselves and activate it.
            let proxy = proxy.expect("checked above");
            let stream = connect_candidate(&proxy, &dst).await?;
            let activate = Element::builder("activate", ns::BYTESTREAMS)
                .append(target.to_string().as_str())
                .build();
            let query = Element::builder("query", ns::BYTESTREAMS)
                .attr("sid", session.sid.clone())
                .append(activate)
                .build();
            self.conn
                .request(Iq::set(query).with_to(proxy.jid.clone()))
                .await?
                .into_result()?;
            stream
        } else {
            return Err(Error::protocol(format!(
                "peer selected unknown streamhost {used}"
            )));
        };

        self.pump_outbound(stream, session).await
    }

    async fn cancel_transfer(&self, session: Arc<SiSession>) -> Result<()> {
        session.mark_aborted();
        Ok(())
    }
}

impl Socks5Bytestreams {
    async fn pump_outbound(&self, mut stream: TcpStream, session: Arc<SiSession>) -> Result<()> {
        let SessionIo::Source(mut source) = session.take_io().await else {
            return Err(Error::invalid_argument("socks5 session has no source"));
        };

        let mut buf = vec![0u8; 16 * 1024];
        loop {
            if session.is_aborted() {
                return Err(Error::Cancelled);
            }
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await?;
            self.store.progress(&session, n as u64)?;
        }
        stream.flush().await?;
        let _ = stream.shutdown().await;

        if !session.is_complete() {
            return Err(Error::protocol(format!(
                "source ended at {} of {} bytes",
                session.transferred(),
                session.total()
            )));
        }
        Ok(())
    }
}

/// The SOCKS5 destination: SHA-1 hex over sid and both bare JIDs.
fn dst_address(sid: &str, initiator: &Jid, target: &Jid) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sid.as_bytes());
    hasher.update(initiator.to_string().as_bytes());
    hasher.update(target.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Client half of the minimal no-auth SOCKS5 CONNECT exchange.
async fn socks5_connect<S>(mut stream: S, dst: &str) -> Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: version 5, one method, no authentication.
    stream.write_all(&[0x05, 0x01, 0x00]).await?;
    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply != [0x05, 0x00] {
        return Err(Error::protocol("socks5 host refused no-auth"));
    }

    // CONNECT to the hash domain, port 0.
    let mut request = vec![0x05, 0x01, 0x00, 0x03, dst.len() as u8];
    request.extend_from_slice(dst.as_bytes());
    request.extend_from_slice(&[0x00, 0x00]);
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[1] != 0x00 {
        return Err(Error::protocol(format!(
            "socks5 connect refused (rep={})",
            header[1]
        )));
    }
    // Consume the bound address echo.
    match header[3] {
        0x01 => {
            let mut addr = [0u8; 6];
            stream.read_exact(&mut addr).await?;
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut addr = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut addr).await?;
        }
        0x04 => {
            let mut addr = [0u8; 18];
            stream.read_exact(&mut addr).await?;
        }
        other => {
            return Err(Error::protocol(format!(
                "socks5 reply with unknown address type {other}"
            )))
        }
    }
    Ok(stream)
}

/// Server half: accept exactly the expected hash domain.
async fn socks5_serve<S>(mut stream: S, expected_dst: &str) -> Result<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != 0x05 {
        return Err(Error::protocol("not a socks5 client"));
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&0x00) {
        stream.write_all(&[0x05, 0xFF]).await?;
        return Err(Error::protocol("socks5 client requires authentication"));
    }
    stream.write_all(&[0x05, 0x00]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[1] != 0x01 || header[3] != 0x03 {
        return Err(Error::protocol("expected socks5 CONNECT to a domain"));
    }
    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut domain = vec![0u8; len[0] as usize];
    stream.read_exact(&mut domain).await?;
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;

    if domain != expected_dst.as_bytes() {
        warn!("socks5 destination hash mismatch");
        stream
            .write_all(&[0x05, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00])
            .await?;
        return Err(Error::protocol("socks5 destination hash mismatch"));
    }

    let mut reply = vec![0x05, 0x00, 0x00, 0x03, expected_dst.len() as u8];
    reply.extend_from_slice(expected_dst.as_bytes());
    reply.extend_from_slice(&[0x00, 0x00]);
    stream.write_all(&reply).await?;
    Ok(stream)
}

impl Extension for Socks5Bytestreams {
    fn tag(&self) -> &'static str {
        "Socks5Bytestreams"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::BYTESTREAMS.to_string()]
    }

    fn filter_input(&self, stanza: &mut Stanza, _im: &Im) -> bool {
        let Stanza::Iq(iq) = stanza else {
            return false;
        };
        let Some(payload) = iq.request_payload() else {
            return false;
        };
        if !matches!(iq.payload, IqPayload::Set(_)) || !payload.is("query", ns::BYTESTREAMS) {
            return false;
        }
        let payload = payload.clone();
        self.handle_streamhost_offer(iq, &payload)
    }
}

impl ExtensionBuild for Socks5Bytestreams {
    const TAG: &'static str = "Socks5Bytestreams";

    fn dependencies() -> &'static [&'static str] {
        &["FileTransfer"]
    }

    fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
        let ft = im.load_extension::<FileTransfer>()?;
        let socks5 = Arc::new(Self {
            conn: im.connection().clone(),
            store: ft.store(),
            advertise_host: Mutex::new("127.0.0.1".to_string()),
            proxy: Mutex::new(None),
        });
        ft.register_backend(Arc::clone(&socks5) as Arc<dyn ByteStreamBackend>);
        Ok(socks5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dst_address_is_sha1_hex_of_sid_and_bare_jids() {
        let initiator: Jid = "alice@test".parse().unwrap();
        let target: Jid = "bob@test".parse().unwrap();
        let dst = dst_address("sid-1", &initiator, &target);

        let mut hasher = Sha1::new();
        hasher.update(b"sid-1alice@testbob@test");
        let expected: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        assert_eq!(dst, expected);
        assert_eq!(dst.len(), 40);
    }

    #[tokio::test]
    async fn handshake_halves_agree() {
        let (client, server) = tokio::io::duplex(4096);
        let dst = "a".repeat(40);
        let dst_server = dst.clone();

        let server_task =
            tokio::spawn(async move { socks5_serve(server, &dst_server).await.is_ok() });
        let client_result = socks5_connect(client, &dst).await;

        assert!(client_result.is_ok());
        assert!(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_destination() {
        let (client, server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(async move {
            socks5_serve(server, &"b".repeat(40)).await.is_err()
        });
        let client_result = socks5_connect(client, &"a".repeat(40)).await;

        assert!(client_result.is_err());
        assert!(server_task.await.unwrap());
    }

    #[test]
    fn streamhost_round_trips() {
        let host = StreamHost {
            jid: "proxy.test".parse().unwrap(),
            host: "192.0.2.1".into(),
            port: 7777,
        };
        let parsed = StreamHost::from_element(&host.to_element()).unwrap();
        assert_eq!(parsed, host);
    }
}
