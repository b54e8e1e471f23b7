//! In-band bytestreams (XEP-0047).
//!
//! Data rides inside the XML stream itself: an `open`, a run of
//! base64 `data` frames with a wrapping 16-bit sequence counter, and a
//! `close`. The receiver enforces strict sequence order; any gap or
//! duplicate kills the session with `unexpected-request`.

use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use dashmap::DashMap;
use minidom::Element;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result, StanzaError, StanzaErrorCondition, StanzaErrorType};
use crate::extension::{Extension, ExtensionBuild};
use crate::filetransfer::{
    ByteStreamBackend, Direction, FileTransfer, SessionIo, SessionStore, SiSession,
};
use crate::im::Im;
use crate::ns;
use crate::stanza::{Iq, IqPayload, Stanza};

/// Frame payload size; 4096 raw bytes is the interoperable default.
const BLOCK_SIZE: usize = 4096;

enum Chunk {
    Data(Vec<u8>),
    Close,
}

struct RecvState {
    expected_seq: u16,
    worker: mpsc::UnboundedSender<Chunk>,
}

/// The IBB backend extension.
pub struct InBandBytestreams {
    conn: Connection,
    store: Arc<SessionStore>,
    receiving: DashMap<String, RecvState>,
}

impl InBandBytestreams {
    fn open_session(&self, iq: &Iq, open: &Element) -> bool {
        let Some(sid) = open.attr("sid") else {
            return false;
        };
        let Some(session) = self.store.get(sid) else {
            self.reply_error(iq, StanzaErrorCondition::ItemNotFound);
            return true;
        };
        if session.backend != ns::IBB || session.direction != Direction::Receiving {
            self.reply_error(iq, StanzaErrorCondition::NotAcceptable);
            return true;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.receiving.insert(
            sid.to_string(),
            RecvState {
                expected_seq: 0,
                worker: tx,
            },
        );
        tokio::spawn(recv_worker(session, Arc::clone(&self.store), rx));

        debug!(sid = sid, "ibb stream opened");
        self.reply_result(iq);
        true
    }

    fn data_frame(&self, iq: Option<&Iq>, data: &Element) -> bool {
        let Some(sid) = data.attr("sid") else {
            return false;
        };
        let Some(mut state) = self.receiving.get_mut(sid) else {
            if let Some(iq) = iq {
                self.reply_error(iq, StanzaErrorCondition::ItemNotFound);
            }
            return true;
        };

        let seq: Option<u16> = data.attr("seq").and_then(|s| s.parse().ok());
        let expected = state.expected_seq;
        if seq != Some(expected) {
            drop(state);
            warn!(
                sid = sid,
                seq = ?seq,
                expected = expected,
                "ibb frame out of order"
            );
            self.receiving.remove(sid);
            self.store.abort(sid, "out-of-order ibb frame");
            if let Some(iq) = iq {
                self.reply_error(iq, StanzaErrorCondition::UnexpectedRequest);
            }
            return true;
        }

        let Ok(bytes) = BASE64_STANDARD.decode(data.text().trim()) else {
            drop(state);
            self.receiving.remove(sid);
            self.store.abort(sid, "ibb frame is not base64");
            if let Some(iq) = iq {
                self.reply_error(iq, StanzaErrorCondition::BadRequest);
            }
            return true;
        };

        state.expected_seq = expected.wrapping_add(1);
        let delivered = state.worker.send(Chunk::Data(bytes)).is_ok();
        drop(state);
        if !delivered {
            self.receiving.remove(sid);
        }
        if let Some(iq) = iq {
            self.reply_result(iq);
        }
        true
    }

    fn close_session(&self, iq: &Iq, close: &Element) -> bool {
        let Some(sid) = close.attr("sid") else {
            return false;
        };
        match self.receiving.remove(sid) {
            Some((_, state)) => {
                let _ = state.worker.send(Chunk::Close);
                self.reply_result(iq);
            }
            None => self.reply_error(iq, StanzaErrorCondition::ItemNotFound),
        }
        true
    }

    fn reply_result(&self, iq: &Iq) {
        self.conn
            .send_stanza_background(Stanza::Iq(Iq::result_for(iq, None)));
    }

    fn reply_error(&self, iq: &Iq, condition: StanzaErrorCondition) {
        let error_type = match condition {
            StanzaErrorCondition::UnexpectedRequest => StanzaErrorType::Cancel,
            StanzaErrorCondition::BadRequest => StanzaErrorType::Modify,
            _ => StanzaErrorType::Cancel,
        };
        let reply = Iq::error_for(iq, StanzaError::new(error_type, condition));
        self.conn.send_stanza_background(Stanza::Iq(reply));
    }
}

async fn recv_worker(
    session: Arc<SiSession>,
    store: Arc<SessionStore>,
    mut rx: mpsc::UnboundedReceiver<Chunk>,
) {
    let SessionIo::Sink(mut sink) = session.take_io().await else {
        store.abort(&session.sid, "ibb session has no sink");
        return;
    };

    while let Some(chunk) = rx.recv().await {
        if session.is_aborted() {
            return;
        }
        match chunk {
            Chunk::Data(bytes) => {
                if let Err(error) = sink.write_all(&bytes).await {
                    store.abort(&session.sid, format!("sink write failed: {error}"));
                    return;
                }
                if store.progress(&session, bytes.len() as u64).is_err() {
                    store.abort(&session.sid, "peer sent more than the offered size");
                    return;
                }
            }
            Chunk::Close => {
                let _ = sink.flush().await;
                if session.is_complete() {
                    info!(sid = %session.sid, "ibb transfer complete");
                    store.remove(&session.sid);
                } else {
                    store.abort(&session.sid, "stream closed before all bytes arrived");
                }
                return;
            }
        }
    }
}

#[async_trait]
impl ByteStreamBackend for InBandBytestreams {
    fn namespace(&self) -> &'static str {
        ns::IBB
    }

    async fn transfer(&self, session: Arc<SiSession>) -> Result<()> {
        use tokio::io::AsyncReadExt;

        let SessionIo::Source(mut source) = session.take_io().await else {
            return Err(Error::invalid_argument("ibb session has no source"));
        };

        let open = Element::builder("open", ns::IBB)
            .attr("block-size", BLOCK_SIZE.to_string())
            .attr("sid", session.sid.clone())
            .attr("stanza", "iq")
            .build();
        self.conn
            .request(Iq::set(open).with_to(session.peer.clone()))
            .await?
            .into_result()?;

        let mut seq: u16 = 0;
        let mut buf = vec![0u8; BLOCK_SIZE];
        loop {
            if session.is_aborted() {
                self.send_close(&session).await?;
                return Err(Error::Cancelled);
            }
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }

            let data = Element::builder("data", ns::IBB)
                .attr("sid", session.sid.clone())
                .attr("seq", seq.to_string())
                .append(BASE64_STANDARD.encode(&buf[..n]).as_str())
                .build();
            self.conn
                .request(Iq::set(data).with_to(session.peer.clone()))
                .await?
                .into_result()?;
            seq = seq.wrapping_add(1);
            self.store.progress(&session, n as u64)?;
        }

        self.send_close(&session).await?;
        if !session.is_complete() {
            return Err(Error::protocol(format!(
                "source ended at {} of {} bytes",
                session.transferred(),
                session.total()
            )));
        }
        Ok(())
    }

    async fn cancel_transfer(&self, session: Arc<SiSession>) -> Result<()> {
        // The send loop and recv worker poll this flag.
        session.mark_aborted();
        self.receiving.remove(&session.sid);
        if session.direction == Direction::Sending {
            let _ = self.send_close(&session).await;
        }
        Ok(())
    }
}

impl InBandBytestreams {
    async fn send_close(&self, session: &SiSession) -> Result<()> {
        let close = Element::builder("close", ns::IBB)
            .attr("sid", session.sid.clone())
            .build();
        self.conn
            .request(Iq::set(close).with_to(session.peer.clone()))
            .await?
            .into_result()?;
        Ok(())
    }
}

impl Extension for InBandBytestreams {
    fn tag(&self) -> &'static str {
        "InBandBytestreams"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::IBB.to_string()]
    }

    fn filter_input(&self, stanza: &mut Stanza, _im: &Im) -> bool {
        match stanza {
            Stanza::Iq(iq) => {
                let Some(payload) = iq.request_payload() else {
                    return false;
                };
                if !matches!(iq.payload, IqPayload::Set(_)) || payload.ns() != ns::IBB {
                    return false;
                }
                let payload = payload.clone();
                match payload.name() {
                    "open" => self.open_session(iq, &payload),
                    "data" => self.data_frame(Some(&*iq), &payload),
                    "close" => self.close_session(iq, &payload),
                    _ => false,
                }
            }
            Stanza::Message(message) => {
                // Message-carried frames are legal but unacknowledged.
                if let Some(data) = message.payload("data", ns::IBB) {
                    let data = data.clone();
                    self.data_frame(None, &data)
                } else {
                    false
                }
            }
            Stanza::Presence(_) => false,
        }
    }

    fn detached(&self) {
        self.receiving.clear();
    }
}

impl ExtensionBuild for InBandBytestreams {
    const TAG: &'static str = "InBandBytestreams";

    fn dependencies() -> &'static [&'static str] {
        &["FileTransfer"]
    }

    fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
        let ft = im.load_extension::<FileTransfer>()?;
        let ibb = Arc::new(Self {
            conn: im.connection().clone(),
            store: ft.store(),
            receiving: DashMap::new(),
        });
        ft.register_backend(Arc::clone(&ibb) as Arc<dyn ByteStreamBackend>);
        Ok(ibb)
    }
}
