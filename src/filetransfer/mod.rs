//! SI file transfer (XEP-0096) coordination.
//!
//! [`FileTransfer`] owns the session table keyed by sid and speaks the
//! file-transfer SI profile. The actual byte movement is delegated to
//! pluggable [`ByteStreamBackend`]s (SOCKS5 preferred over in-band);
//! backends report progress through the shared [`SessionStore`], which
//! fans out the progress and abort events.

mod ibb;
mod socks5;

pub use ibb::InBandBytestreams;
pub use socks5::{Socks5Bytestreams, StreamHost};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use minidom::Element;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::connection::fresh_id;
use crate::error::{Error, Result};
use crate::event::{Event, EventBus};
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::si::{FileOffer, SiOffer, SiProfileHandler, StreamInitiation};

/// Who moves bytes toward whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We are the initiator pushing bytes.
    Sending,
    /// We accepted an offer and receive bytes.
    Receiving,
}

/// Where transferred bytes go (receiving side).
pub type TransferSink = Box<dyn AsyncWrite + Send + Unpin>;
/// Where transferred bytes come from (sending side).
pub type TransferSource = Box<dyn AsyncRead + Send + Unpin>;

/// The byte stream attached to a session.
pub enum SessionIo {
    /// Receiving into a sink.
    Sink(TransferSink),
    /// Sending from a source.
    Source(TransferSource),
    /// Already taken by the running backend.
    Taken,
}

/// One file transfer in flight.
pub struct SiSession {
    /// Session id, unique per session table.
    pub sid: String,
    /// Transfer direction.
    pub direction: Direction,
    /// The peer's full JID.
    pub peer: Jid,
    /// Offered file metadata.
    pub file: FileOffer,
    /// Byte-stream backend namespace selected for this session.
    pub backend: String,
    transferred: AtomicU64,
    aborted: AtomicBool,
    io: tokio::sync::Mutex<SessionIo>,
}

impl SiSession {
    fn new(
        sid: String,
        direction: Direction,
        peer: Jid,
        file: FileOffer,
        backend: String,
        io: SessionIo,
    ) -> Arc<Self> {
        Arc::new(Self {
            sid,
            direction,
            peer,
            file,
            backend,
            transferred: AtomicU64::new(0),
            aborted: AtomicBool::new(false),
            io: tokio::sync::Mutex::new(io),
        })
    }

    /// Total bytes expected.
    pub fn total(&self) -> u64 {
        self.file.size
    }

    /// Bytes moved so far; never exceeds [`total`](Self::total).
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    /// Whether all bytes moved.
    pub fn is_complete(&self) -> bool {
        self.transferred() == self.total()
    }

    /// Whether the session was aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Take the attached stream; the backend owns it from here.
    pub async fn take_io(&self) -> SessionIo {
        std::mem::replace(&mut *self.io.lock().await, SessionIo::Taken)
    }

    fn add_transferred(&self, bytes: u64) -> Result<u64> {
        let after = self.transferred.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if after > self.total() {
            self.transferred.store(self.total(), Ordering::SeqCst);
            return Err(Error::protocol(format!(
                "peer moved {after} bytes on a {}-byte transfer",
                self.total()
            )));
        }
        Ok(after)
    }

    fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// Session table shared between the coordinator and its backends.
pub struct SessionStore {
    sessions: DashMap<String, Arc<SiSession>>,
    events: EventBus,
}

impl SessionStore {
    fn new(events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            events,
        })
    }

    /// Register a new session; duplicate sids are a [`Error::Conflict`].
    pub fn register(&self, session: Arc<SiSession>) -> Result<()> {
        use dashmap::mapref::entry::Entry;
        match self.sessions.entry(session.sid.clone()) {
            Entry::Occupied(_) => Err(Error::conflict(format!(
                "si session {} already exists",
                session.sid
            ))),
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Look up a session by sid.
    pub fn get(&self, sid: &str) -> Option<Arc<SiSession>> {
        self.sessions.get(sid).map(|s| Arc::clone(s.value()))
    }

    /// Drop a session without any event.
    pub fn remove(&self, sid: &str) -> Option<Arc<SiSession>> {
        self.sessions.remove(sid).map(|(_, s)| s)
    }

    /// Record moved bytes and fan out progress.
    pub fn progress(&self, session: &SiSession, bytes: u64) -> Result<u64> {
        let transferred = session.add_transferred(bytes)?;
        self.events.emit(Event::FileTransferProgress {
            sid: session.sid.clone(),
            name: session.file.name.clone(),
            transferred,
            total: session.total(),
        });
        Ok(transferred)
    }

    /// Abort a session and fan out the abort.
    pub fn abort(&self, sid: &str, reason: impl Into<String>) {
        if let Some((_, session)) = self.sessions.remove(sid) {
            session.mark_aborted();
            let reason = reason.into();
            warn!(sid = sid, reason = %reason, "transfer aborted");
            self.events.emit(Event::FileTransferAborted {
                sid: sid.to_string(),
                reason,
            });
        }
    }

    /// Abort everything (session close).
    pub fn abort_all(&self, reason: &str) {
        let sids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for sid in sids {
            self.abort(&sid, reason);
        }
    }
}

/// Accepted offer details handed to the accept callback.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Session id.
    pub sid: String,
    /// The offering peer.
    pub from: Jid,
    /// Offered file metadata.
    pub file: FileOffer,
}

type AcceptHandler = Box<dyn Fn(&TransferRequest) -> Option<TransferSink> + Send + Sync + 'static>;

/// A pluggable byte-stream transport.
#[async_trait]
pub trait ByteStreamBackend: Send + Sync + 'static {
    /// The stream-method namespace this backend implements.
    fn namespace(&self) -> &'static str;

    /// Move the session's bytes (sending side drives; receiving side
    /// backends do their work from the inbound filter instead and keep
    /// this as a no-op).
    async fn transfer(&self, session: Arc<SiSession>) -> Result<()>;

    /// Abort an in-flight session.
    async fn cancel_transfer(&self, session: Arc<SiSession>) -> Result<()>;
}

/// Byte-stream preference, strongest first.
const METHOD_PREFERENCE: [&str; 2] = [ns::BYTESTREAMS, ns::IBB];

/// The file-transfer coordinator extension.
pub struct FileTransfer {
    si: Arc<StreamInitiation>,
    store: Arc<SessionStore>,
    backends: Mutex<Vec<Arc<dyn ByteStreamBackend>>>,
    accept_handler: Mutex<Option<AcceptHandler>>,
    force_in_band: AtomicBool,
}

impl FileTransfer {
    /// The shared session table (backends hold this too).
    pub fn store(&self) -> Arc<SessionStore> {
        Arc::clone(&self.store)
    }

    /// Register a byte-stream backend (called by backend extensions).
    pub fn register_backend(&self, backend: Arc<dyn ByteStreamBackend>) {
        self.backends.lock().unwrap().push(backend);
    }

    /// Skip SOCKS5 even when both sides support it.
    pub fn set_force_in_band(&self, force: bool) {
        self.force_in_band.store(force, Ordering::SeqCst);
    }

    /// Register the accept callback: return a sink to accept, `None`
    /// to reject.
    pub fn set_accept_handler(
        &self,
        handler: impl Fn(&TransferRequest) -> Option<TransferSink> + Send + Sync + 'static,
    ) {
        *self.accept_handler.lock().unwrap() = Some(Box::new(handler));
    }

    /// Offer a file to a peer and start pushing bytes once accepted.
    ///
    /// Returns the session id; completion and failure surface as
    /// progress/abort events.
    pub async fn initiate_file_transfer(
        &self,
        to: &Jid,
        file: FileOffer,
        source: TransferSource,
    ) -> Result<String> {
        if !to.is_full() {
            return Err(Error::invalid_argument(
                "file transfers address a full JID",
            ));
        }
        let methods = self.local_methods();
        if methods.is_empty() {
            return Err(Error::invalid_argument(
                "no byte-stream backend is loaded",
            ));
        }

        let sid = fresh_id();
        let offer = SiOffer {
            sid: sid.clone(),
            mime_type: None,
            profile: ns::SI_FILE_TRANSFER.to_string(),
            file: file.clone(),
            methods,
        };

        let chosen = self.si.offer(to, &offer).await?;
        let backend = self
            .backend_for(&chosen)
            .ok_or(Error::FeatureNotSupportedByPeer(chosen.clone()))?;

        let session = SiSession::new(
            sid.clone(),
            Direction::Sending,
            to.clone(),
            file,
            chosen,
            SessionIo::Source(source),
        );
        self.store.register(Arc::clone(&session))?;
        // The chosen backend drives the push on its own task.
        spawn_transfer(backend, session, self.store());
        Ok(sid)
    }

    /// Abort a transfer by session id.
    pub async fn cancel_file_transfer(&self, sid: &str) -> Result<()> {
        let session = self
            .store
            .get(sid)
            .ok_or_else(|| Error::invalid_argument(format!("no transfer with sid {sid}")))?;
        if let Some(backend) = self.backend_for(&session.backend) {
            backend.cancel_transfer(Arc::clone(&session)).await?;
        }
        self.store.abort(sid, "cancelled by caller");
        Ok(())
    }

    fn local_methods(&self) -> Vec<String> {
        let backends = self.backends.lock().unwrap();
        let force_ibb = self.force_in_band.load(Ordering::SeqCst);
        METHOD_PREFERENCE
            .iter()
            .filter(|method| !(force_ibb && **method == ns::BYTESTREAMS))
            .filter(|method| backends.iter().any(|b| b.namespace() == **method))
            .map(|m| m.to_string())
            .collect()
    }

    fn backend_for(&self, namespace: &str) -> Option<Arc<dyn ByteStreamBackend>> {
        self.backends
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.namespace() == namespace)
            .map(Arc::clone)
    }
}

fn spawn_transfer(
    backend: Arc<dyn ByteStreamBackend>,
    session: Arc<SiSession>,
    store: Arc<SessionStore>,
) {
    tokio::spawn(async move {
        let sid = session.sid.clone();
        match backend.transfer(Arc::clone(&session)).await {
            Ok(()) => {
                info!(sid = %sid, "transfer complete");
                store.remove(&sid);
            }
            Err(error) => {
                store.abort(&sid, error.to_string());
            }
        }
    });
}

#[async_trait]
impl SiProfileHandler for FileTransfer {
    async fn handle_offer(&self, from: Option<&Jid>, offer: SiOffer) -> Result<Element> {
        let from = from
            .cloned()
            .ok_or_else(|| Error::protocol("si offer without sender"))?;

        // Method selection: our preference order intersected with the
        // peer's offer and our loaded backends.
        let chosen = self
            .local_methods()
            .into_iter()
            .find(|method| offer.methods.iter().any(|m| m == method))
            .ok_or_else(|| Error::not_acceptable("no overlapping stream method"))?;

        if self.store.get(&offer.sid).is_some() {
            return Err(Error::conflict(format!(
                "si session {} already exists",
                offer.sid
            )));
        }

        let request = TransferRequest {
            sid: offer.sid.clone(),
            from: from.clone(),
            file: offer.file.clone(),
        };
        let sink = {
            let handler = self.accept_handler.lock().unwrap();
            match handler.as_ref() {
                Some(handler) => handler(&request),
                None => None,
            }
        };
        let Some(sink) = sink else {
            debug!(sid = %offer.sid, "transfer rejected locally");
            return Err(Error::not_acceptable("transfer rejected"));
        };

        let session = SiSession::new(
            offer.sid.clone(),
            Direction::Receiving,
            from,
            offer.file,
            chosen.clone(),
            SessionIo::Sink(sink),
        );
        self.store.register(session)?;
        info!(sid = %offer.sid, method = %chosen, "incoming transfer accepted");
        Ok(SiOffer::accept_element(&chosen))
    }
}

impl Extension for FileTransfer {
    fn tag(&self) -> &'static str {
        "FileTransfer"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::SI_FILE_TRANSFER.to_string()]
    }

    fn detached(&self) {
        self.store.abort_all("session closed");
    }
}

impl ExtensionBuild for FileTransfer {
    const TAG: &'static str = "FileTransfer";

    fn dependencies() -> &'static [&'static str] {
        &["StreamInitiation"]
    }

    fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
        let si = im.load_extension::<StreamInitiation>()?;
        let ft = Arc::new(Self {
            si: Arc::clone(&si),
            store: SessionStore::new(im.events().clone()),
            backends: Mutex::new(Vec::new()),
            accept_handler: Mutex::new(None),
            force_in_band: AtomicBool::new(false),
        });
        si.register_profile(ns::SI_FILE_TRANSFER, Arc::clone(&ft) as Arc<dyn SiProfileHandler>);
        Ok(ft)
    }
}
