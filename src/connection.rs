//! Session negotiation state machine and stanza dispatch.
//!
//! One [`Connection`] owns the full lifecycle from TCP connect through
//! STARTTLS, SASL, resource binding and into the ready state, where it
//! splits the stream into a reader task (inbound dispatch, IQ
//! correlation) and a writer task (single serialization point for
//! outbound bytes).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use minidom::Element;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::event::{Event, EventBus};
use crate::jid::Jid;
use crate::ns;
use crate::sasl::{self, Credentials};
use crate::stanza::{Iq, IqPayload, Stanza};
use crate::xml::{CertVerifier, ElementReader, ElementWriter, XmlStream};

/// TLS negotiation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
    /// Fail unless the stream can be upgraded.
    #[default]
    Required,
    /// Upgrade when offered, continue in the clear otherwise.
    Opportunistic,
    /// Never upgrade. Fails with [`Error::TlsRequiredByServer`] when the
    /// server insists.
    Disabled,
}

/// Connection parameters.
#[derive(Clone)]
pub struct ClientConfig {
    /// Server hostname or address to dial.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// XMPP domain of the account; defaults to `host`.
    pub domain: String,
    /// Account node (the part before `@`).
    pub username: String,
    /// Account password.
    pub password: String,
    /// Preferred resource; the server may assign its own.
    pub resource: Option<String>,
    /// TLS policy.
    pub tls: TlsPolicy,
    /// Permit PLAIN on an unencrypted channel.
    pub allow_plain_without_tls: bool,
    /// Default deadline for IQ requests; `None` waits forever.
    pub default_timeout: Option<Duration>,
    /// `xml:lang` advertised on the stream.
    pub lang: Option<String>,
    /// Caller-supplied certificate chain validation; system roots when
    /// absent.
    pub cert_verifier: Option<CertVerifier>,
}

impl ClientConfig {
    /// Default XMPP client port.
    pub const DEFAULT_PORT: u16 = 5222;

    /// Build a config for `username@host`. The username may also be
    /// given as a bare JID to use a domain that differs from the host.
    pub fn new(
        host: impl Into<String>,
        username: &str,
        password: impl Into<String>,
    ) -> Result<Self> {
        let host = host.into();
        let (username, domain) = match username.split_once('@') {
            Some((node, domain)) => (node.to_string(), domain.to_string()),
            None => (username.to_string(), host.clone()),
        };
        if username.is_empty() {
            return Err(Error::invalid_argument("empty username"));
        }
        Ok(Self {
            host,
            port: Self::DEFAULT_PORT,
            domain,
            username,
            password: password.into(),
            resource: None,
            tls: TlsPolicy::Required,
            allow_plain_without_tls: false,
            default_timeout: Some(Duration::from_secs(30)),
            lang: None,
            cert_verifier: None,
        })
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// Connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport.
    Disconnected,
    /// TCP connect in progress.
    Connecting,
    /// Envelope exchanged, features received.
    StreamOpened,
    /// STARTTLS in flight.
    TlsNegotiating,
    /// Envelope re-exchanged on the encrypted channel.
    StreamReopened,
    /// SASL exchange in flight.
    SaslInProgress,
    /// SASL succeeded, stream restarted.
    Authenticated,
    /// Resource binding in flight.
    Binding,
    /// Fully negotiated; stanzas flow.
    Ready,
    /// Graceful shutdown in progress.
    Closing,
    /// The stream died underneath us.
    Lost,
}

enum PendingDelivery {
    Waiter(oneshot::Sender<Result<Iq>>),
    Callback(Mutex<Option<Box<dyn FnOnce(Result<Iq>) + Send>>>),
}

struct PendingIq {
    delivery: PendingDelivery,
}

impl PendingIq {
    fn deliver(self, result: Result<Iq>) {
        match self.delivery {
            PendingDelivery::Waiter(tx) => {
                let _ = tx.send(result);
            }
            PendingDelivery::Callback(callback) => {
                if let Some(callback) = callback.lock().unwrap().take() {
                    callback(result);
                }
            }
        }
    }
}

enum WriteCommand {
    Element(Element),
    Close(oneshot::Sender<()>),
}

const WRITE_CHANNEL_SIZE: usize = 64;
const DISPATCH_CHANNEL_SIZE: usize = 64;

/// Output-filter chain installed by the IM layer; runs on every
/// outbound stanza before serialization.
type OutboundHook = Arc<dyn Fn(&mut Stanza) + Send + Sync>;

struct Inner {
    config: RwLock<ClientConfig>,
    state: RwLock<SessionState>,
    jid: RwLock<Option<Jid>>,
    pending: DashMap<String, PendingIq>,
    writer_tx: RwLock<Option<mpsc::Sender<WriteCommand>>>,
    dispatch_tx: RwLock<Option<mpsc::Sender<Stanza>>>,
    events: EventBus,
    outbound_hook: RwLock<Option<OutboundHook>>,
    encrypted: AtomicBool,
    disposed: AtomicBool,
    generation: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn set_state(&self, state: SessionState) {
        *self.state.write().unwrap() = state;
        self.events.emit(Event::Connect(state));
    }

    fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    fn fail_all_pending(&self, make_error: impl Fn() -> Error) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                pending.deliver(Err(make_error()));
            }
        }
    }

    fn teardown_io(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.writer_tx.write().unwrap() = None;
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Handle to one XMPP session. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Build a disconnected session for the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                state: RwLock::new(SessionState::Disconnected),
                jid: RwLock::new(None),
                pending: DashMap::new(),
                writer_tx: RwLock::new(None),
                dispatch_tx: RwLock::new(None),
                events: EventBus::new(),
                outbound_hook: RwLock::new(None),
                encrypted: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The session event bus.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// The bound full JID, available from `Ready`.
    pub fn jid(&self) -> Option<Jid> {
        self.inner.jid.read().unwrap().clone()
    }

    /// Whether a transport is established.
    pub fn connected(&self) -> bool {
        !matches!(
            self.inner.state(),
            SessionState::Disconnected | SessionState::Lost
        )
    }

    /// Whether SASL completed on the current transport.
    pub fn authenticated(&self) -> bool {
        matches!(
            self.inner.state(),
            SessionState::Authenticated | SessionState::Binding | SessionState::Ready
        )
    }

    /// Whether the transport is TLS.
    pub fn encrypted(&self) -> bool {
        self.inner.encrypted.load(Ordering::SeqCst)
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// The session default IQ deadline.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.inner.config.read().unwrap().default_timeout
    }

    /// Change the session default IQ deadline; `None` waits forever.
    pub fn set_default_timeout(&self, timeout: Option<Duration>) {
        self.inner.config.write().unwrap().default_timeout = timeout;
    }

    /// The configured account domain.
    pub fn domain(&self) -> String {
        self.inner.config.read().unwrap().domain.clone()
    }

    /// Install the output-filter chain run on every outbound stanza.
    pub(crate) fn set_outbound_hook(&self, hook: OutboundHook) {
        *self.inner.outbound_hook.write().unwrap() = Some(hook);
    }

    /// Register the single inbound dispatch consumer (the IM layer).
    ///
    /// Must be called before [`connect`](Self::connect); stanzas that are
    /// not correlated IQ responses flow into this channel in wire order.
    pub fn attach_dispatch(&self) -> mpsc::Receiver<Stanza> {
        let (tx, rx) = mpsc::channel(DISPATCH_CHANNEL_SIZE);
        *self.inner.dispatch_tx.write().unwrap() = Some(tx);
        rx
    }

    /// Dial the server and negotiate up to `Ready`.
    #[instrument(name = "session.connect", skip(self))]
    pub async fn connect(&self) -> Result<()> {
        self.ensure_not_disposed()?;
        if self.inner.state() == SessionState::Ready {
            return Err(Error::invalid_argument("already connected"));
        }

        let config = self.inner.config.read().unwrap().clone();
        self.inner.set_state(SessionState::Connecting);

        let result = self.negotiate(&config).await;
        if result.is_err() {
            self.inner.teardown_io();
            *self.inner.state.write().unwrap() = SessionState::Disconnected;
        }
        result
    }

    /// Tear down and re-run the whole negotiation.
    ///
    /// Pending IQ waiters are released with [`Error::ConnectionLost`];
    /// session-scoped state restoration (roster, presence) is the IM
    /// layer's business.
    #[instrument(name = "session.reconnect", skip(self))]
    pub async fn reconnect(&self) -> Result<()> {
        self.ensure_not_disposed()?;
        self.inner.teardown_io();
        self.inner.fail_all_pending(|| Error::ConnectionLost);
        self.inner.encrypted.store(false, Ordering::SeqCst);
        *self.inner.jid.write().unwrap() = None;
        self.inner.set_state(SessionState::Disconnected);
        self.connect().await
    }

    /// Close the stream and invalidate the session. Idempotent; every
    /// later operation fails with [`Error::AlreadyDisposed`].
    #[instrument(name = "session.close", skip(self))]
    pub async fn close(&self) -> Result<()> {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.set_state(SessionState::Closing);

        let writer = self.inner.writer_tx.read().unwrap().clone();
        if let Some(writer) = writer {
            // Writer task sends the closing envelope and shuts down; wait
            // for its acknowledgement so the envelope actually flushes
            // before the tasks are torn down.
            let (ack_tx, ack_rx) = oneshot::channel();
            if writer.send(WriteCommand::Close(ack_tx)).await.is_ok() {
                let _ = tokio::time::timeout(Duration::from_secs(2), ack_rx).await;
            }
        }
        self.inner.teardown_io();
        self.inner.fail_all_pending(|| Error::Cancelled);
        // Dropping the dispatch sender ends the IM dispatch task.
        *self.inner.dispatch_tx.write().unwrap() = None;
        self.inner.set_state(SessionState::Disconnected);
        info!("session closed");
        Ok(())
    }

    /// Resolve a correlated response from the dispatch consumer.
    ///
    /// The IM dispatch task calls this so waiters release in wire order;
    /// the pending-table lock is never held across the delivery.
    pub(crate) fn resolve_response(&self, iq: &Iq) -> bool {
        resolve_pending_iq(&self.inner, iq)
    }

    /// Re-inject a stanza into the inbound dispatch pipeline, behind
    /// whatever is already queued. Used by filters that unwrap carried
    /// stanzas (carbons); this re-enters dispatch, not the network.
    pub fn reinject_inbound(&self, stanza: Stanza) {
        let dispatch = self.inner.dispatch_tx.read().unwrap().clone();
        if let Some(tx) = dispatch {
            tokio::spawn(async move {
                if tx.send(stanza).await.is_err() {
                    debug!("dispatch consumer gone; reinjected stanza dropped");
                }
            });
        }
    }

    /// Send one stanza through the output-filter chain; blocks only on
    /// the writer queue.
    pub async fn send_stanza(&self, stanza: &Stanza) -> Result<()> {
        let hook = self.inner.outbound_hook.read().unwrap().clone();
        let element = match hook {
            Some(hook) => {
                let mut stanza = stanza.clone();
                hook(&mut stanza);
                stanza.to_element()
            }
            None => stanza.to_element(),
        };
        self.send_element(element).await
    }

    /// Queue a stanza from synchronous contexts (filters); errors are
    /// reported on the event bus.
    pub fn send_stanza_background(&self, stanza: Stanza) {
        let conn = self.clone();
        tokio::spawn(async move {
            if let Err(error) = conn.send_stanza(&stanza).await {
                warn!(error = %error, "background send failed");
                conn.events().emit(Event::Error(Arc::new(error)));
            }
        });
    }

    /// Send an IQ request and await its correlated response.
    ///
    /// `timeout` of `None` waits forever. On expiry the pending record
    /// is removed and [`Error::Timeout`] returned.
    pub async fn iq_request(&self, iq: Iq, timeout: Option<Duration>) -> Result<Iq> {
        let (iq, id) = self.prepare_request(iq)?;
        let (tx, rx) = oneshot::channel();
        self.register_pending(&id, PendingDelivery::Waiter(tx));

        if let Err(error) = self.send_element(iq.to_element()).await {
            self.inner.pending.remove(&id);
            return Err(error);
        }

        match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(Error::Cancelled),
                Err(_) => {
                    self.inner.pending.remove(&id);
                    Err(Error::Timeout)
                }
            },
            None => rx.await.unwrap_or(Err(Error::Cancelled)),
        }
    }

    /// Send an IQ request using the session default timeout.
    pub async fn request(&self, iq: Iq) -> Result<Iq> {
        let timeout = self.default_timeout();
        self.iq_request(iq, timeout).await
    }

    /// Send an IQ request and deliver the response to a callback.
    ///
    /// The callback fires exactly once: with the response, or with
    /// `Timeout`, `Cancelled` or an IO error.
    pub fn iq_request_async(
        &self,
        iq: Iq,
        callback: impl FnOnce(Result<Iq>) + Send + 'static,
    ) {
        let (iq, id) = match self.prepare_request(iq) {
            Ok(prepared) => prepared,
            Err(error) => {
                callback(Err(error));
                return;
            }
        };
        self.register_pending(
            &id,
            PendingDelivery::Callback(Mutex::new(Some(Box::new(callback)))),
        );

        if let Some(deadline) = self.default_timeout() {
            let inner = Arc::clone(&self.inner);
            let timeout_id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if let Some((_, pending)) = inner.pending.remove(&timeout_id) {
                    pending.deliver(Err(Error::Timeout));
                }
            });
        }

        let conn = self.clone();
        tokio::spawn(async move {
            if let Err(error) = conn.send_element(iq.to_element()).await {
                if let Some((_, pending)) = conn.inner.pending.remove(&id) {
                    pending.deliver(Err(error));
                }
            }
        });
    }

    fn prepare_request(&self, mut iq: Iq) -> Result<(Iq, String)> {
        self.ensure_ready()?;
        if !iq.is_request() {
            return Err(Error::invalid_argument(
                "iq_request takes a Get or Set stanza",
            ));
        }
        if iq.id.is_empty() {
            iq.id = fresh_id();
        }
        if let Some(hook) = self.inner.outbound_hook.read().unwrap().clone() {
            let mut stanza = Stanza::Iq(iq);
            hook(&mut stanza);
            let Stanza::Iq(filtered) = stanza else { unreachable!() };
            iq = filtered;
        }
        let id = iq.id.clone();
        Ok((iq, id))
    }

    fn register_pending(&self, id: &str, delivery: PendingDelivery) {
        self.inner
            .pending
            .insert(id.to_string(), PendingIq { delivery });
    }

    async fn send_element(&self, element: Element) -> Result<()> {
        self.ensure_not_disposed()?;
        let writer = self
            .inner
            .writer_tx
            .read()
            .unwrap()
            .clone()
            .ok_or(Error::NotConnected)?;
        writer
            .send(WriteCommand::Element(element))
            .await
            .map_err(|_| Error::ConnectionLost)
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(Error::AlreadyDisposed);
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        self.ensure_not_disposed()?;
        match self.inner.state() {
            SessionState::Ready => Ok(()),
            SessionState::Disconnected | SessionState::Connecting | SessionState::Lost => {
                Err(Error::NotConnected)
            }
            _ => Err(Error::NotAuthenticated),
        }
    }

    /// Run the negotiation sequence on a fresh transport.
    async fn negotiate(&self, config: &ClientConfig) -> Result<()> {
        let mut stream = XmlStream::connect(&config.host, config.port, &config.domain).await?;
        stream.set_lang(config.lang.clone());

        let mut features = Features::parse(&stream.open().await?);
        self.inner.set_state(SessionState::StreamOpened);

        // STARTTLS per policy and server features.
        match config.tls {
            TlsPolicy::Disabled => {
                if features.starttls_required {
                    return Err(Error::TlsRequiredByServer);
                }
            }
            TlsPolicy::Required if !features.starttls => {
                return Err(Error::protocol("server does not offer STARTTLS"));
            }
            _ => {}
        }
        if features.starttls && config.tls != TlsPolicy::Disabled {
            self.inner.set_state(SessionState::TlsNegotiating);
            stream.starttls(config.cert_verifier.clone()).await?;
            self.inner.encrypted.store(true, Ordering::SeqCst);
            features = Features::parse(&stream.open().await?);
            self.inner.set_state(SessionState::StreamReopened);
        }

        // SASL.
        self.inner.set_state(SessionState::SaslInProgress);
        self.sasl_exchange(&mut stream, config, &features.mechanisms)
            .await?;
        info!(username = %config.username, "authenticated");

        features = Features::parse(&stream.open().await?);
        self.inner.set_state(SessionState::Authenticated);

        // Resource binding.
        if !features.bind {
            return Err(Error::protocol("server does not offer resource binding"));
        }
        self.inner.set_state(SessionState::Binding);
        let jid = bind_resource(&mut stream, config.resource.as_deref()).await?;
        info!(jid = %jid, "resource bound");

        if features.session_required {
            establish_session(&mut stream).await?;
        }

        *self.inner.jid.write().unwrap() = Some(jid);

        // Split and go concurrent.
        let (reader, writer) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_CHANNEL_SIZE);
        *self.inner.writer_tx.write().unwrap() = Some(writer_tx);

        let generation = self.inner.generation.load(Ordering::SeqCst);
        let writer_task = tokio::spawn(writer_loop(writer, writer_rx));
        let reader_task = tokio::spawn(reader_loop(
            Arc::clone(&self.inner),
            reader,
            generation,
        ));
        self.inner
            .tasks
            .lock()
            .unwrap()
            .extend([writer_task, reader_task]);

        self.inner.set_state(SessionState::Ready);
        Ok(())
    }

    async fn sasl_exchange(
        &self,
        stream: &mut XmlStream,
        config: &ClientConfig,
        mechanisms: &[String],
    ) -> Result<()> {
        use base64::prelude::*;

        let credentials = Credentials {
            username: config.username.clone(),
            password: config.password.clone(),
            domain: config.domain.clone(),
        };
        let mut mechanism = sasl::select(
            mechanisms,
            &credentials,
            stream.is_encrypted(),
            config.allow_plain_without_tls,
        )?;
        debug!(mechanism = mechanism.name(), "starting SASL");

        let mut auth = Element::builder("auth", ns::SASL)
            .attr("mechanism", mechanism.name())
            .build();
        match mechanism.initial_response()? {
            Some(initial) if initial.is_empty() => auth.append_text_node("="),
            Some(initial) => auth.append_text_node(BASE64_STANDARD.encode(initial)),
            None => {}
        }
        stream.write_element(&auth).await?;

        loop {
            let element = stream
                .read_element()
                .await?
                .ok_or(Error::ConnectionLost)?;
            if element.is("challenge", ns::SASL) {
                let challenge = BASE64_STANDARD
                    .decode(element.text().trim())
                    .map_err(|_| Error::auth_failed("challenge is not base64"))?;
                let response = mechanism.respond(&challenge)?;
                let mut reply = Element::builder("response", ns::SASL).build();
                if response.is_empty() {
                    reply.append_text_node("=");
                } else {
                    reply.append_text_node(BASE64_STANDARD.encode(response));
                }
                stream.write_element(&reply).await?;
            } else if element.is("success", ns::SASL) {
                let text = element.text();
                let trimmed = text.trim();
                let data = if trimmed.is_empty() || trimmed == "=" {
                    None
                } else {
                    Some(
                        BASE64_STANDARD
                            .decode(trimmed)
                            .map_err(|_| Error::auth_failed("success data is not base64"))?,
                    )
                };
                mechanism.verify_success(data.as_deref())?;
                return Ok(());
            } else if element.is("failure", ns::SASL) {
                let condition = element
                    .children()
                    .map(|c| c.name().to_string())
                    .next()
                    .unwrap_or_else(|| "not-authorized".to_string());
                return Err(Error::auth_failed(condition));
            } else {
                return Err(Error::protocol(format!(
                    "unexpected <{}> during SASL",
                    element.name()
                )));
            }
        }
    }
}

/// Generate a session-unique stanza id.
pub(crate) fn fresh_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Parsed `<stream:features/>`.
#[derive(Debug, Default)]
struct Features {
    starttls: bool,
    starttls_required: bool,
    mechanisms: Vec<String>,
    bind: bool,
    session_required: bool,
}

impl Features {
    fn parse(element: &Element) -> Self {
        let mut features = Self::default();
        if let Some(starttls) = element.get_child("starttls", ns::TLS) {
            features.starttls = true;
            features.starttls_required = starttls.has_child("required", ns::TLS);
        }
        if let Some(mechanisms) = element.get_child("mechanisms", ns::SASL) {
            features.mechanisms = mechanisms
                .children()
                .filter(|c| c.is("mechanism", ns::SASL))
                .map(|c| c.text().trim().to_string())
                .collect();
        }
        features.bind = element.has_child("bind", ns::BIND);
        if let Some(session) = element.get_child("session", ns::SESSION) {
            features.session_required = !session.has_child("optional", ns::SESSION);
        }
        features
    }
}

async fn bind_resource(stream: &mut XmlStream, resource: Option<&str>) -> Result<Jid> {
    let mut bind = Element::builder("bind", ns::BIND).build();
    if let Some(resource) = resource {
        bind.append_child(
            Element::builder("resource", ns::BIND)
                .append(resource)
                .build(),
        );
    }
    let request = Iq::set(bind).with_id(fresh_id());
    stream.write_element(&request.to_element()).await?;

    let response = read_iq_response(stream, &request.id).await?;
    let payload = response
        .into_result()?
        .ok_or_else(|| Error::protocol("bind result without payload"))?;
    let jid_text = payload
        .get_child("jid", ns::BIND)
        .map(|j| j.text())
        .ok_or_else(|| Error::protocol("bind result without jid"))?;
    let jid: Jid = jid_text
        .trim()
        .parse()
        .map_err(|_| Error::protocol(format!("server assigned malformed jid '{jid_text}'")))?;
    if !jid.is_full() {
        return Err(Error::protocol("server bound a bare jid"));
    }
    Ok(jid)
}

async fn establish_session(stream: &mut XmlStream) -> Result<()> {
    let request = Iq::set(Element::bare("session", ns::SESSION)).with_id(fresh_id());
    stream.write_element(&request.to_element()).await?;
    read_iq_response(stream, &request.id).await?.into_result()?;
    Ok(())
}

async fn read_iq_response(stream: &mut XmlStream, id: &str) -> Result<Iq> {
    loop {
        let element = stream
            .read_element()
            .await?
            .ok_or(Error::ConnectionLost)?;
        if element.is("iq", ns::JABBER_CLIENT) {
            let iq = Iq::from_element(&element)?;
            if iq.id == id && iq.is_response() {
                return Ok(iq);
            }
            debug!(id = %iq.id, "dropping unrelated iq during negotiation");
        } else {
            debug!(name = %element.name(), "dropping element during negotiation");
        }
    }
}

async fn writer_loop(mut writer: ElementWriter, mut rx: mpsc::Receiver<WriteCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Element(element) => {
                if let Err(error) = writer.write_element(&element).await {
                    warn!(error = %error, "outbound write failed");
                    break;
                }
            }
            WriteCommand::Close(ack) => {
                let _ = writer.close().await;
                let _ = ack.send(());
                break;
            }
        }
    }
}

async fn reader_loop(inner: Arc<Inner>, mut reader: ElementReader, generation: u64) {
    let fatal = loop {
        match reader.read_element().await {
            Ok(Some(element)) => {
                if element.is("error", ns::STREAM) {
                    let condition = element
                        .children()
                        .map(|c| c.name().to_string())
                        .next()
                        .unwrap_or_else(|| "undefined-condition".to_string());
                    warn!(condition = %condition, "stream error from peer");
                    inner.events.emit(Event::Error(Arc::new(Error::protocol(
                        format!("stream error: {condition}"),
                    ))));
                    break true;
                }
                match Stanza::parse(&element) {
                    Ok(stanza) => dispatch_stanza(&inner, stanza).await,
                    Err(error) => {
                        // A single malformed stanza is reported, not fatal.
                        debug!(error = %error, "dropping malformed stanza");
                        inner.events.emit(Event::Error(Arc::new(error)));
                    }
                }
            }
            Ok(None) => {
                debug!("peer closed the stream envelope");
                break true;
            }
            Err(error) => {
                if !inner.disposed.load(Ordering::SeqCst) {
                    warn!(error = %error, "inbound read failed");
                    inner.events.emit(Event::Error(Arc::new(error)));
                }
                break true;
            }
        }
    };

    let stale = inner.generation.load(Ordering::SeqCst) != generation;
    if fatal && !stale && !inner.disposed.load(Ordering::SeqCst) {
        inner.fail_all_pending(|| Error::ConnectionLost);
        inner.set_state(SessionState::Lost);
    }
}

async fn dispatch_stanza(inner: &Arc<Inner>, stanza: Stanza) {
    // Everything flows through the dispatch channel when a consumer is
    // attached, IQ responses included, so waiters resolve in wire order
    // relative to the stanzas that preceded their response. Without a
    // consumer, responses are correlated inline and the rest dropped.
    let dispatch = inner.dispatch_tx.read().unwrap().clone();
    match dispatch {
        Some(tx) => {
            if tx.send(stanza).await.is_err() {
                debug!("dispatch consumer gone; stanza dropped");
            }
        }
        None => match stanza {
            Stanza::Iq(iq) if iq.is_response() => {
                resolve_pending_iq(inner, &iq);
            }
            other => {
                debug!(kind = other.kind_name(), "no dispatch consumer; stanza dropped")
            }
        },
    }
}

/// Release the waiter for a correlated response. Returns `false` when
/// no pending record matches (dropped silently per the routing rule).
fn resolve_pending_iq(inner: &Inner, iq: &Iq) -> bool {
    if iq.id.is_empty() {
        debug!("dropping iq response without id");
        return false;
    }
    match inner.pending.remove(&iq.id) {
        Some((_, pending)) => {
            let outcome = match &iq.payload {
                IqPayload::Error { error, .. } => Err(error.clone().into()),
                _ => Ok(iq.clone()),
            };
            pending.deliver(outcome);
            true
        }
        None => {
            debug!(id = %iq.id, "dropping unsolicited iq response");
            false
        }
    }
}
