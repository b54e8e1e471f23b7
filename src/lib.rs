//! # rookery-xmpp
//!
//! Async XMPP client library implementing RFC 6120/6121 plus a set of
//! widely deployed XEPs.
//!
//! ## Architecture
//!
//! - **XML stream**: incremental framing of the long-lived XML document
//!   over TCP, with STARTTLS upgrade ([`xml`])
//! - **Connection**: the negotiation state machine (TLS, SASL, bind),
//!   IQ request/response correlation and stanza dispatch
//!   ([`connection`])
//! - **IM layer**: typed stanzas, roster and subscriptions, privacy
//!   lists, and the extension registry with its input/output filter
//!   chains ([`im`])
//! - **Extensions**: service discovery and entity caps, MUC, PEP,
//!   stream-initiation file transfer with SOCKS5/in-band backends,
//!   MAM, and the small numbered modules under [`xep`]
//!
//! ## Getting started
//!
//! ```no_run
//! use rookery_xmpp::{ClientConfig, Connection, Im};
//! use rookery_xmpp::stanza::Message;
//!
//! # async fn run() -> rookery_xmpp::Result<()> {
//! let config = ClientConfig::new("example.com", "alice", "hunter2")?;
//! let conn = Connection::new(config);
//! let im = Im::new(&conn);
//! im.authenticate().await?;
//!
//! im.send_message(Message::chat("bob@example.com".parse()?, "hi")).await?;
//! im.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## XEP support
//!
//! XEP-0004 (data forms), XEP-0016 (privacy lists), XEP-0020 (feature
//! negotiation), XEP-0030 (service discovery), XEP-0045 (MUC),
//! XEP-0047 (IBB), XEP-0054/0153 (vCard + avatar advertisement),
//! XEP-0055 (search), XEP-0059 (RSM), XEP-0065 (SOCKS5 bytestreams),
//! XEP-0077 (registration), XEP-0085 (chat states), XEP-0092 (software
//! version), XEP-0095/0096 (SI file transfer), XEP-0107/0108/0118 +
//! XEP-0163 (PEP: mood, activity, tune), XEP-0115 (entity caps),
//! XEP-0191 (blocking), XEP-0199 (ping), XEP-0202 (entity time),
//! XEP-0203 (delayed delivery), XEP-0224 (attention), XEP-0249 (direct
//! invites), XEP-0280 (carbons), XEP-0297 (forwarding), XEP-0313
//! (MAM), XEP-0363 (HTTP upload slots).

pub mod connection;
pub mod dataform;
pub mod disco;
pub mod error;
pub mod event;
pub mod extension;
pub mod filetransfer;
pub mod im;
pub mod jid;
pub mod mam;
pub mod muc;
pub mod ns;
pub mod pep;
pub mod sasl;
pub mod si;
pub mod stanza;
pub mod xep;
pub mod xml;

pub use connection::{ClientConfig, Connection, SessionState, TlsPolicy};
pub use error::{Error, Result, StanzaError, StanzaErrorCondition, StanzaErrorType};
pub use event::{Event, EventBus};
pub use extension::{Extension, ExtensionBuild, ExtensionRegistry};
pub use im::{Im, SubscriptionDecision};
pub use jid::Jid;
