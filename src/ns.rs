//! XML namespace constants used on the wire.
//!
//! Extension-level namespaces are bit-exact; interoperability depends on
//! them matching the published RFC/XEP values.

/// Client stanza namespace (RFC 6120).
pub const JABBER_CLIENT: &str = "jabber:client";
/// Stream envelope namespace.
pub const STREAM: &str = "http://etherx.jabber.org/streams";
/// STARTTLS negotiation.
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
/// SASL negotiation.
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
/// Resource binding.
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
/// Legacy session establishment.
pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
/// Stanza error conditions.
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
/// Stream error conditions.
pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// Roster management (RFC 6121).
pub const ROSTER: &str = "jabber:iq:roster";
/// Privacy lists (XEP-0016).
pub const PRIVACY: &str = "jabber:iq:privacy";

/// Service discovery, info queries (XEP-0030).
pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
/// Service discovery, item queries (XEP-0030).
pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
/// Entity capabilities (XEP-0115).
pub const CAPS: &str = "http://jabber.org/protocol/caps";

/// Multi-User Chat join envelope (XEP-0045).
pub const MUC: &str = "http://jabber.org/protocol/muc";
/// MUC occupant protocol.
pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
/// MUC admin queries.
pub const MUC_ADMIN: &str = "http://jabber.org/protocol/muc#admin";
/// MUC owner queries.
pub const MUC_OWNER: &str = "http://jabber.org/protocol/muc#owner";
/// MUC voice request form type.
pub const MUC_REQUEST: &str = "http://jabber.org/protocol/muc#request";
/// MUC room info form type.
pub const MUC_ROOMINFO: &str = "http://jabber.org/protocol/muc#roominfo";
/// Direct MUC invitations (XEP-0249).
pub const CONFERENCE: &str = "jabber:x:conference";

/// Data forms (XEP-0004).
pub const DATA_FORMS: &str = "jabber:x:data";

/// Stream initiation (XEP-0095).
pub const SI: &str = "http://jabber.org/protocol/si";
/// SI file-transfer profile (XEP-0096).
pub const SI_FILE_TRANSFER: &str = "http://jabber.org/protocol/si/profile/file-transfer";
/// Feature negotiation (XEP-0020).
pub const FEATURE_NEG: &str = "http://jabber.org/protocol/feature-neg";
/// SOCKS5 bytestreams (XEP-0065).
pub const BYTESTREAMS: &str = "http://jabber.org/protocol/bytestreams";
/// In-band bytestreams (XEP-0047).
pub const IBB: &str = "http://jabber.org/protocol/ibb";

/// Message archive management v2 (XEP-0313).
pub const MAM: &str = "urn:xmpp:mam:2";
/// Result set management (XEP-0059).
pub const RSM: &str = "http://jabber.org/protocol/rsm";
/// Stanza forwarding (XEP-0297).
pub const FORWARD: &str = "urn:xmpp:forward:0";
/// Delayed delivery (XEP-0203).
pub const DELAY: &str = "urn:xmpp:delay";
/// Message carbons (XEP-0280).
pub const CARBONS: &str = "urn:xmpp:carbons:2";

/// Pubsub (XEP-0060), base namespace.
pub const PUBSUB: &str = "http://jabber.org/protocol/pubsub";
/// Pubsub event fan-out.
pub const PUBSUB_EVENT: &str = "http://jabber.org/protocol/pubsub#event";
/// User mood (XEP-0107).
pub const MOOD: &str = "http://jabber.org/protocol/mood";
/// User tune (XEP-0118).
pub const TUNE: &str = "http://jabber.org/protocol/tune";
/// User activity (XEP-0108).
pub const ACTIVITY: &str = "http://jabber.org/protocol/activity";

/// XMPP ping (XEP-0199).
pub const PING: &str = "urn:xmpp:ping";
/// Entity time (XEP-0202).
pub const TIME: &str = "urn:xmpp:time";
/// Software version (XEP-0092).
pub const VERSION: &str = "jabber:iq:version";
/// Attention (XEP-0224).
pub const ATTENTION: &str = "urn:xmpp:attention:0";
/// Blocking command (XEP-0191).
pub const BLOCKING: &str = "urn:xmpp:blocking";
/// Chat state notifications (XEP-0085).
pub const CHATSTATES: &str = "http://jabber.org/protocol/chatstates";
/// In-band registration (XEP-0077).
pub const REGISTER: &str = "jabber:iq:register";
/// Jabber search (XEP-0055).
pub const SEARCH: &str = "jabber:iq:search";
/// HTTP upload slot requests (XEP-0363).
pub const HTTP_UPLOAD: &str = "urn:xmpp:http:upload:0";
/// vCard storage (XEP-0054).
pub const VCARD: &str = "vcard-temp";
/// vCard-based avatar advertisement (XEP-0153).
pub const VCARD_UPDATE: &str = "vcard-temp:x:update";
