//! Multi-User Chat (XEP-0045), client side.
//!
//! Room traffic is recognized on the inbound path by the `x` payloads
//! in the MUC namespaces plus the set of rooms this session joined.
//! Occupant presence fans out as [`Event::GroupPresenceChanged`] with
//! the full status-code set; invites, declines, subject changes and
//! MUC-level errors each raise their own event.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use minidom::Element;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::dataform::{DataForm, FormType};
use crate::disco::{DiscoItem, ServiceDiscovery};
use crate::error::{Error, Result, StanzaError};
use crate::event::Event;
use crate::extension::{Extension, ExtensionBuild};
use crate::im::Im;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{Iq, Message, MessageKind, Presence, PresenceKind, Stanza};

/// Long-lived association of a user with a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affiliation {
    /// Room owner.
    Owner,
    /// Room administrator.
    Admin,
    /// Registered member.
    Member,
    /// No affiliation.
    None,
    /// Banned.
    Outcast,
}

impl Affiliation {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Member => "member",
            Self::None => "none",
            Self::Outcast => "outcast",
        }
    }

    fn from_attr(value: &str) -> Self {
        match value {
            "owner" => Self::Owner,
            "admin" => Self::Admin,
            "member" => Self::Member,
            "outcast" => Self::Outcast,
            _ => Self::None,
        }
    }
}

/// Temporary position within a room session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// May moderate.
    Moderator,
    /// May speak.
    Participant,
    /// May only listen.
    Visitor,
    /// Not in the room.
    None,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Moderator => "moderator",
            Self::Participant => "participant",
            Self::Visitor => "visitor",
            Self::None => "none",
        }
    }

    fn from_attr(value: &str) -> Self {
        match value {
            "moderator" => Self::Moderator,
            "participant" => Self::Participant,
            "visitor" => Self::Visitor,
            _ => Self::None,
        }
    }
}

/// The MUC status codes attached to an occupant presence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusCodes(BTreeSet<u16>);

impl StatusCodes {
    /// Room created and awaiting configuration.
    pub const ROOM_CREATED: u16 = 201;
    /// This presence refers to the receiving occupant.
    pub const SELF_PRESENCE: u16 = 110;
    /// Occupant was kicked.
    pub const KICKED: u16 = 307;
    /// Occupant was banned.
    pub const BANNED: u16 = 301;
    /// Room is non-anonymous.
    pub const NON_ANONYMOUS: u16 = 100;

    /// Membership test.
    pub fn contains(&self, code: u16) -> bool {
        self.0.contains(&code)
    }

    /// Insert a code.
    pub fn insert(&mut self, code: u16) {
        self.0.insert(code);
    }

    /// Iterate codes ascending.
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.0.iter().copied()
    }

    /// Whether no codes were attached.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One occupant of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occupant {
    /// The room's bare JID.
    pub room: Jid,
    /// Nickname inside the room.
    pub nick: String,
    /// Real JID when the room discloses it.
    pub real_jid: Option<Jid>,
    /// Affiliation.
    pub affiliation: Affiliation,
    /// Role.
    pub role: Role,
}

/// Fan-out record for occupant presence changes.
#[derive(Debug, Clone)]
pub struct GroupPresence {
    /// The occupant the presence describes.
    pub occupant: Occupant,
    /// `false` for unavailable presence (occupant left).
    pub available: bool,
    /// All status codes attached to the presence.
    pub statuses: StatusCodes,
}

impl GroupPresence {
    /// Whether this presence refers to ourselves.
    pub fn is_self(&self) -> bool {
        self.statuses.contains(StatusCodes::SELF_PRESENCE)
    }
}

/// A received room invitation.
#[derive(Debug, Clone)]
pub struct MucInvite {
    /// The room.
    pub room: Jid,
    /// Who invited, when disclosed.
    pub from: Option<Jid>,
    /// Invitation text.
    pub reason: Option<String>,
    /// Room password, if one is needed.
    pub password: Option<String>,
    /// `true` for a direct (XEP-0249) invite, `false` for mediated.
    pub direct: bool,
}

/// A declined invitation.
#[derive(Debug, Clone)]
pub struct MucInviteDeclined {
    /// The room.
    pub room: Jid,
    /// Who declined.
    pub from: Option<Jid>,
    /// Their reason.
    pub reason: Option<String>,
}

/// A MUC-level error for a room interaction.
#[derive(Debug, Clone)]
pub struct MucError {
    /// The room.
    pub room: Jid,
    /// The stanza error.
    pub error: StanzaError,
}

/// History limits requested at join time.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryRequest {
    /// Maximum number of stanzas.
    pub max_stanzas: Option<u32>,
    /// Maximum age in seconds.
    pub seconds: Option<u32>,
}

/// Join parameters.
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    /// Room password.
    pub password: Option<String>,
    /// History request; `None` asks for the room default.
    pub history: Option<HistoryRequest>,
}

/// An entry in an affiliation or role list query.
#[derive(Debug, Clone)]
pub struct AdminListItem {
    /// Real JID, for affiliation lists.
    pub jid: Option<Jid>,
    /// Nickname, for role lists.
    pub nick: Option<String>,
    /// Affiliation.
    pub affiliation: Affiliation,
    /// Role.
    pub role: Role,
}

type VoiceRequestHandler = Box<dyn Fn(DataForm) -> Option<DataForm> + Send + Sync + 'static>;

/// The MUC extension.
pub struct MultiUserChat {
    conn: Connection,
    disco: Arc<ServiceDiscovery>,
    /// bare room JID -> our nickname.
    joined: DashMap<Jid, String>,
    voice_handler: Mutex<Option<VoiceRequestHandler>>,
}

impl MultiUserChat {
    /// Rooms this session joined (or is joining).
    pub fn joined_rooms(&self) -> Vec<Jid> {
        self.joined.iter().map(|e| e.key().clone()).collect()
    }

    /// Register the moderator-side voice request consumer; the returned
    /// form (approved or denied) is submitted back to the room.
    pub fn set_voice_request_handler(
        &self,
        handler: impl Fn(DataForm) -> Option<DataForm> + Send + Sync + 'static,
    ) {
        *self.voice_handler.lock().unwrap() = Some(Box::new(handler));
    }

    /// List rooms on a conference service.
    pub async fn discover_rooms(&self, service: &Jid) -> Result<Vec<DiscoItem>> {
        self.disco.items(service).await
    }

    /// Room identity, features and extended info form.
    pub async fn get_room_info(&self, room: &Jid) -> Result<crate::disco::DiscoInfo> {
        self.disco.info(room, None).await
    }

    /// Join a room under a nickname.
    pub async fn join_room(&self, room: &Jid, nick: &str, options: JoinOptions) -> Result<()> {
        let room = room.to_bare();
        let occupant_jid = room.with_resource(nick)?;

        let mut x = Element::builder("x", ns::MUC).build();
        if let Some(password) = &options.password {
            x.append_child(
                Element::builder("password", ns::MUC)
                    .append(password.as_str())
                    .build(),
            );
        }
        if let Some(history) = &options.history {
            let mut history_elem = Element::builder("history", ns::MUC).build();
            if let Some(max) = history.max_stanzas {
                history_elem.set_attr("maxstanzas", max.to_string());
            }
            if let Some(seconds) = history.seconds {
                history_elem.set_attr("seconds", seconds.to_string());
            }
            x.append_child(history_elem);
        }

        let presence = Presence::available()
            .with_to(occupant_jid)
            .with_payload(x);
        // Registered before the bytes flush so the room's occupant
        // presence finds the join in flight.
        self.joined.insert(room.clone(), nick.to_string());
        let sent = self.conn.send_stanza(&Stanza::Presence(presence)).await;
        if sent.is_err() {
            self.joined.remove(&room);
        }
        sent
    }

    /// Leave a room.
    pub async fn leave_room(&self, room: &Jid, status: Option<&str>) -> Result<()> {
        let room = room.to_bare();
        let nick = self
            .joined
            .get(&room)
            .map(|n| n.clone())
            .ok_or_else(|| Error::invalid_argument(format!("not joined to {room}")))?;
        let mut presence =
            Presence::new(PresenceKind::Unavailable).with_to(room.with_resource(&nick)?);
        if let Some(status) = status {
            presence = presence.with_status(status);
        }
        self.joined.remove(&room);
        self.conn.send_stanza(&Stanza::Presence(presence)).await
    }

    /// Change the room subject (moderator permitting).
    pub async fn edit_room_subject(&self, room: &Jid, subject: &str) -> Result<()> {
        let message = Message::new(MessageKind::Groupchat)
            .with_to(room.to_bare())
            .with_subject(subject);
        self.conn.send_stanza(&Stanza::Message(message)).await
    }

    /// Kick an occupant by nickname.
    pub async fn kick_occupant(&self, room: &Jid, nick: &str, reason: Option<&str>) -> Result<()> {
        self.set_role(room, nick, Role::None, reason).await
    }

    /// Ban a user by real JID.
    pub async fn ban_user(&self, room: &Jid, user: &Jid, reason: Option<&str>) -> Result<()> {
        self.set_affiliation(room, user, Affiliation::Outcast, reason)
            .await
    }

    /// Grant admin status.
    pub async fn add_admin(&self, room: &Jid, user: &Jid) -> Result<()> {
        self.set_affiliation(room, user, Affiliation::Admin, None)
            .await
    }

    /// Grant membership.
    pub async fn add_member(&self, room: &Jid, user: &Jid) -> Result<()> {
        self.set_affiliation(room, user, Affiliation::Member, None)
            .await
    }

    /// Strip a user's affiliation.
    pub async fn remove_user(&self, room: &Jid, user: &Jid) -> Result<()> {
        self.set_affiliation(room, user, Affiliation::None, None)
            .await
    }

    /// Let a visitor speak.
    pub async fn grant_voice(&self, room: &Jid, nick: &str) -> Result<()> {
        self.set_role(room, nick, Role::Participant, None).await
    }

    /// Silence a participant.
    pub async fn revoke_voice(&self, room: &Jid, nick: &str) -> Result<()> {
        self.set_role(room, nick, Role::Visitor, None).await
    }

    /// Set an occupant's role by nickname.
    pub async fn set_role(
        &self,
        room: &Jid,
        nick: &str,
        role: Role,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut item = Element::builder("item", ns::MUC_ADMIN)
            .attr("nick", nick)
            .attr("role", role.as_str())
            .build();
        if let Some(reason) = reason {
            item.append_child(
                Element::builder("reason", ns::MUC_ADMIN)
                    .append(reason)
                    .build(),
            );
        }
        self.admin_set(room, item).await
    }

    /// Set a user's affiliation by real JID.
    pub async fn set_affiliation(
        &self,
        room: &Jid,
        user: &Jid,
        affiliation: Affiliation,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut item = Element::builder("item", ns::MUC_ADMIN)
            .attr("jid", user.to_bare().to_string())
            .attr("affiliation", affiliation.as_str())
            .build();
        if let Some(reason) = reason {
            item.append_child(
                Element::builder("reason", ns::MUC_ADMIN)
                    .append(reason)
                    .build(),
            );
        }
        self.admin_set(room, item).await
    }

    /// Everyone the room will list through disco#items.
    pub async fn get_room_all_occupants(&self, room: &Jid) -> Result<Vec<DiscoItem>> {
        self.disco.items(&room.to_bare()).await
    }

    /// Fetch the affiliation list for one affiliation.
    pub async fn get_occupants_by_affiliation(
        &self,
        room: &Jid,
        affiliation: Affiliation,
    ) -> Result<Vec<AdminListItem>> {
        let item = Element::builder("item", ns::MUC_ADMIN)
            .attr("affiliation", affiliation.as_str())
            .build();
        self.admin_get(room, item).await
    }

    /// Fetch the role list for one role.
    pub async fn get_occupants_by_role(
        &self,
        room: &Jid,
        role: Role,
    ) -> Result<Vec<AdminListItem>> {
        let item = Element::builder("item", ns::MUC_ADMIN)
            .attr("role", role.as_str())
            .build();
        self.admin_get(room, item).await
    }

    /// Invite a user through the room (mediated).
    pub async fn send_invite(&self, room: &Jid, user: &Jid, reason: Option<&str>) -> Result<()> {
        let mut invite = Element::builder("invite", ns::MUC_USER)
            .attr("to", user.to_bare().to_string())
            .build();
        if let Some(reason) = reason {
            invite.append_child(
                Element::builder("reason", ns::MUC_USER)
                    .append(reason)
                    .build(),
            );
        }
        let x = Element::builder("x", ns::MUC_USER).append(invite).build();
        let message = Message::new(MessageKind::Normal)
            .with_to(room.to_bare())
            .with_payload(x);
        self.conn.send_stanza(&Stanza::Message(message)).await
    }

    /// Invite a user directly (XEP-0249), bypassing the room.
    pub async fn send_direct_invite(
        &self,
        user: &Jid,
        room: &Jid,
        password: Option<&str>,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut x = Element::builder("x", ns::CONFERENCE)
            .attr("jid", room.to_bare().to_string())
            .build();
        if let Some(password) = password {
            x.set_attr("password", password);
        }
        if let Some(reason) = reason {
            x.set_attr("reason", reason);
        }
        let message = Message::new(MessageKind::Normal)
            .with_to(user.to_bare())
            .with_payload(x);
        self.conn.send_stanza(&Stanza::Message(message)).await
    }

    /// Decline a mediated invitation.
    pub async fn decline_invite(
        &self,
        room: &Jid,
        inviter: Option<&Jid>,
        reason: Option<&str>,
    ) -> Result<()> {
        let mut decline = Element::builder("decline", ns::MUC_USER).build();
        if let Some(inviter) = inviter {
            decline.set_attr("to", inviter.to_bare().to_string());
        }
        if let Some(reason) = reason {
            decline.append_child(
                Element::builder("reason", ns::MUC_USER)
                    .append(reason)
                    .build(),
            );
        }
        let x = Element::builder("x", ns::MUC_USER).append(decline).build();
        let message = Message::new(MessageKind::Normal)
            .with_to(room.to_bare())
            .with_payload(x);
        self.conn.send_stanza(&Stanza::Message(message)).await
    }

    /// Ask the moderators for voice.
    pub async fn request_voice(&self, room: &Jid) -> Result<()> {
        let form = DataForm::submission(ns::MUC_REQUEST).with_field(
            crate::dataform::Field::with_value("muc#role", "participant"),
        );
        let message = Message::new(MessageKind::Normal)
            .with_to(room.to_bare())
            .with_payload(form.to_element());
        self.conn.send_stanza(&Stanza::Message(message)).await
    }

    /// Fetch the owner configuration form.
    pub async fn get_room_config(&self, room: &Jid) -> Result<DataForm> {
        let iq = Iq::get(Element::bare("query", ns::MUC_OWNER)).with_to(room.to_bare());
        let payload = self
            .conn
            .request(iq)
            .await?
            .into_result()?
            .ok_or_else(|| Error::protocol("owner query without payload"))?;
        let form = payload
            .get_child("x", ns::DATA_FORMS)
            .ok_or_else(|| Error::protocol("owner query without config form"))?;
        DataForm::from_element(form)
    }

    /// Submit a completed configuration form.
    pub async fn modify_room_config(&self, room: &Jid, form: DataForm) -> Result<()> {
        let query = Element::builder("query", ns::MUC_OWNER)
            .append(form.to_element())
            .build();
        self.conn
            .request(Iq::set(query).with_to(room.to_bare()))
            .await?
            .into_result()?;
        Ok(())
    }

    /// Accept the default configuration for a freshly created room.
    pub async fn request_instant_room(&self, room: &Jid) -> Result<()> {
        self.modify_room_config(room, DataForm::new(FormType::Submit))
            .await
    }

    /// Destroy a room this session owns.
    pub async fn destroy_room(
        &self,
        room: &Jid,
        reason: Option<&str>,
        alternate: Option<&Jid>,
    ) -> Result<()> {
        let mut destroy = Element::builder("destroy", ns::MUC_OWNER).build();
        if let Some(alternate) = alternate {
            destroy.set_attr("jid", alternate.to_bare().to_string());
        }
        if let Some(reason) = reason {
            destroy.append_child(
                Element::builder("reason", ns::MUC_OWNER)
                    .append(reason)
                    .build(),
            );
        }
        let query = Element::builder("query", ns::MUC_OWNER).append(destroy).build();
        self.conn
            .request(Iq::set(query).with_to(room.to_bare()))
            .await?
            .into_result()?;
        self.joined.remove(&room.to_bare());
        Ok(())
    }

    async fn admin_set(&self, room: &Jid, item: Element) -> Result<()> {
        let query = Element::builder("query", ns::MUC_ADMIN).append(item).build();
        self.conn
            .request(Iq::set(query).with_to(room.to_bare()))
            .await?
            .into_result()?;
        Ok(())
    }

    async fn admin_get(&self, room: &Jid, item: Element) -> Result<Vec<AdminListItem>> {
        let query = Element::builder("query", ns::MUC_ADMIN).append(item).build();
        let payload = self
            .conn
            .request(Iq::get(query).with_to(room.to_bare()))
            .await?
            .into_result()?
            .ok_or_else(|| Error::protocol("admin list without payload"))?;

        let mut items = Vec::new();
        for child in payload.children().filter(|c| c.is("item", ns::MUC_ADMIN)) {
            items.push(AdminListItem {
                jid: child.attr("jid").and_then(|j| j.parse().ok()),
                nick: child.attr("nick").map(str::to_string),
                affiliation: Affiliation::from_attr(child.attr("affiliation").unwrap_or("")),
                role: Role::from_attr(child.attr("role").unwrap_or("")),
            });
        }
        Ok(items)
    }

    fn room_context(&self, from: Option<&Jid>) -> Option<Jid> {
        let from = from?;
        let bare = from.to_bare();
        self.joined.contains_key(&bare).then_some(bare)
    }

    fn handle_room_presence(&self, presence: &Presence, im: &Im) -> bool {
        let Some(from) = &presence.from else {
            return false;
        };
        let room = from.to_bare();

        if presence.kind == PresenceKind::Error {
            if self.joined.contains_key(&room) {
                // A join rejection removes the pending room.
                self.joined.remove(&room);
                if let Some(error) = presence.error.clone() {
                    im.events().emit(Event::GroupMucError(MucError { room, error }));
                }
                return true;
            }
            return false;
        }

        let Some(x) = presence.payload("x", ns::MUC_USER) else {
            return false;
        };
        let nick = from.resource().unwrap_or("").to_string();

        let mut occupant = Occupant {
            room: room.clone(),
            nick,
            real_jid: None,
            affiliation: Affiliation::None,
            role: Role::None,
        };
        if let Some(item) = x.get_child("item", ns::MUC_USER) {
            occupant.affiliation = Affiliation::from_attr(item.attr("affiliation").unwrap_or(""));
            occupant.role = Role::from_attr(item.attr("role").unwrap_or(""));
            occupant.real_jid = item.attr("jid").and_then(|j| j.parse().ok());
        }

        let mut statuses = StatusCodes::default();
        for status in x.children().filter(|c| c.is("status", ns::MUC_USER)) {
            if let Some(code) = status.attr("code").and_then(|c| c.parse().ok()) {
                statuses.insert(code);
            }
        }

        let available = presence.kind != PresenceKind::Unavailable;
        let update = GroupPresence {
            occupant,
            available,
            statuses,
        };
        if !available && update.is_self() {
            self.joined.remove(&room);
        }
        im.events().emit(Event::GroupPresenceChanged(update));
        true
    }

    fn handle_room_message(&self, message: &Message, im: &Im) -> bool {
        // Mediated invite / decline.
        if let Some(x) = message.payload("x", ns::MUC_USER) {
            if let Some(invite) = x.get_child("invite", ns::MUC_USER) {
                let Some(room) = message.from.as_ref().map(Jid::to_bare) else {
                    return false;
                };
                im.events().emit(Event::GroupInviteReceived(MucInvite {
                    room,
                    from: invite.attr("from").and_then(|j| j.parse().ok()),
                    reason: invite.get_child("reason", ns::MUC_USER).map(|r| r.text()),
                    password: x.get_child("password", ns::MUC_USER).map(|p| p.text()),
                    direct: false,
                }));
                return true;
            }
            if let Some(decline) = x.get_child("decline", ns::MUC_USER) {
                let Some(room) = message.from.as_ref().map(Jid::to_bare) else {
                    return false;
                };
                im.events().emit(Event::GroupInviteDeclined(MucInviteDeclined {
                    room,
                    from: decline.attr("from").and_then(|j| j.parse().ok()),
                    reason: decline.get_child("reason", ns::MUC_USER).map(|r| r.text()),
                }));
                return true;
            }
        }

        // Direct invite.
        if let Some(x) = message.payload("x", ns::CONFERENCE) {
            if let Some(room) = x.attr("jid").and_then(|j| j.parse::<Jid>().ok()) {
                im.events().emit(Event::GroupInviteReceived(MucInvite {
                    room: room.to_bare(),
                    from: message.from.as_ref().map(Jid::to_bare),
                    reason: x.attr("reason").map(str::to_string),
                    password: x.attr("password").map(str::to_string),
                    direct: true,
                }));
                return true;
            }
        }

        // Moderated voice request forwarded to us.
        if let Some(form_elem) = message.payload("x", ns::DATA_FORMS) {
            if let Ok(form) = DataForm::from_element(form_elem) {
                if form.declared_type() == Some(ns::MUC_REQUEST) {
                    if let Some(room) = self.room_context(message.from.as_ref()) {
                        let submitted = {
                            let handler = self.voice_handler.lock().unwrap();
                            handler.as_ref().and_then(|h| h(form))
                        };
                        if let Some(submitted) = submitted {
                            let reply = Message::new(MessageKind::Normal)
                                .with_to(room)
                                .with_payload(submitted.to_element());
                            self.conn.send_stanza_background(Stanza::Message(reply));
                        } else {
                            debug!("voice request left unanswered");
                        }
                        return true;
                    }
                }
            }
        }

        // Errors and subject changes only make sense for joined rooms.
        let Some(room) = self.room_context(message.from.as_ref()) else {
            return false;
        };

        if message.kind == MessageKind::Error {
            if let Some(error) = message.error.clone() {
                im.events().emit(Event::GroupMucError(MucError { room, error }));
                return true;
            }
            return false;
        }

        if message.kind == MessageKind::Groupchat
            && message.subject().is_some()
            && message.body().is_none()
        {
            let nick = message
                .from
                .as_ref()
                .and_then(|f| f.resource())
                .map(str::to_string);
            im.events().emit(Event::GroupChatSubjectChanged {
                room,
                nick,
                subject: message.subject().unwrap_or("").to_string(),
            });
            return true;
        }

        false
    }
}

impl Extension for MultiUserChat {
    fn tag(&self) -> &'static str {
        "MultiUserChat"
    }

    fn namespaces(&self) -> Vec<String> {
        vec![ns::MUC.to_string(), ns::MUC_USER.to_string()]
    }

    fn filter_input(&self, stanza: &mut Stanza, im: &Im) -> bool {
        match stanza {
            Stanza::Presence(presence) => self.handle_room_presence(presence, im),
            Stanza::Message(message) => self.handle_room_message(message, im),
            Stanza::Iq(_) => false,
        }
    }

    fn detached(&self) {
        if !self.joined.is_empty() {
            warn!(rooms = self.joined.len(), "detaching with joined rooms");
        }
        self.joined.clear();
    }
}

impl ExtensionBuild for MultiUserChat {
    const TAG: &'static str = "MultiUserChat";

    fn dependencies() -> &'static [&'static str] {
        &["ServiceDiscovery"]
    }

    fn build(im: &Arc<Im>) -> Result<Arc<Self>> {
        let disco = im.load_extension::<ServiceDiscovery>()?;
        Ok(Arc::new(Self {
            conn: im.connection().clone(),
            disco,
            joined: DashMap::new(),
            voice_handler: Mutex::new(None),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClientConfig;

    fn muc_im() -> (Arc<Im>, Arc<MultiUserChat>) {
        let conn = Connection::new(ClientConfig::new("test", "alice", "pw").unwrap());
        let im = Im::new(&conn);
        let muc = im.load_extension::<MultiUserChat>().unwrap();
        (im, muc)
    }

    fn presence(xml: &str) -> Presence {
        Presence::from_element(&xml.parse().unwrap()).unwrap()
    }

    fn message(xml: &str) -> Message {
        Message::from_element(&xml.parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn occupant_presence_fans_out_with_status_codes() {
        let (im, muc) = muc_im();
        muc.joined
            .insert("room@conf.test".parse().unwrap(), "alice".into());
        let mut events = im.events().subscribe();

        let p = presence(
            "<presence xmlns='jabber:client' from='room@conf.test/alice'>\
             <x xmlns='http://jabber.org/protocol/muc#user'>\
             <item affiliation='owner' role='moderator' jid='alice@test/home'/>\
             <status code='110'/><status code='201'/></x></presence>",
        );
        let consumed = muc.filter_input(&mut Stanza::Presence(p), &im);
        assert!(consumed);

        match events.try_recv().unwrap() {
            Event::GroupPresenceChanged(update) => {
                assert_eq!(update.occupant.nick, "alice");
                assert_eq!(update.occupant.affiliation, Affiliation::Owner);
                assert_eq!(update.occupant.role, Role::Moderator);
                assert!(update.is_self());
                assert!(update.statuses.contains(StatusCodes::ROOM_CREATED));
                assert!(update.available);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn self_unavailable_presence_clears_the_room() {
        let (im, muc) = muc_im();
        let room: Jid = "room@conf.test".parse().unwrap();
        muc.joined.insert(room.clone(), "alice".into());

        let p = presence(
            "<presence xmlns='jabber:client' type='unavailable' from='room@conf.test/alice'>\
             <x xmlns='http://jabber.org/protocol/muc#user'>\
             <item affiliation='member' role='none'/><status code='110'/></x></presence>",
        );
        muc.filter_input(&mut Stanza::Presence(p), &im);
        assert!(muc.joined_rooms().is_empty());
    }

    #[tokio::test]
    async fn mediated_invite_raises_event() {
        let (im, muc) = muc_im();
        let mut events = im.events().subscribe();

        let m = message(
            "<message xmlns='jabber:client' from='room@conf.test'>\
             <x xmlns='http://jabber.org/protocol/muc#user'>\
             <invite from='bob@test'><reason>join us</reason></invite>\
             <password>sekrit</password></x></message>",
        );
        assert!(muc.filter_input(&mut Stanza::Message(m), &im));

        match events.try_recv().unwrap() {
            Event::GroupInviteReceived(invite) => {
                assert_eq!(invite.room.to_string(), "room@conf.test");
                assert!(!invite.direct);
                assert_eq!(invite.password.as_deref(), Some("sekrit"));
                assert_eq!(invite.reason.as_deref(), Some("join us"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn direct_invite_raises_event() {
        let (im, muc) = muc_im();
        let mut events = im.events().subscribe();

        let m = message(
            "<message xmlns='jabber:client' from='bob@test/desk'>\
             <x xmlns='jabber:x:conference' jid='room@conf.test' reason='come'/></message>",
        );
        assert!(muc.filter_input(&mut Stanza::Message(m), &im));

        match events.try_recv().unwrap() {
            Event::GroupInviteReceived(invite) => {
                assert!(invite.direct);
                assert_eq!(invite.room.to_string(), "room@conf.test");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn subject_change_in_joined_room_raises_event() {
        let (im, muc) = muc_im();
        muc.joined
            .insert("room@conf.test".parse().unwrap(), "alice".into());
        let mut events = im.events().subscribe();

        let m = message(
            "<message xmlns='jabber:client' type='groupchat' from='room@conf.test/bob'>\
             <subject>welcome</subject></message>",
        );
        assert!(muc.filter_input(&mut Stanza::Message(m), &im));

        match events.try_recv().unwrap() {
            Event::GroupChatSubjectChanged { room, nick, subject } => {
                assert_eq!(room.to_string(), "room@conf.test");
                assert_eq!(nick.as_deref(), Some("bob"));
                assert_eq!(subject, "welcome");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn groupchat_body_message_is_not_consumed() {
        let (im, muc) = muc_im();
        muc.joined
            .insert("room@conf.test".parse().unwrap(), "alice".into());

        let m = message(
            "<message xmlns='jabber:client' type='groupchat' from='room@conf.test/bob'>\
             <body>hi folks</body></message>",
        );
        assert!(!muc.filter_input(&mut Stanza::Message(m), &im));
    }

    #[tokio::test]
    async fn join_error_presence_maps_to_muc_error() {
        let (im, muc) = muc_im();
        let room: Jid = "room@conf.test".parse().unwrap();
        muc.joined.insert(room.clone(), "alice".into());
        let mut events = im.events().subscribe();

        let p = presence(
            "<presence xmlns='jabber:client' type='error' from='room@conf.test/alice'>\
             <error type='auth'>\
             <registration-required xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
             </error></presence>",
        );
        assert!(muc.filter_input(&mut Stanza::Presence(p), &im));
        assert!(muc.joined_rooms().is_empty());

        match events.try_recv().unwrap() {
            Event::GroupMucError(error) => {
                assert_eq!(error.room, room);
                assert_eq!(
                    error.error.condition,
                    crate::error::StanzaErrorCondition::RegistrationRequired
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn presence_from_unknown_jid_without_muc_payload_passes() {
        let (im, muc) = muc_im();
        let p = presence("<presence xmlns='jabber:client' from='bob@test/desk'/>");
        assert!(!muc.filter_input(&mut Stanza::Presence(p), &im));
    }
}
