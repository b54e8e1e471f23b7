//! MUC join and subject flows against the scripted peer.

mod common;

use std::time::Duration;

use rookery_xmpp::muc::{Affiliation, JoinOptions, MultiUserChat, Role, StatusCodes};
use rookery_xmpp::{Connection, Event, Im};

use common::{client_config, serve};

async fn next_muc_event(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event bus") {
                Event::Connect(_) | Event::StatusChanged { .. } => continue,
                other => return other,
            }
        }
    })
    .await
    .expect("no MUC event arrived")
}

#[tokio::test]
async fn join_and_edit_subject() {
    let (addr, peer_task) = serve("alice", |mut peer| async move {
        // Join presence with the MUC x envelope.
        let join = peer.read_element().await;
        assert_eq!(join.name(), "presence");
        assert_eq!(join.attr("to"), Some("room@conf.test/alice"));
        assert!(join
            .get_child("x", "http://jabber.org/protocol/muc")
            .is_some());

        // The service reflects the occupant presence: owner, moderator,
        // freshly created room (201), self presence (110).
        peer.send(
            "<presence from='room@conf.test/alice' to='alice@test/rk1'>\
             <x xmlns='http://jabber.org/protocol/muc#user'>\
             <item affiliation='owner' role='moderator'/>\
             <status code='110'/><status code='201'/>\
             </x></presence>",
        )
        .await;

        // Subject edit: groupchat message with only a subject.
        let subject = peer.read_element().await;
        assert_eq!(subject.name(), "message");
        assert_eq!(subject.attr("type"), Some("groupchat"));
        assert_eq!(subject.attr("to"), Some("room@conf.test"));
        assert_eq!(
            subject.get_child("subject", "jabber:client").unwrap().text(),
            "welcome"
        );
        assert!(subject.get_child("body", "jabber:client").is_none());

        // The service broadcasts the new subject back.
        peer.send(
            "<message type='groupchat' from='room@conf.test/alice' to='alice@test/rk1'>\
             <subject>welcome</subject></message>",
        )
        .await;
    })
    .await;

    let conn = Connection::new(client_config(addr, "alice"));
    let im = Im::new(&conn);
    let muc = im.load_extension::<MultiUserChat>().expect("load muc");
    im.simple_authenticate().await.expect("authenticate");
    let mut events = im.events().subscribe();

    let room = "room@conf.test".parse().unwrap();
    muc.join_room(&room, "alice", JoinOptions::default())
        .await
        .expect("join");

    match next_muc_event(&mut events).await {
        Event::GroupPresenceChanged(update) => {
            assert!(update.is_self());
            assert!(update.statuses.contains(StatusCodes::ROOM_CREATED));
            assert_eq!(update.occupant.affiliation, Affiliation::Owner);
            assert_eq!(update.occupant.role, Role::Moderator);
            assert_eq!(update.occupant.nick, "alice");
        }
        other => panic!("unexpected event {other:?}"),
    }

    muc.edit_room_subject(&room, "welcome")
        .await
        .expect("subject");

    match next_muc_event(&mut events).await {
        Event::GroupChatSubjectChanged { room, nick, subject } => {
            assert_eq!(room.to_string(), "room@conf.test");
            assert_eq!(nick.as_deref(), Some("alice"));
            assert_eq!(subject, "welcome");
        }
        other => panic!("unexpected event {other:?}"),
    }

    peer_task.await.expect("peer script");
}

#[tokio::test]
async fn kick_sends_admin_role_none() {
    let (addr, peer_task) = serve("alice", |mut peer| async move {
        let kick = peer.read_element().await;
        assert_eq!(kick.name(), "iq");
        assert_eq!(kick.attr("type"), Some("set"));
        assert_eq!(kick.attr("to"), Some("room@conf.test"));

        let query = kick
            .get_child("query", "http://jabber.org/protocol/muc#admin")
            .expect("admin query");
        let item = query
            .get_child("item", "http://jabber.org/protocol/muc#admin")
            .expect("item");
        assert_eq!(item.attr("nick"), Some("troll"));
        assert_eq!(item.attr("role"), Some("none"));

        let id = kick.attr("id").unwrap();
        peer.send(&format!("<iq type='result' id='{id}' from='room@conf.test'/>"))
            .await;
    })
    .await;

    let conn = Connection::new(client_config(addr, "alice"));
    let im = Im::new(&conn);
    let muc = im.load_extension::<MultiUserChat>().expect("load muc");
    im.simple_authenticate().await.expect("authenticate");

    muc.kick_occupant(&"room@conf.test".parse().unwrap(), "troll", Some("spam"))
        .await
        .expect("kick");
    peer_task.await.expect("peer script");
}

#[tokio::test]
async fn mediated_invite_raises_event_end_to_end() {
    let (addr, peer_task) = serve("alice", |mut peer| async move {
        peer.send(
            "<message from='room@conf.test' to='alice@test/rk1'>\
             <x xmlns='http://jabber.org/protocol/muc#user'>\
             <invite from='bob@test'><reason>join us</reason></invite>\
             </x></message>",
        )
        .await;
    })
    .await;

    let conn = Connection::new(client_config(addr, "alice"));
    let im = Im::new(&conn);
    im.load_extension::<MultiUserChat>().expect("load muc");
    // Subscribe before connecting; the peer sends the invite unprompted.
    let mut events = im.events().subscribe();
    im.simple_authenticate().await.expect("authenticate");

    match next_muc_event(&mut events).await {
        Event::GroupInviteReceived(invite) => {
            assert_eq!(invite.room.to_string(), "room@conf.test");
            assert_eq!(invite.reason.as_deref(), Some("join us"));
            assert!(!invite.direct);
        }
        other => panic!("unexpected event {other:?}"),
    }
    peer_task.await.expect("peer script");
}
