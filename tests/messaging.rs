//! Message round-trips and the subscription handshake against the
//! scripted peer.

mod common;

use std::time::Duration;

use rookery_xmpp::stanza::Message;
use rookery_xmpp::{Connection, Event, Im};

use common::{client_config, serve};

async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event bus") {
                Event::Connect(_) => continue,
                other => return other,
            }
        }
    })
    .await
    .expect("no event arrived")
}

#[tokio::test]
async fn chat_message_round_trip() {
    let (addr, peer_task) = serve("alice", |mut peer| async move {
        // Outbound direction: one stanza with the body on the wire.
        let message = peer.read_element().await;
        assert_eq!(message.name(), "message");
        assert_eq!(message.attr("type"), Some("chat"));
        assert_eq!(message.attr("to"), Some("bob@test"));
        assert_eq!(
            message.get_child("body", "jabber:client").unwrap().text(),
            "hi"
        );

        // Reverse direction.
        peer.send(
            "<message type='chat' from='bob@test/desk' to='alice@test/rk1'>\
             <body>hi back</body></message>",
        )
        .await;
    })
    .await;

    let conn = Connection::new(client_config(addr, "alice"));
    let im = Im::new(&conn);
    im.simple_authenticate().await.expect("authenticate");
    let mut events = im.events().subscribe();

    im.send_message(Message::chat("bob@test".parse().unwrap(), "hi"))
        .await
        .expect("send");

    match next_event(&mut events).await {
        Event::Message(message) => {
            assert_eq!(message.body(), Some("hi back"));
            assert_eq!(message.from.unwrap().to_string(), "bob@test/desk");
        }
        other => panic!("unexpected event {other:?}"),
    }

    // Exactly once.
    assert!(matches!(
        events.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));
    peer_task.await.expect("peer script");
}

#[tokio::test]
async fn subscription_handshake_raises_approved_once() {
    let (addr, peer_task) = serve("alice", |mut peer| async move {
        let subscribe = peer.read_element().await;
        assert_eq!(subscribe.name(), "presence");
        assert_eq!(subscribe.attr("type"), Some("subscribe"));
        assert_eq!(subscribe.attr("to"), Some("bob@test"));

        peer.send("<presence type='subscribed' from='bob@test' to='alice@test/rk1'/>")
            .await;

        // The roster push the server would send alongside.
        peer.send(
            "<iq type='set' id='push-1'>\
             <query xmlns='jabber:iq:roster'>\
             <item jid='bob@test' subscription='to'/></query></iq>",
        )
        .await;
        // Push acknowledgement.
        let ack = peer.read_element().await;
        assert_eq!(ack.name(), "iq");
        assert_eq!(ack.attr("type"), Some("result"));
        assert_eq!(ack.attr("id"), Some("push-1"));
    })
    .await;

    let conn = Connection::new(client_config(addr, "alice"));
    let im = Im::new(&conn);
    im.simple_authenticate().await.expect("authenticate");
    let mut events = im.events().subscribe();

    im.request_subscription(&"bob@test".parse().unwrap())
        .await
        .expect("subscribe");

    match next_event(&mut events).await {
        Event::SubscriptionApproved(jid) => assert_eq!(jid.to_string(), "bob@test"),
        other => panic!("unexpected event {other:?}"),
    }
    match next_event(&mut events).await {
        Event::RosterUpdated(item) => {
            assert_eq!(item.jid.to_string(), "bob@test");
            assert_eq!(
                item.subscription,
                rookery_xmpp::im::roster::SubscriptionState::To
            );
        }
        other => panic!("unexpected event {other:?}"),
    }

    let roster = im.roster();
    assert!(roster.get(&"bob@test".parse().unwrap()).is_some());
    peer_task.await.expect("peer script");
}

#[tokio::test]
async fn inbound_subscribe_invokes_the_handler() {
    let (addr, peer_task) = serve("alice", |mut peer| async move {
        peer.send("<presence type='subscribe' from='carol@test' to='alice@test/rk1'/>")
            .await;

        // The handler approves, so a subscribed goes out.
        let approved = peer.read_element().await;
        assert_eq!(approved.name(), "presence");
        assert_eq!(approved.attr("type"), Some("subscribed"));
        assert_eq!(approved.attr("to"), Some("carol@test"));
    })
    .await;

    let conn = Connection::new(client_config(addr, "alice"));
    let im = Im::new(&conn);
    im.set_subscription_handler(|_jid| Some(rookery_xmpp::SubscriptionDecision::Approve));
    im.simple_authenticate().await.expect("authenticate");

    peer_task.await.expect("peer script");
}
