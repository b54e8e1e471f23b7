//! End-to-end session lifecycle against the scripted peer: login with
//! roster fetch and initial presence, close handshake, and the IQ
//! timeout boundary.

mod common;

use std::time::{Duration, Instant};

use rookery_xmpp::stanza::Availability;
use rookery_xmpp::{Connection, Error, Im, SessionState};

use common::{client_config, serve};

#[tokio::test]
async fn login_fetches_roster_and_broadcasts_presence() {
    let (addr, peer_task) = serve("alice", |mut peer| async move {
        peer.answer_roster_get(&[
            "<item jid='bob@test' name='Bob' subscription='both'/>",
        ])
        .await;

        // authenticate() broadcasts availability after the roster.
        let presence = peer.read_element().await;
        assert_eq!(presence.name(), "presence");
        assert!(presence.attr("type").is_none());

        peer.expect_stream_close().await;
    })
    .await;

    let conn = Connection::new(client_config(addr, "alice"));
    let im = Im::new(&conn);
    im.authenticate().await.expect("authenticate");

    assert_eq!(conn.state(), SessionState::Ready);
    assert!(conn.authenticated());
    assert_eq!(
        conn.jid().unwrap().to_string(),
        "alice@test/rk1"
    );

    let roster = im.roster();
    assert_eq!(roster.len(), 1);
    let bob = roster.iter().next().unwrap();
    assert_eq!(bob.jid.to_string(), "bob@test");
    assert_eq!(bob.name.as_deref(), Some("Bob"));

    im.close().await.expect("close");
    peer_task.await.expect("peer script");

    // Disposed for good.
    assert!(matches!(
        im.get_roster().await,
        Err(Error::AlreadyDisposed)
    ));
}

#[tokio::test]
async fn simple_authenticate_skips_roster_and_presence() {
    let (addr, peer_task) = serve("alice", |mut peer| async move {
        // The very next element must already be the close; no roster
        // get, no presence.
        peer.expect_stream_close().await;
    })
    .await;

    let conn = Connection::new(client_config(addr, "alice"));
    let im = Im::new(&conn);
    im.simple_authenticate().await.expect("authenticate");
    assert!(conn.jid().is_some());

    im.close().await.expect("close");
    peer_task.await.expect("peer script");
}

#[tokio::test]
async fn unanswered_iq_times_out_within_its_deadline() {
    let (addr, _peer_task) = serve("alice", |mut peer| async move {
        // Swallow the request and never answer.
        let _ = peer.read_element().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
    })
    .await;

    let mut config = client_config(addr, "alice");
    config.default_timeout = Some(Duration::from_millis(50));
    let conn = Connection::new(config);
    let im = Im::new(&conn);
    im.simple_authenticate().await.expect("authenticate");

    let started = Instant::now();
    let result = im.get_roster().await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(Error::Timeout)));
    assert!(
        elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(500),
        "timeout fired after {elapsed:?}"
    );
}

#[tokio::test]
async fn set_status_produces_show_priority_and_status() {
    let (addr, peer_task) = serve("alice", |mut peer| async move {
        let presence = peer.read_element().await;
        assert_eq!(presence.name(), "presence");
        assert_eq!(
            presence.get_child("show", "jabber:client").unwrap().text(),
            "dnd"
        );
        assert_eq!(
            presence.get_child("priority", "jabber:client").unwrap().text(),
            "7"
        );
        assert_eq!(
            presence.get_child("status", "jabber:client").unwrap().text(),
            "in a meeting"
        );
    })
    .await;

    let conn = Connection::new(client_config(addr, "alice"));
    let im = Im::new(&conn);
    im.simple_authenticate().await.expect("authenticate");

    let mut statuses = std::collections::BTreeMap::new();
    statuses.insert(String::new(), "in a meeting".to_string());
    im.set_status(Availability::Dnd, 7, statuses)
        .await
        .expect("set_status");

    peer_task.await.expect("peer script");
}
