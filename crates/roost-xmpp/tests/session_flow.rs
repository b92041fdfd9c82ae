//! End-to-end flows through the session manager: offline storage and
//! drain, roster queries, and the subscription round trip.

mod common;

use chrono::Utc;
use common::{message, presence, TestServer, HOST};
use minidom::Element;
use roost_xmpp::ns;
use roost_xmpp::sm::roster::{Roster, Subscription};

fn spool_messages(spool: &Element) -> Vec<&Element> {
    spool.children().filter(|c| c.name() == "message").collect()
}

#[tokio::test]
async fn offline_message_is_stored_with_delay_stamp() {
    let server = TestServer::start();
    server.register_user("u@h", "pw").await;

    server
        .deliver(message("u@h", "c.h", "hi"))
        .await;

    let owner: jid::Jid = "u@h".parse().unwrap();
    let spool = server
        .xdb
        .get(&owner, ns::OFFLINE)
        .await
        .unwrap()
        .expect("offline spool exists");
    let stored = spool_messages(&spool);
    assert_eq!(stored.len(), 1);
    assert_eq!(
        stored[0].get_child("body", ns::SERVER).unwrap().text(),
        "hi"
    );

    // the delay stamp must be the storage time, give or take
    let delay = stored[0]
        .get_child("x", ns::DELAY)
        .expect("delay stamp present");
    let stamp = delay.attr("stamp").unwrap();
    let parsed = chrono::NaiveDateTime::parse_from_str(stamp, "%Y%m%dT%H:%M:%S").unwrap();
    let age = (Utc::now().naive_utc() - parsed).num_seconds().abs();
    assert!(age <= 2, "delay stamp off by {}s", age);
}

#[tokio::test]
async fn available_presence_drains_offline_spool() {
    let server = TestServer::start();
    server.register_user("u@h", "pw").await;
    server.deliver(message("u@h", "c.h", "hi")).await;

    server.establish_session("u@h/x").await;
    server.client_send("u@h/x", presence(None, Some(1))).await;

    let delivered = server
        .connector
        .next_matching("drained message", |elem| {
            elem.name() == "route"
                && elem
                    .children()
                    .next()
                    .map(|inner| {
                        inner.name() == "message"
                            && inner
                                .get_child("body", ns::SERVER)
                                .map(|body| body.text() == "hi")
                                .unwrap_or(false)
                    })
                    .unwrap_or(false)
        })
        .await;
    assert_eq!(delivered.attr("to"), Some(TestServer::conn_jid("u@h/x").as_str()));

    let owner: jid::Jid = "u@h".parse().unwrap();
    let spool = server.xdb.get(&owner, ns::OFFLINE).await.unwrap();
    assert!(
        spool.map(|s| spool_messages(&s).is_empty()).unwrap_or(true),
        "spool should be empty after drain"
    );
}

#[tokio::test]
async fn negative_priority_leaves_spool_alone() {
    let server = TestServer::start();
    server.register_user("u@h", "pw").await;
    server.deliver(message("u@h", "c.h", "hi")).await;

    server.establish_session("u@h/x").await;
    server.client_send("u@h/x", presence(None, Some(-1))).await;

    // give the pipeline a beat, then confirm the spool survived
    tokio::task::yield_now().await;
    let owner: jid::Jid = "u@h".parse().unwrap();
    let spool = server.xdb.get(&owner, ns::OFFLINE).await.unwrap().unwrap();
    assert_eq!(spool_messages(&spool).len(), 1);
}

#[tokio::test]
async fn expired_offline_message_is_dropped_on_drain() {
    let server = TestServer::start();
    server.register_user("u@h", "pw").await;

    // an expire hint of zero seconds: stored, but dead on arrival
    let mut msg = message("u@h", "c.h", "too late");
    msg.append_child(
        Element::builder("x", ns::EXPIRE)
            .attr("seconds", "0")
            .build(),
    );
    server.deliver(msg).await;

    let owner: jid::Jid = "u@h".parse().unwrap();
    let spool = server.xdb.get(&owner, ns::OFFLINE).await.unwrap().unwrap();
    assert_eq!(spool_messages(&spool).len(), 1, "stored immediately");

    server.establish_session("u@h/x").await;
    server.client_send("u@h/x", presence(None, Some(0))).await;

    // nothing delivered, spool erased
    let leaked = server.connector.drain().await.into_iter().any(|elem| {
        elem.children()
            .next()
            .map(|inner| inner.name() == "message")
            .unwrap_or(false)
    });
    assert!(!leaked, "expired message must not be delivered");

    let spool = server.xdb.get(&owner, ns::OFFLINE).await.unwrap();
    assert!(spool.map(|s| spool_messages(&s).is_empty()).unwrap_or(true));
}

#[tokio::test]
async fn untyped_message_to_unknown_user_bounces() {
    let server = TestServer::start();
    // register the sender's own host instance so the bounce is observable
    let observer = common::Capture::new();
    let peer_instance =
        roost_xmpp::router::Instance::new("peer.example", roost_xmpp::router::InstanceKind::Normal);
    observer.attach(&peer_instance);
    server.router.registry().register("peer.example", peer_instance);

    server
        .deliver(message("ghost@h", "someone@peer.example", "anyone home?"))
        .await;

    let bounce = observer
        .next_matching("bounce", |elem| elem.attr("type") == Some("error"))
        .await;
    let error = bounce.get_child("error", ns::SERVER).unwrap();
    assert!(error.has_child("item-not-found", ns::STANZAS));
}

#[tokio::test]
async fn subscription_round_trip_updates_both_rosters() {
    let server = TestServer::start();
    server.register_user("a@h", "pw").await;
    server.register_user("b@h", "pw").await;

    server.establish_session("a@h/x").await;
    server.establish_session("b@h/y").await;
    server.fetch_roster("a@h/x").await;
    server.fetch_roster("b@h/y").await;

    // both ends are online and visible
    server.client_send("a@h/x", presence(None, Some(1))).await;
    server.client_send("b@h/y", presence(None, Some(1))).await;

    // a asks to subscribe to b
    server
        .client_send("a@h/x", {
            let mut p = presence(Some("subscribe"), None);
            p.set_attr("to", "b@h");
            p
        })
        .await;

    // a's roster now holds the pending ask
    let owner_a: jid::Jid = "a@h".parse().unwrap();
    let stored = server.xdb.get(&owner_a, ns::ROSTER).await.unwrap().unwrap();
    let roster_a = Roster::from_element(&stored);
    let item = roster_a.item(&"b@h".parse().unwrap()).unwrap();
    assert_eq!(item.subscription, Subscription::None);
    assert!(item.ask.is_some());

    // b sees the request on its session
    server
        .connector
        .next_matching("forwarded subscribe", |elem| {
            elem.attr("to") == Some(TestServer::conn_jid("b@h/y").as_str())
                && elem
                    .children()
                    .next()
                    .map(|inner| {
                        inner.name() == "presence" && inner.attr("type") == Some("subscribe")
                    })
                    .unwrap_or(false)
        })
        .await;

    // b grants it
    server
        .client_send("b@h/y", {
            let mut p = presence(Some("subscribed"), None);
            p.set_attr("to", "a@h");
            p
        })
        .await;

    // both rosters converged
    let stored = server.xdb.get(&owner_a, ns::ROSTER).await.unwrap().unwrap();
    let roster_a = Roster::from_element(&stored);
    let item = roster_a.item(&"b@h".parse().unwrap()).unwrap();
    assert_eq!(item.subscription, Subscription::To);
    assert!(item.ask.is_none());

    let owner_b: jid::Jid = "b@h".parse().unwrap();
    let stored = server.xdb.get(&owner_b, ns::ROSTER).await.unwrap().unwrap();
    let roster_b = Roster::from_element(&stored);
    let item = roster_b.item(&"a@h".parse().unwrap()).unwrap();
    assert_eq!(item.subscription, Subscription::From);

    // a got a roster push reflecting the new state...
    server
        .connector
        .next_matching("roster push to a", |elem| {
            elem.attr("to") == Some(TestServer::conn_jid("a@h/x").as_str())
                && elem
                    .children()
                    .next()
                    .and_then(|iq| iq.get_child("query", ns::ROSTER))
                    .and_then(|query| query.children().next())
                    .map(|item| item.attr("subscription") == Some("to"))
                    .unwrap_or(false)
        })
        .await;

    // ...and b's presence, answering the reflected probe
    server
        .connector
        .next_matching("presence of b reaches a", |elem| {
            elem.attr("to") == Some(TestServer::conn_jid("a@h/x").as_str())
                && elem
                    .children()
                    .next()
                    .map(|inner| {
                        inner.name() == "presence"
                            && inner.attr("from") == Some("b@h/y")
                            && inner.attr("type").is_none()
                    })
                    .unwrap_or(false)
        })
        .await;
}

#[tokio::test]
async fn duplicate_subscribe_is_idempotent() {
    let server = TestServer::start();
    server.register_user("a@h", "pw").await;
    server.establish_session("a@h/x").await;
    server.fetch_roster("a@h/x").await;

    let observer = common::Capture::new();
    let peer_instance =
        roost_xmpp::router::Instance::new("h2", roost_xmpp::router::InstanceKind::Normal);
    observer.attach(&peer_instance);
    server.router.registry().register("h2", peer_instance);

    for _ in 0..2 {
        server
            .client_send("a@h/x", {
                let mut p = presence(Some("subscribe"), None);
                p.set_attr("to", "b@h2");
                p
            })
            .await;
    }

    // exactly one outbound subscribe left the server
    let outbound: Vec<Element> = observer.drain().await;
    assert_eq!(outbound.len(), 1, "one subscribe, not {}", outbound.len());
    assert_eq!(outbound[0].attr("type"), Some("subscribe"));

    // and the client saw exactly one roster push for the peer
    let pushes = server
        .connector
        .drain()
        .await
        .into_iter()
        .filter(|elem| {
            elem.children()
                .next()
                .and_then(|iq| iq.get_child("query", ns::ROSTER))
                .and_then(|query| query.children().next())
                .map(|item| item.attr("jid") == Some("b@h2"))
                .unwrap_or(false)
        })
        .count();
    assert_eq!(pushes, 1);
}

#[tokio::test]
async fn session_replacement_kicks_previous_resource() {
    let server = TestServer::start();
    server.register_user("u@h", "pw").await;
    server.establish_session("u@h/x").await;

    // same resource connects again: the old link hears about it first,
    // then the new session is acknowledged
    let route = Element::builder("route", ns::SERVER)
        .attr("type", "session")
        .attr("to", "u@h/x")
        .attr("from", TestServer::conn_jid("u@h/x"))
        .build();
    server.deliver(route).await;

    let kicked = server.connector.next().await;
    assert_eq!(kicked.name(), "route");
    assert_eq!(kicked.attr("type"), Some("error"));
    assert_eq!(kicked.attr("error"), Some("conflict"));

    let ack = server.connector.next().await;
    assert_eq!(ack.attr("type"), Some("session"));
}

#[tokio::test]
async fn server_disco_lists_module_features() {
    let server = TestServer::start();
    server.register_user("u@h", "pw").await;
    server.establish_session("u@h/x").await;

    let iq = Element::builder("iq", ns::SERVER)
        .attr("type", "get")
        .attr("id", "disco-1")
        .attr("to", HOST)
        .append(Element::builder("query", ns::DISCO_INFO).build())
        .build();
    server.client_send("u@h/x", iq).await;

    let reply = server
        .connector
        .next_matching("disco reply", |elem| {
            elem.children()
                .next()
                .map(|iq| iq.has_child("query", ns::DISCO_INFO))
                .unwrap_or(false)
        })
        .await;
    let query = reply
        .children()
        .next()
        .unwrap()
        .get_child("query", ns::DISCO_INFO)
        .unwrap();
    let features: Vec<&str> = query
        .children()
        .filter(|c| c.name() == "feature")
        .filter_map(|c| c.attr("var"))
        .collect();
    assert!(features.contains(&"msgoffline"));
    assert!(features.contains(&ns::ROSTER));
}
