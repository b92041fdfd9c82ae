//! XDB waiter lifecycle against a storage component that never answers.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use roost_xmpp::beat::Heartbeat;
use roost_xmpp::ns;
use roost_xmpp::router::{
    HandlerOutcome, HandlerPhase, Instance, InstanceKind, PacketHandler, Router, RouterConfig,
};
use roost_xmpp::stanza::Packet;
use roost_xmpp::xdb::{XdbCache, XdbConfig};

/// Storage that swallows every request and counts them.
struct Blackhole {
    requests: AtomicU32,
}

#[async_trait]
impl PacketHandler for Blackhole {
    async fn handle(&self, _packet: Packet) -> HandlerOutcome {
        self.requests.fetch_add(1, Ordering::SeqCst);
        HandlerOutcome::Done
    }
}

fn tight_config() -> XdbConfig {
    XdbConfig {
        retry: Duration::from_millis(100),
        expire: Duration::from_millis(300),
        sweep: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn get_times_out_with_one_retry() {
    let router = Router::new(RouterConfig::default());

    let blackhole = Arc::new(Blackhole {
        requests: AtomicU32::new(0),
    });
    let storage = Instance::new("xdb", InstanceKind::Xdb);
    storage.register_handler(HandlerPhase::Deliver, Arc::clone(&blackhole) as _);
    router.registry().set_default(storage);

    let sm_instance = Instance::new("h", InstanceKind::Normal);
    let cache = XdbCache::new(router.clone(), "h", tight_config());
    cache.attach(&sm_instance);
    router.registry().register("h", sm_instance);

    let heartbeat = Heartbeat::new();
    cache.register_sweep(&heartbeat);

    let owner: jid::Jid = "u@h".parse().unwrap();
    let started = std::time::Instant::now();
    let result = cache.get(&owner, ns::ROSTER).await.unwrap();
    let elapsed = started.elapsed();

    // the caller is unblocked with the no-result sentinel
    assert!(result.is_none());

    // woken by the hard expiry, not the backstop
    assert!(
        elapsed >= Duration::from_millis(250) && elapsed < Duration::from_millis(600),
        "expired after {:?}",
        elapsed
    );

    // initial send plus exactly one resend
    assert_eq!(blackhole.requests.load(Ordering::SeqCst), 2);

    // the ring no longer holds the waiter
    assert_eq!(cache.pending_len(), 0);

    heartbeat.shutdown();
}

#[tokio::test]
async fn set_times_out_with_error() {
    let router = Router::new(RouterConfig::default());

    let storage = Instance::new("xdb", InstanceKind::Xdb);
    storage.register_handler(
        HandlerPhase::Deliver,
        Arc::new(Blackhole {
            requests: AtomicU32::new(0),
        }) as _,
    );
    router.registry().set_default(storage);

    let sm_instance = Instance::new("h", InstanceKind::Normal);
    let cache = XdbCache::new(router.clone(), "h", tight_config());
    cache.attach(&sm_instance);
    router.registry().register("h", sm_instance);

    let heartbeat = Heartbeat::new();
    cache.register_sweep(&heartbeat);

    let owner: jid::Jid = "u@h".parse().unwrap();
    let payload = minidom::Element::builder("query", ns::ROSTER).build();
    let result = cache.set(&owner, ns::ROSTER, Some(payload)).await;

    assert!(matches!(
        result,
        Err(roost_xmpp::XmppError::StorageTimeout)
    ));
    assert_eq!(cache.pending_len(), 0);

    heartbeat.shutdown();
}

#[tokio::test]
async fn concurrent_waiters_resolve_independently() {
    // one caller asks a live store, another asks one that never answers;
    // the slow waiter must not hold up the fast one
    let server = common::TestServer::start_with_xdb_config(tight_config());
    let heartbeat = Heartbeat::new();
    server.xdb.register_sweep(&heartbeat);

    let owner: jid::Jid = "u@h".parse().unwrap();
    server.register_user("u@h", "pw").await;

    let fast = {
        let xdb = server.xdb.clone();
        let owner = owner.clone();
        tokio::spawn(async move { xdb.get(&owner, ns::AUTH).await })
    };
    let answered = tokio::time::timeout(Duration::from_millis(200), fast)
        .await
        .expect("fast waiter should resolve quickly")
        .unwrap()
        .unwrap();
    assert!(answered.is_some());

    heartbeat.shutdown();
}
