//! Shared test fixture: a fully wired in-process server with a capture
//! instance standing in for the client connector.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use jid::Jid;
use minidom::Element;
use tokio::sync::{mpsc, Mutex};

use roost_xmpp::ns;
use roost_xmpp::router::{
    HandlerOutcome, HandlerPhase, Instance, InstanceKind, PacketHandler, Router, RouterConfig,
};
use roost_xmpp::sm::modules::auth::AuthModule;
use roost_xmpp::sm::modules::disco::{BrowseModule, Directory, DiscoModule};
use roost_xmpp::sm::modules::offline::OfflineModule;
use roost_xmpp::sm::modules::presence::PresenceModule;
use roost_xmpp::sm::modules::private::PrivateModule;
use roost_xmpp::sm::modules::register::RegisterModule;
use roost_xmpp::sm::modules::roster::RosterModule;
use roost_xmpp::sm::modules::vcard::VcardModule;
use roost_xmpp::sm::modules::Module;
use roost_xmpp::sm::{SessionManager, SmConfig};
use roost_xmpp::stanza::Packet;
use roost_xmpp::xdb::backend::MemoryXdb;
use roost_xmpp::xdb::{XdbCache, XdbConfig};

/// Domain served by the test session manager.
pub const HOST: &str = "h";

/// Domain of the capture connector.
pub const CONNECTOR: &str = "c2s.h";

/// Captures every element routed to an instance.
pub struct Capture {
    tx: mpsc::UnboundedSender<Element>,
    rx: Mutex<mpsc::UnboundedReceiver<Element>>,
}

impl Capture {
    pub fn new() -> Arc<Capture> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Capture {
            tx,
            rx: Mutex::new(rx),
        })
    }

    pub fn attach(self: &Arc<Self>, instance: &Instance) {
        instance.register_handler(
            HandlerPhase::Deliver,
            Arc::new(CaptureHandler {
                tx: self.tx.clone(),
            }),
        );
    }

    /// Next captured element, failing after a grace period.
    pub async fn next(&self) -> Element {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for a captured element")
            .expect("capture channel closed")
    }

    /// Skip elements until one satisfies the predicate.
    pub async fn next_matching(&self, what: &str, pred: impl Fn(&Element) -> bool) -> Element {
        for _ in 0..32 {
            let elem = self.next().await;
            if pred(&elem) {
                return elem;
            }
        }
        panic!("never captured: {}", what);
    }

    /// Everything captured so far, without waiting.
    pub async fn drain(&self) -> Vec<Element> {
        let mut rx = self.rx.lock().await;
        let mut seen = Vec::new();
        while let Ok(elem) = rx.try_recv() {
            seen.push(elem);
        }
        seen
    }
}

struct CaptureHandler {
    tx: mpsc::UnboundedSender<Element>,
}

#[async_trait::async_trait]
impl PacketHandler for CaptureHandler {
    async fn handle(&self, packet: Packet) -> HandlerOutcome {
        let _ = self.tx.send(packet.elem);
        HandlerOutcome::Done
    }
}

/// A wired router + storage + session manager + capture connector.
pub struct TestServer {
    pub router: Router,
    pub xdb: XdbCache,
    pub sm: SessionManager,
    pub connector: Arc<Capture>,
}

pub fn modules() -> Vec<Arc<dyn Module>> {
    vec![
        RosterModule::new(),
        OfflineModule::new(),
        PresenceModule::new(),
        AuthModule::new(),
        RegisterModule::new(),
        DiscoModule::new(Directory::default()),
        BrowseModule::new(Directory::default()),
        PrivateModule::new(),
        VcardModule::new(),
    ]
}

impl TestServer {
    pub fn start() -> TestServer {
        Self::start_with_xdb_config(XdbConfig::default())
    }

    pub fn start_with_xdb_config(xdb_config: XdbConfig) -> TestServer {
        let router = Router::new(RouterConfig::default());

        let storage = Instance::new("xdb", InstanceKind::Xdb);
        MemoryXdb::new(router.clone()).attach(&storage);
        router.registry().set_default(storage);

        let sm_instance = Instance::new(HOST, InstanceKind::Normal);
        let xdb = XdbCache::new(router.clone(), HOST, xdb_config);
        xdb.attach(&sm_instance);

        let sm = SessionManager::new(
            router.clone(),
            xdb.clone(),
            SmConfig {
                hosts: vec![HOST.to_string()],
                ..SmConfig::default()
            },
            modules(),
        );
        sm.attach(&sm_instance);
        router.registry().register(HOST, sm_instance);

        let connector = Capture::new();
        let conn_instance = Instance::new(CONNECTOR, InstanceKind::Normal);
        connector.attach(&conn_instance);
        router.registry().register(CONNECTOR, conn_instance);

        TestServer {
            router,
            xdb,
            sm,
            connector,
        }
    }

    /// Create a credential record so the user exists.
    pub async fn register_user(&self, bare: &str, password: &str) {
        let owner: Jid = bare.parse().unwrap();
        let record = Element::builder("password", ns::AUTH)
            .append(password.to_string())
            .build();
        self.xdb
            .set(&owner, ns::AUTH, Some(record))
            .await
            .expect("credential store");
    }

    /// The connector-side address a session's traffic comes from.
    pub fn conn_jid(full: &str) -> String {
        let resource = full.rsplit('/').next().unwrap();
        format!("conn@{}/{}", CONNECTOR, resource)
    }

    pub async fn deliver(&self, elem: Element) {
        let packet = Packet::from_element(elem).expect("routable element");
        self.router.deliver(packet).await;
    }

    /// Establish a session the way a client connector would.
    pub async fn establish_session(&self, full: &str) {
        let conn = Self::conn_jid(full);
        let route = Element::builder("route", ns::SERVER)
            .attr("type", "session")
            .attr("to", full)
            .attr("from", conn.clone())
            .build();
        self.deliver(route).await;

        self.connector
            .next_matching("session ack", |elem| {
                elem.name() == "route"
                    && elem.attr("type") == Some("session")
                    && elem.attr("to") == Some(conn.as_str())
            })
            .await;
    }

    /// Send a stanza from an established session.
    pub async fn client_send(&self, full: &str, stanza: Element) {
        let route = Element::builder("route", ns::SERVER)
            .attr("to", full)
            .attr("from", Self::conn_jid(full))
            .append(stanza)
            .build();
        self.deliver(route).await;
    }

    /// Fetch a session's roster, marking it roster-capable.
    pub async fn fetch_roster(&self, full: &str) -> Element {
        let iq = Element::builder("iq", ns::SERVER)
            .attr("type", "get")
            .attr("id", "roster-1")
            .append(Element::builder("query", ns::ROSTER).build())
            .build();
        self.client_send(full, iq).await;
        self.connector
            .next_matching("roster result", |elem| {
                elem.name() == "route"
                    && elem
                        .children()
                        .next()
                        .map(|iq| iq.has_child("query", ns::ROSTER))
                        .unwrap_or(false)
            })
            .await
    }
}

/// Build a message stanza.
pub fn message(to: &str, from: &str, body: &str) -> Element {
    Element::builder("message", ns::SERVER)
        .attr("to", to)
        .attr("from", from)
        .append(
            Element::builder("body", ns::SERVER)
                .append(body.to_string())
                .build(),
        )
        .build()
}

/// Build a presence stanza with an optional type and priority.
pub fn presence(ptype: Option<&str>, priority: Option<i32>) -> Element {
    let mut builder = Element::builder("presence", ns::SERVER);
    if let Some(ptype) = ptype {
        builder = builder.attr("type", ptype);
    }
    if let Some(priority) = priority {
        builder = builder.append(
            Element::builder("priority", ns::SERVER)
                .append(priority.to_string())
                .build(),
        );
    }
    builder.build()
}
