//! XDB cache: synchronous-feeling storage calls over asynchronous
//! request/response packets.
//!
//! Modules call [`XdbCache::get`] and [`XdbCache::set`] and block on the
//! reply. Under the hood each call allocates a fresh id, parks a oneshot
//! waiter keyed by that id, and emits an `<xdb/>` request through the
//! router to the storage component. The reply comes back addressed to this
//! cache's instance, where a `Precond` handler claims it before normal
//! routing and completes the waiter. A periodic sweep resends requests
//! that have waited past the retry threshold (ids are stable, so resends
//! are idempotent) and expires waiters past the hard timeout.

pub mod backend;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use jid::Jid;
use minidom::Element;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::beat::Heartbeat;
use crate::error::XmppError;
use crate::ns;
use crate::router::{HandlerOutcome, HandlerPhase, Instance, PacketHandler, Router};
use crate::stanza::{Packet, PacketClass};

/// Timing knobs for the cache. The defaults match the classic discipline:
/// resend once after 10 s, give up after 30 s, sweep every 10 s.
#[derive(Debug, Clone, Copy)]
pub struct XdbConfig {
    pub retry: Duration,
    pub expire: Duration,
    pub sweep: Duration,
}

impl Default for XdbConfig {
    fn default() -> Self {
        Self {
            retry: Duration::from_secs(10),
            expire: Duration::from_secs(30),
            sweep: Duration::from_secs(10),
        }
    }
}

/// Extended `set` actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdbAction {
    /// Remove matching children, then append the payload.
    Insert,
    /// Compare the payload against the selected node's text.
    Check,
}

impl XdbAction {
    fn as_str(self) -> &'static str {
        match self {
            XdbAction::Insert => "insert",
            XdbAction::Check => "check",
        }
    }
}

/// An in-flight request: everything needed to resend it or give up.
struct Waiter {
    request: Element,
    sent_at: Instant,
    resent: bool,
    tx: oneshot::Sender<Option<Element>>,
}

struct XdbCacheInner {
    router: Router,
    /// Instance id this cache issues requests from; replies come back here.
    self_id: String,
    config: XdbConfig,
    pending: DashMap<String, Waiter>,
    next_id: AtomicU64,
}

/// Handle to an XDB cache, one per requesting instance.
#[derive(Clone)]
pub struct XdbCache {
    inner: Arc<XdbCacheInner>,
}

impl XdbCache {
    pub fn new(router: Router, self_id: impl Into<String>, config: XdbConfig) -> XdbCache {
        XdbCache {
            inner: Arc::new(XdbCacheInner {
                router,
                self_id: self_id.into(),
                config,
                pending: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register the reply-intercept handler on the owning instance.
    ///
    /// Must run before the instance is registered for its domain, so no
    /// reply can arrive without an interceptor in place.
    pub fn attach(&self, instance: &Instance) {
        instance.register_handler(
            HandlerPhase::Precond,
            Arc::new(ReplyHandler {
                inner: Arc::clone(&self.inner),
            }),
        );
    }

    /// Register the timeout sweep with the heartbeat scheduler.
    pub fn register_sweep(&self, heartbeat: &Heartbeat) {
        let cache = self.clone();
        heartbeat.register(self.inner.config.sweep, move || {
            let cache = cache.clone();
            async move { cache.sweep().await }
        });
    }

    /// Fetch the stored document for `(owner, namespace)`.
    ///
    /// Returns `Ok(None)` both when nothing is stored and when the storage
    /// component timed out; the caller treats the store as unavailable
    /// either way.
    pub async fn get(&self, owner: &Jid, namespace: &str) -> Result<Option<Element>, XmppError> {
        let request = self.request_element("get", owner, namespace, None, None, None);
        match self.round_trip(request).await {
            None => Ok(None),
            Some(reply) => {
                if reply.attr("type") == Some("error") {
                    return Err(XmppError::Storage(format!("get {} refused", namespace)));
                }
                Ok(reply.children().next().cloned())
            }
        }
    }

    /// Replace the stored document for `(owner, namespace)`. A `None`
    /// payload erases it.
    pub async fn set(
        &self,
        owner: &Jid,
        namespace: &str,
        payload: Option<Element>,
    ) -> Result<(), XmppError> {
        let request = self.request_element("set", owner, namespace, None, None, payload);
        self.finish_set(request, namespace).await
    }

    /// Run an extended `set` action against the stored document.
    pub async fn act(
        &self,
        owner: &Jid,
        namespace: &str,
        action: XdbAction,
        matcher: Option<&str>,
        payload: Option<Element>,
    ) -> Result<(), XmppError> {
        let request =
            self.request_element("set", owner, namespace, Some(action), matcher, payload);
        self.finish_set(request, namespace).await
    }

    async fn finish_set(&self, request: Element, namespace: &str) -> Result<(), XmppError> {
        match self.round_trip(request).await {
            None => Err(XmppError::StorageTimeout),
            Some(reply) => {
                if reply.attr("type") == Some("result") {
                    Ok(())
                } else {
                    Err(XmppError::Storage(format!("set {} refused", namespace)))
                }
            }
        }
    }

    fn request_element(
        &self,
        xdb_type: &str,
        owner: &Jid,
        namespace: &str,
        action: Option<XdbAction>,
        matcher: Option<&str>,
        payload: Option<Element>,
    ) -> Element {
        let mut builder = Element::builder("xdb", ns::SERVER)
            .attr("type", xdb_type)
            .attr("to", owner.to_bare().to_string())
            .attr("from", self.inner.self_id.clone())
            .attr("ns", namespace);
        if let Some(action) = action {
            builder = builder.attr("action", action.as_str());
        }
        if let Some(matcher) = matcher {
            builder = builder.attr("match", matcher);
        }
        if let Some(payload) = payload {
            builder = builder.append(payload);
        }
        builder.build()
    }

    /// Issue a request and block until its reply or expiry.
    async fn round_trip(&self, mut request: Element) -> Option<Element> {
        let id = self
            .inner
            .next_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        request.set_attr("id", id.clone());

        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(
            id.clone(),
            Waiter {
                request: request.clone(),
                sent_at: Instant::now(),
                resent: false,
                tx,
            },
        );

        let packet = match Packet::from_element(request) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(error = %err, "unroutable xdb request");
                self.inner.pending.remove(&id);
                return None;
            }
        };
        self.inner.router.deliver(packet).await;

        // The sweep is what wakes us on timeout; the outer timeout is a
        // backstop for a cache without a running heartbeat.
        let backstop = self.inner.config.expire + self.inner.config.sweep * 2;
        match tokio::time::timeout(backstop, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => None,
            Err(_) => {
                self.inner.pending.remove(&id);
                None
            }
        }
    }

    /// Expire stale waiters and resend slow ones. Runs on the heartbeat.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut resend = Vec::new();

        for mut entry in self.inner.pending.iter_mut() {
            let age = now.duration_since(entry.sent_at);
            if age >= self.inner.config.expire {
                expired.push(entry.key().clone());
            } else if age >= self.inner.config.retry && !entry.resent {
                entry.resent = true;
                resend.push(entry.request.clone());
            }
        }

        for id in expired {
            if let Some((_, waiter)) = self.inner.pending.remove(&id) {
                warn!(id = %id, "xdb request expired");
                let _ = waiter.tx.send(None);
            }
        }

        for request in resend {
            debug!(id = ?request.attr("id"), "resending slow xdb request");
            if let Ok(packet) = Packet::from_element(request) {
                self.inner.router.deliver(packet).await;
            }
        }
    }

    /// Number of in-flight waiters (test observability).
    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }
}

/// `Precond` handler that claims xdb replies addressed to this instance.
struct ReplyHandler {
    inner: Arc<XdbCacheInner>,
}

#[async_trait]
impl PacketHandler for ReplyHandler {
    async fn handle(&self, packet: Packet) -> HandlerOutcome {
        if packet.class == PacketClass::Xdb
            && matches!(packet.stanza_type(), Some("result") | Some("error"))
        {
            if let Some(id) = packet.elem.attr("id") {
                if let Some((_, waiter)) = self.inner.pending.remove(id) {
                    let _ = waiter.tx.send(Some(packet.elem));
                    return HandlerOutcome::Done;
                }
                debug!(id = %id, "xdb reply with no matching waiter, dropping");
                return HandlerOutcome::Done;
            }
        }
        HandlerOutcome::Pass(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{InstanceKind, RouterConfig};

    fn owner() -> Jid {
        "u@h".parse().unwrap()
    }

    /// Wire a router with the in-memory backend as default xdb instance and
    /// a session-manager-shaped instance owning the cache.
    fn storage_fixture() -> (Router, XdbCache) {
        let router = Router::new(RouterConfig::default());

        let storage = Instance::new("xdb", InstanceKind::Xdb);
        backend::MemoryXdb::new(router.clone()).attach(&storage);
        router.registry().set_default(storage);

        let sm = Instance::new("h", InstanceKind::Normal);
        let cache = XdbCache::new(router.clone(), "h", XdbConfig::default());
        cache.attach(&sm);
        router.registry().register("h", sm);

        (router, cache)
    }

    fn roster_doc() -> Element {
        Element::builder("query", ns::ROSTER)
            .append(
                Element::builder("item", ns::ROSTER)
                    .attr("jid", "peer@other")
                    .build(),
            )
            .build()
    }

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let (_router, cache) = storage_fixture();

        cache
            .set(&owner(), ns::ROSTER, Some(roster_doc()))
            .await
            .unwrap();

        let stored = cache.get(&owner(), ns::ROSTER).await.unwrap().unwrap();
        assert_eq!(stored.name(), "query");
        assert_eq!(stored.children().count(), 1);
        assert_eq!(cache.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let (_router, cache) = storage_fixture();
        assert!(cache.get(&owner(), ns::VCARD).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_none_erases() {
        let (_router, cache) = storage_fixture();
        cache
            .set(&owner(), ns::ROSTER, Some(roster_doc()))
            .await
            .unwrap();
        cache.set(&owner(), ns::ROSTER, None).await.unwrap();
        assert!(cache.get(&owner(), ns::ROSTER).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_appends() {
        let (_router, cache) = storage_fixture();
        for body in ["one", "two"] {
            let message = Element::builder("message", ns::SERVER)
                .attr("to", "u@h")
                .append(
                    Element::builder("body", ns::SERVER)
                        .append(body.to_string())
                        .build(),
                )
                .build();
            cache
                .act(&owner(), ns::OFFLINE, XdbAction::Insert, None, Some(message))
                .await
                .unwrap();
        }

        let spool = cache.get(&owner(), ns::OFFLINE).await.unwrap().unwrap();
        assert_eq!(spool.children().count(), 2);
    }

    #[tokio::test]
    async fn test_check_matches_text() {
        let (_router, cache) = storage_fixture();
        let secret = Element::builder("password", ns::AUTH)
            .append("hunter2".to_string())
            .build();
        cache
            .set(&owner(), ns::AUTH, Some(secret.clone()))
            .await
            .unwrap();

        cache
            .act(&owner(), ns::AUTH, XdbAction::Check, None, Some(secret))
            .await
            .unwrap();

        let wrong = Element::builder("password", ns::AUTH)
            .append("letmein".to_string())
            .build();
        let result = cache
            .act(&owner(), ns::AUTH, XdbAction::Check, None, Some(wrong))
            .await;
        assert!(matches!(result, Err(XmppError::Storage(_))));
    }
}
