//! The stanza router: classify, select a destination instance, and run its
//! handler chain.
//!
//! Every packet handed to [`Router::deliver`] ends in exactly one of three
//! ways: it entered a handler chain and was consumed, it was bounced back
//! to its sender with a single delivery-failure error, or it was a
//! pre-existing error stanza and was dropped.

pub mod handler;
pub mod registry;

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::error::StanzaError;
use crate::stanza::{Packet, PacketClass};

pub use handler::{HandlerOutcome, HandlerPhase, PacketHandler};
pub use registry::{Instance, InstanceKind, Registry};

/// Router behavior knobs.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Bounce unroutable stanzas as `remote-server-not-found` instead of
    /// the default `(wait, service-unavailable)`.
    pub bounce_remote_not_found: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bounce_remote_not_found: false,
        }
    }
}

/// Cheaply cloneable handle to the routing core.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    registry: Registry,
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Router {
        Router {
            inner: Arc::new(RouterInner {
                registry: Registry::new(),
                config,
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Deliver a packet to exactly one component, or fail it.
    ///
    /// A failed delivery produces at most one bounce; a failed bounce is
    /// dropped so errors can never ping-pong.
    pub async fn deliver(&self, packet: Packet) {
        if let Some(bounce) = self.route_once(packet).await {
            if let Some(dropped) = self.route_once(bounce).await {
                warn!(
                    to = %dropped.to,
                    "bounce itself was undeliverable, dropping"
                );
            }
        }
    }

    /// Route a packet once. Returns a bounce packet when delivery failed
    /// and the sender should hear about it.
    async fn route_once(&self, packet: Packet) -> Option<Packet> {
        let instance = match self.select_instance(&packet) {
            Some(instance) => instance,
            None => return self.fail(packet),
        };

        trace!(
            class = ?packet.class,
            to = %packet.to,
            instance = %instance.id(),
            "routing packet"
        );

        let mut current = packet;
        for (_phase, seq, handler) in instance.chain_snapshot() {
            match handler.handle(current).await {
                HandlerOutcome::Done => return None,
                HandlerOutcome::Pass(packet) => current = packet,
                HandlerOutcome::Fail(packet) => return self.fail_from_handler(packet),
                HandlerOutcome::Unregister(packet) => {
                    instance.unregister_seq(seq);
                    current = packet;
                }
            }
        }

        // chain exhausted without a handler taking the packet: unrouted
        self.fail(current)
    }

    /// Bounce a packet a handler explicitly failed.
    fn fail_from_handler(&self, packet: Packet) -> Option<Packet> {
        if packet.is_error() {
            debug!(to = %packet.to, "dropping failed error stanza");
            return None;
        }
        packet.into_bounce(StanzaError::EXTERNAL)
    }

    /// Pick the destination instance for a packet.
    fn select_instance(&self, packet: &Packet) -> Option<Arc<Instance>> {
        let registry = &self.inner.registry;
        match packet.class {
            PacketClass::Xdb => {
                // replies travel back by destination domain so the issuing
                // cache's Precond handler can claim them
                match packet.stanza_type() {
                    Some("result") | Some("error") => registry
                        .lookup(packet.host())
                        .or_else(|| registry.default_for(InstanceKind::Xdb)),
                    _ => registry.default_for(InstanceKind::Xdb),
                }
            }
            PacketClass::Log => registry.default_for(InstanceKind::Log),
            _ => registry
                .lookup(packet.host())
                .or_else(|| registry.default_for(InstanceKind::Normal)),
        }
    }

    /// Handle an unroutable or handler-failed packet.
    fn fail(&self, packet: Packet) -> Option<Packet> {
        if packet.is_error() {
            debug!(to = %packet.to, "dropping undeliverable error stanza");
            return None;
        }
        let local_sender = packet
            .from
            .as_ref()
            .map(|from| self.inner.registry.is_local(from.domain().as_str()))
            .unwrap_or(false);
        if !local_sender {
            debug!(to = %packet.to, "dropping undeliverable packet from remote sender");
            return None;
        }
        let err = if self.inner.config.bounce_remote_not_found {
            StanzaError::REMOTE_NOT_FOUND
        } else {
            StanzaError::EXTERNAL
        };
        debug!(to = %packet.to, "bouncing undeliverable packet");
        packet.into_bounce(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ns;
    use async_trait::async_trait;
    use minidom::Element;
    use std::sync::Mutex;

    /// Terminal handler that records everything it receives.
    struct Capture {
        seen: Mutex<Vec<Element>>,
    }

    impl Capture {
        fn new() -> Arc<Capture> {
            Arc::new(Capture {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<Element> {
            std::mem::take(&mut self.seen.lock().unwrap())
        }
    }

    #[async_trait]
    impl PacketHandler for Capture {
        async fn handle(&self, packet: Packet) -> HandlerOutcome {
            self.seen.lock().unwrap().push(packet.elem);
            HandlerOutcome::Done
        }
    }

    /// Handler that asks to be removed on its first invocation.
    struct OneShot {
        hits: Mutex<u32>,
    }

    #[async_trait]
    impl PacketHandler for OneShot {
        async fn handle(&self, packet: Packet) -> HandlerOutcome {
            *self.hits.lock().unwrap() += 1;
            HandlerOutcome::Unregister(packet)
        }
    }

    fn iq(to: &str, from: &str) -> Packet {
        let elem = Element::builder("iq", ns::SERVER)
            .attr("to", to)
            .attr("from", from)
            .attr("type", "get")
            .attr("id", "1")
            .append(Element::builder("query", "x").build())
            .build();
        Packet::from_element(elem).unwrap()
    }

    #[tokio::test]
    async fn test_deliver_to_registered_instance() {
        let router = Router::new(RouterConfig::default());
        let instance = Instance::new("h", InstanceKind::Normal);
        let capture = Capture::new();
        instance.register_handler(HandlerPhase::Deliver, capture.clone());
        router.registry().register("h", instance);

        router.deliver(iq("u@h", "peer@other")).await;
        let seen = capture.take();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].attr("to"), Some("u@h"));
    }

    #[tokio::test]
    async fn test_unroutable_bounces_to_local_sender() {
        let router = Router::new(RouterConfig::default());
        let instance = Instance::new("h", InstanceKind::Normal);
        let capture = Capture::new();
        instance.register_handler(HandlerPhase::Deliver, capture.clone());
        router.registry().register("h", instance);

        router.deliver(iq("nosuchdomain.example", "u@h")).await;

        let seen = capture.take();
        assert_eq!(seen.len(), 1, "sender should receive exactly one bounce");
        let bounce = &seen[0];
        assert_eq!(bounce.attr("to"), Some("u@h"));
        assert_eq!(bounce.attr("type"), Some("error"));
        let error = bounce.get_child("error", ns::SERVER).unwrap();
        assert_eq!(error.attr("type"), Some("wait"));
        assert!(error.has_child("service-unavailable", ns::STANZAS));
    }

    #[tokio::test]
    async fn test_unroutable_remote_sender_dropped() {
        let router = Router::new(RouterConfig::default());
        let instance = Instance::new("h", InstanceKind::Normal);
        let capture = Capture::new();
        instance.register_handler(HandlerPhase::Deliver, capture.clone());
        router.registry().register("h", instance);

        router.deliver(iq("nosuchdomain.example", "peer@other")).await;
        assert!(capture.take().is_empty());
    }

    #[tokio::test]
    async fn test_error_stanza_never_bounced() {
        let router = Router::new(RouterConfig::default());
        let instance = Instance::new("h", InstanceKind::Normal);
        let capture = Capture::new();
        instance.register_handler(HandlerPhase::Deliver, capture.clone());
        router.registry().register("h", instance);

        let elem = Element::builder("message", ns::SERVER)
            .attr("to", "nosuchdomain.example")
            .attr("from", "u@h")
            .attr("type", "error")
            .build();
        router.deliver(Packet::from_element(elem).unwrap()).await;
        assert!(capture.take().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_removes_handler() {
        let router = Router::new(RouterConfig::default());
        let instance = Instance::new("h", InstanceKind::Normal);
        let oneshot = Arc::new(OneShot {
            hits: Mutex::new(0),
        });
        let capture = Capture::new();
        instance.register_handler(HandlerPhase::Precond, oneshot.clone());
        instance.register_handler(HandlerPhase::Deliver, capture.clone());
        router.registry().register("h", instance);

        router.deliver(iq("u@h", "peer@other")).await;
        router.deliver(iq("u@h", "peer@other")).await;

        assert_eq!(*oneshot.hits.lock().unwrap(), 1);
        assert_eq!(capture.take().len(), 2);
    }

    #[tokio::test]
    async fn test_remote_not_found_config() {
        let router = Router::new(RouterConfig {
            bounce_remote_not_found: true,
        });
        let instance = Instance::new("h", InstanceKind::Normal);
        let capture = Capture::new();
        instance.register_handler(HandlerPhase::Deliver, capture.clone());
        router.registry().register("h", instance);

        router.deliver(iq("nosuchdomain.example", "u@h")).await;
        let seen = capture.take();
        let error = seen[0].get_child("error", ns::SERVER).unwrap();
        assert!(error.has_child("remote-server-not-found", ns::STANZAS));
    }
}
