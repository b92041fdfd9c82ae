//! Component connectors: XML streams to external components and peers.
//!
//! Both directions share the same link discipline: while a link is down,
//! outbound packets queue with a timestamp; when a link comes up the
//! queue flushes in FIFO order; a periodic sweep drains stale entries to
//! the offline fallback or bounces them as an internal timeout.

pub mod accept;
pub mod connect;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::StanzaError;
use crate::router::{HandlerOutcome, PacketHandler, Router};
use crate::stanza::Packet;
use crate::stream;
use crate::xdb::{XdbAction, XdbCache};
use crate::{beat::Heartbeat, ns};

/// Default seconds before a queued packet is drained away.
pub const DEFAULT_QUEUE_TIMEOUT_SECS: u64 = 10;

/// Default seconds a peer has to complete the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 5;

/// Messages to a connection's writer task.
pub(crate) enum WireMsg {
    Data(String),
    Close,
}

/// The live connection for a component, if any.
pub(crate) struct Link {
    pub conn_id: u64,
    pub tx: mpsc::UnboundedSender<WireMsg>,
}

/// Outbound state shared by a connector service and its handler.
pub(crate) struct LinkState {
    pub id: String,
    router: Router,
    xdb: Option<XdbCache>,
    queue_timeout: Duration,
    link: Mutex<Option<Link>>,
    queue: Mutex<VecDeque<(Instant, Packet)>>,
    live_conn: AtomicU64,
}

impl LinkState {
    pub fn new(
        id: String,
        router: Router,
        xdb: Option<XdbCache>,
        queue_timeout: Duration,
    ) -> Arc<LinkState> {
        Arc::new(LinkState {
            id,
            router,
            xdb,
            queue_timeout,
            link: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            live_conn: AtomicU64::new(0),
        })
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Whether `conn_id` is still the live connection.
    pub fn is_live(&self, conn_id: u64) -> bool {
        self.live_conn.load(Ordering::Acquire) == conn_id
    }

    /// Install a new live link, returning the displaced one if any.
    pub fn install(&self, conn_id: u64, tx: mpsc::UnboundedSender<WireMsg>) -> Option<Link> {
        self.live_conn.store(conn_id, Ordering::Release);
        let old = self.link.lock().unwrap().replace(Link { conn_id, tx });
        if old.is_some() {
            debug!(component = %self.id, "existing link displaced by new connection");
        }
        old
    }

    /// Drop the live link, but only if `conn_id` still owns it.
    pub fn disconnect(&self, conn_id: u64) {
        let mut link = self.link.lock().unwrap();
        if link.as_ref().map(|l| l.conn_id) == Some(conn_id) {
            *link = None;
            debug!(component = %self.id, "link down");
        }
    }

    /// Send a stanza on the live link, or queue it for later.
    pub fn write_or_queue(&self, packet: Packet) {
        let serialized = {
            let link = self.link.lock().unwrap();
            match link.as_ref() {
                Some(link) => {
                    let data = stream::serialize(&packet.elem);
                    match link.tx.send(WireMsg::Data(data)) {
                        Ok(()) => None,
                        Err(_) => Some(packet),
                    }
                }
                None => Some(packet),
            }
        };
        if let Some(packet) = serialized {
            trace!(component = %self.id, to = %packet.to, "link down, queueing");
            self.queue
                .lock()
                .unwrap()
                .push_back((Instant::now(), packet));
        }
    }

    /// Flush the accumulated queue onto a fresh link, oldest first.
    pub fn flush(&self, tx: &mpsc::UnboundedSender<WireMsg>) {
        let drained: Vec<Packet> = {
            let mut queue = self.queue.lock().unwrap();
            queue.drain(..).map(|(_, packet)| packet).collect()
        };
        if !drained.is_empty() {
            debug!(component = %self.id, count = drained.len(), "flushing queued stanzas");
        }
        for packet in drained {
            let _ = tx.send(WireMsg::Data(stream::serialize(&packet.elem)));
        }
    }

    /// Drain queue entries older than the timeout: spool them if a
    /// storage fallback is configured, bounce them otherwise.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let stale: Vec<Packet> = {
            let mut queue = self.queue.lock().unwrap();
            let mut stale = Vec::new();
            while let Some((stamp, _)) = queue.front() {
                if now.duration_since(*stamp) >= self.queue_timeout {
                    stale.push(queue.pop_front().unwrap().1);
                } else {
                    break;
                }
            }
            stale
        };

        for packet in stale {
            match self.xdb {
                Some(ref xdb) => {
                    let owner = packet.to.clone();
                    let stored = xdb
                        .act(
                            &owner,
                            ns::COMPONENT_SPOOL,
                            XdbAction::Insert,
                            None,
                            Some(packet.elem.clone()),
                        )
                        .await;
                    match stored {
                        Ok(()) => {
                            debug!(component = %self.id, to = %packet.to, "stale stanza spooled")
                        }
                        Err(err) => {
                            warn!(component = %self.id, error = %err, "spool failed, bouncing");
                            self.bounce(packet).await;
                        }
                    }
                }
                None => self.bounce(packet).await,
            }
        }
    }

    async fn bounce(&self, packet: Packet) {
        if let Some(bounce) =
            packet.into_bounce(StanzaError::REQUEST_TIMEOUT.with_text("Internal Timeout"))
        {
            self.router.deliver(bounce).await;
        }
    }

    /// Register the stale-queue sweep with the heartbeat scheduler.
    pub fn register_sweep(self: &Arc<Self>, heartbeat: &Heartbeat) {
        let state = Arc::clone(self);
        heartbeat.register(self.queue_timeout, move || {
            let state = Arc::clone(&state);
            async move { state.sweep().await }
        });
    }
}

/// Router handler that forwards packets onto the component's link.
pub(crate) struct OutboundHandler {
    pub state: Arc<LinkState>,
}

#[async_trait]
impl PacketHandler for OutboundHandler {
    async fn handle(&self, packet: Packet) -> HandlerOutcome {
        self.state.write_or_queue(packet);
        HandlerOutcome::Done
    }
}

/// Drive a connection's write half from its channel.
pub(crate) fn spawn_writer(
    mut half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<WireMsg>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                WireMsg::Data(data) => {
                    if half.write_all(data.as_bytes()).await.is_err() {
                        break;
                    }
                }
                WireMsg::Close => {
                    let _ = half.shutdown().await;
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouterConfig;
    use minidom::Element;

    fn message(body: &str) -> Packet {
        let elem = Element::builder("message", ns::COMPONENT_ACCEPT)
            .attr("to", "u@h")
            .attr("from", "c.h")
            .append(
                Element::builder("body", ns::COMPONENT_ACCEPT)
                    .append(body.to_string())
                    .build(),
            )
            .build();
        Packet::from_element(elem).unwrap()
    }

    #[tokio::test]
    async fn test_queue_then_flush_fifo() {
        let router = Router::new(RouterConfig::default());
        let state = LinkState::new("c.h".into(), router, None, Duration::from_secs(10));

        state.write_or_queue(message("one"));
        state.write_or_queue(message("two"));
        state.write_or_queue(message("three"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        state.install(1, tx.clone());
        state.flush(&tx);

        let mut seen = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let WireMsg::Data(data) = msg {
                seen.push(data);
            }
        }
        assert_eq!(seen.len(), 3);
        assert!(seen[0].contains("one"));
        assert!(seen[1].contains("two"));
        assert!(seen[2].contains("three"));
    }

    #[tokio::test]
    async fn test_live_link_writes_directly() {
        let router = Router::new(RouterConfig::default());
        let state = LinkState::new("c.h".into(), router, None, Duration::from_secs(10));
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.install(1, tx);

        state.write_or_queue(message("direct"));
        match rx.try_recv() {
            Ok(WireMsg::Data(data)) => assert!(data.contains("direct")),
            _ => panic!("expected direct write"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_only_drops_own_link() {
        let router = Router::new(RouterConfig::default());
        let state = LinkState::new("c.h".into(), router, None, Duration::from_secs(10));
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        state.install(1, tx1);
        state.install(2, tx2);
        assert!(!state.is_live(1));
        assert!(state.is_live(2));

        // a late disconnect from the displaced connection is a no-op
        state.disconnect(1);
        state.write_or_queue(message("still-up"));
        assert!(matches!(rx2.try_recv(), Ok(WireMsg::Data(_))));
    }
}
