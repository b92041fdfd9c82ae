//! Connect connector: dials out to a peer that accepts components.
//!
//! Mirror image of the accept side: we open the stream, the peer hands us
//! an id, we answer `<handshake>SHA1(id || secret)</handshake>` and wait
//! for the empty `<handshake/>` confirmation. Socket errors retry with a
//! fixed backoff; the outbound queue keeps accumulating while down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::{spawn_writer, LinkState, OutboundHandler, WireMsg};
use crate::beat::Heartbeat;
use crate::error::StreamError;
use crate::ns;
use crate::router::{HandlerPhase, Instance, Router};
use crate::sm::modules::auth::digest_hex;
use crate::stanza::Packet;
use crate::stream::{self, StreamConfig, StreamEvent, XmlReader};
use crate::xdb::XdbCache;

/// Default reconnect backoff.
pub const DEFAULT_RECONNECT_SECS: u64 = 5;

/// Connect connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Component domain served over this link.
    pub id: String,

    /// Peer address, e.g. `127.0.0.1:5347`.
    pub addr: String,

    /// Shared handshake secret.
    pub secret: String,

    /// Queued stanzas older than this are drained away.
    pub queue_timeout: Duration,

    /// Delay between reconnect attempts.
    pub reconnect: Duration,

    /// Stream parsing limits.
    pub stream: StreamConfig,
}

impl ConnectConfig {
    pub fn new(id: impl Into<String>, addr: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            secret: secret.into(),
            queue_timeout: Duration::from_secs(super::DEFAULT_QUEUE_TIMEOUT_SECS),
            reconnect: Duration::from_secs(DEFAULT_RECONNECT_SECS),
            stream: StreamConfig::default(),
        }
    }
}

/// Maintains one outbound component link, reconnecting as needed.
pub struct ConnectService {
    config: ConnectConfig,
    state: Arc<LinkState>,
    conn_seq: AtomicU64,
}

impl ConnectService {
    pub fn new(
        config: ConnectConfig,
        router: Router,
        xdb: Option<XdbCache>,
    ) -> Arc<ConnectService> {
        let state = LinkState::new(config.id.clone(), router, xdb, config.queue_timeout);
        Arc::new(ConnectService {
            config,
            state,
            conn_seq: AtomicU64::new(1),
        })
    }

    /// Register the outbound handler on the component's instance.
    pub fn attach(self: &Arc<Self>, instance: &Instance) {
        instance.register_handler(
            HandlerPhase::Deliver,
            Arc::new(OutboundHandler {
                state: Arc::clone(&self.state),
            }),
        );
    }

    /// Register the stale-queue sweep.
    pub fn register_sweep(self: &Arc<Self>, heartbeat: &Heartbeat) {
        self.state.register_sweep(heartbeat);
    }

    /// Start the reconnect supervisor.
    pub fn start(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match TcpStream::connect(&service.config.addr).await {
                    Ok(socket) => {
                        let conn_id = service.conn_seq.fetch_add(1, Ordering::Relaxed);
                        info!(component = %service.config.id, conn_id, "connected to peer");
                        service.serve(socket, conn_id).await;
                    }
                    Err(err) => {
                        debug!(component = %service.config.id, error = %err, "connect failed");
                    }
                }
                tokio::time::sleep(service.config.reconnect).await;
            }
        });
    }

    #[instrument(name = "component.connect.serve", skip(self, socket), fields(component = %self.config.id, conn_id))]
    async fn serve(&self, socket: TcpStream, conn_id: u64) {
        let (mut read_half, write_half) = socket.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = spawn_writer(write_half, rx);

        // we speak first
        let header = stream::stream_header(
            ns::COMPONENT_ACCEPT,
            Some(&self.config.id),
            None,
            None,
        );
        let _ = tx.send(WireMsg::Data(header));

        let mut reader = XmlReader::new(self.config.stream);
        let mut buf = vec![0u8; 8192];
        let mut authenticated = false;

        let close_error = loop {
            match reader.next_event() {
                Err(err) => break Some(err),
                Ok(Some(StreamEvent::Root(header))) => {
                    let id = match header.id {
                        Some(ref id) if !id.is_empty() => id.clone(),
                        _ => {
                            warn!("peer offered no stream id");
                            break Some(StreamError::InvalidId);
                        }
                    };
                    let digest = digest_hex(&id, &self.config.secret);
                    let _ = tx.send(WireMsg::Data(format!("<handshake>{}</handshake>", digest)));
                }
                Ok(Some(StreamEvent::Node(elem))) if !authenticated => {
                    if elem.name() == "handshake" {
                        if let Some(old) = self.state.install(conn_id, tx.clone()) {
                            let _ = old.tx.send(WireMsg::Close);
                        }
                        self.state.flush(&tx);
                        authenticated = true;
                        info!("component handshake accepted by peer");
                    } else if elem.name() == "error" {
                        warn!(error = %stream::serialize(&elem), "peer rejected stream");
                        break None;
                    } else {
                        debug!(elem = %elem.name(), "unexpected pre-handshake element");
                    }
                }
                Ok(Some(StreamEvent::Node(elem))) => {
                    if !self.state.is_live(conn_id) {
                        break None;
                    }
                    match Packet::from_element(elem) {
                        Ok(packet) => self.state.router().deliver(packet).await,
                        Err(err) => debug!(error = %err, "unroutable stanza from peer"),
                    }
                }
                Ok(Some(StreamEvent::Close)) => {
                    let _ = tx.send(WireMsg::Data("</stream:stream>".to_string()));
                    break None;
                }
                Ok(None) => match read_half.read(&mut buf).await {
                    Ok(0) => break None,
                    Ok(n) => reader.feed(&buf[..n]),
                    Err(err) => {
                        debug!(error = %err, "read failed");
                        break None;
                    }
                },
            }
        };

        if let Some(err) = close_error {
            let _ = tx.send(WireMsg::Data(format!(
                "{}</stream:stream>",
                err.to_xml(None)
            )));
        }
        let _ = tx.send(WireMsg::Close);
        self.state.disconnect(conn_id);
        let _ = writer.await;
        debug!("connection finished");
    }
}
