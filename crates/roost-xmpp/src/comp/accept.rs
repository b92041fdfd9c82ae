//! Accept connector: listens for external components (XEP-0114).
//!
//! Connection flow:
//! 1. Read the peer's stream header, answer with ours plus a fresh id.
//! 2. Require `<handshake>SHA1(id || secret)</handshake>` within the
//!    handshake timeout; a mismatch is a `not-authorized` stream error.
//! 3. On success emit `<handshake/>` and install the link, kicking any
//!    previous connection with a `conflict` stream error.
//! 4. Flush the outbound queue, then move stanzas both ways.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
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

/// Accept connector configuration.
#[derive(Debug, Clone)]
pub struct AcceptConfig {
    /// Component domain this listener serves.
    pub id: String,

    /// Listen address, e.g. `127.0.0.1:5347`.
    pub bind: String,

    /// Shared handshake secret.
    pub secret: String,

    /// Queued stanzas older than this are drained away.
    pub queue_timeout: Duration,

    /// Time a peer has to complete the handshake.
    pub handshake_timeout: Duration,

    /// Stream parsing limits.
    pub stream: StreamConfig,
}

impl AcceptConfig {
    pub fn new(id: impl Into<String>, bind: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bind: bind.into(),
            secret: secret.into(),
            queue_timeout: Duration::from_secs(super::DEFAULT_QUEUE_TIMEOUT_SECS),
            handshake_timeout: Duration::from_secs(super::DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            stream: StreamConfig::default(),
        }
    }
}

/// Listener for one configured external component.
pub struct AcceptService {
    config: AcceptConfig,
    state: Arc<LinkState>,
    conn_seq: AtomicU64,
}

impl AcceptService {
    pub fn new(config: AcceptConfig, router: Router, xdb: Option<XdbCache>) -> Arc<AcceptService> {
        let state = LinkState::new(
            config.id.clone(),
            router,
            xdb,
            config.queue_timeout,
        );
        Arc::new(AcceptService {
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

    /// Bind the listener and start accepting connections.
    pub async fn start(self: &Arc<Self>) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        let addr = listener.local_addr()?;
        info!(component = %self.config.id, %addr, "accept connector listening");

        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        let conn_id = service.conn_seq.fetch_add(1, Ordering::Relaxed);
                        debug!(component = %service.config.id, %peer, conn_id, "connection accepted");
                        let service = Arc::clone(&service);
                        tokio::spawn(async move {
                            service.serve(socket, conn_id).await;
                        });
                    }
                    Err(err) => {
                        warn!(component = %service.config.id, error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok(addr)
    }

    #[instrument(name = "component.accept.serve", skip(self, socket), fields(component = %self.config.id, conn_id))]
    async fn serve(self: Arc<Self>, socket: TcpStream, conn_id: u64) {
        let (mut read_half, write_half) = socket.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = spawn_writer(write_half, rx);

        let stream_id = uuid::Uuid::new_v4().simple().to_string();
        let mut reader = XmlReader::new(self.config.stream);
        let mut buf = vec![0u8; 8192];
        let mut authenticated = false;
        let handshake_deadline = Instant::now() + self.config.handshake_timeout;

        let close_error = loop {
            match reader.next_event() {
                Err(err) => break Some(err),
                Ok(Some(StreamEvent::Root(_header))) => {
                    // answer with our header; the peer hashes this id
                    let header = stream::stream_header(
                        ns::COMPONENT_ACCEPT,
                        None,
                        Some(&self.config.id),
                        Some(&stream_id),
                    );
                    let _ = tx.send(WireMsg::Data(header));
                }
                Ok(Some(StreamEvent::Node(elem))) if !authenticated => {
                    let supplied = if elem.name() == "handshake" {
                        elem.text().trim().to_lowercase()
                    } else {
                        String::new()
                    };
                    if supplied.is_empty()
                        || supplied != digest_hex(&stream_id, &self.config.secret)
                    {
                        debug!("handshake rejected");
                        break Some(StreamError::NotAuthorized);
                    }

                    let _ = tx.send(WireMsg::Data("<handshake/>".to_string()));
                    if let Some(old) = self.state.install(conn_id, tx.clone()) {
                        let _ = old.tx.send(WireMsg::Data(format!(
                            "{}</stream:stream>",
                            StreamError::Conflict
                                .to_xml(Some("Socket override by another connection"))
                        )));
                        let _ = old.tx.send(WireMsg::Close);
                    }
                    self.state.flush(&tx);
                    authenticated = true;
                    info!("component handshake complete");
                }
                Ok(Some(StreamEvent::Node(elem))) => {
                    if !self.state.is_live(conn_id) {
                        break None;
                    }
                    match Packet::from_element(elem) {
                        Ok(packet) => self.state.router().deliver(packet).await,
                        Err(err) => debug!(error = %err, "unroutable stanza from component"),
                    }
                }
                Ok(Some(StreamEvent::Close)) => {
                    let _ = tx.send(WireMsg::Data("</stream:stream>".to_string()));
                    break None;
                }
                Ok(None) => {
                    // parser starved: read more, bounded while unauthenticated
                    let read = if authenticated {
                        read_half.read(&mut buf).await
                    } else {
                        match tokio::time::timeout_at(handshake_deadline, read_half.read(&mut buf))
                            .await
                        {
                            Ok(read) => read,
                            Err(_) => {
                                debug!("handshake timed out");
                                break Some(StreamError::ConnectionTimeout);
                            }
                        }
                    };
                    match read {
                        Ok(0) => break None,
                        Ok(n) => reader.feed(&buf[..n]),
                        Err(err) => {
                            debug!(error = %err, "read failed");
                            break None;
                        }
                    }
                }
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
