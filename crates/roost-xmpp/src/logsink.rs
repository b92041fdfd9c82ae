//! Log component: terminal sink for `<log/>` records.
//!
//! Components emit log packets through the router like any other traffic;
//! this instance turns them into tracing events.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::router::{HandlerOutcome, HandlerPhase, Instance, PacketHandler};
use crate::stanza::{Packet, PacketClass};

#[derive(Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Arc<LogSink> {
        Arc::new(LogSink)
    }

    pub fn attach(self: &Arc<Self>, instance: &Instance) {
        instance.register_handler(
            HandlerPhase::Deliver,
            Arc::clone(self) as Arc<dyn PacketHandler>,
        );
    }
}

#[async_trait]
impl PacketHandler for LogSink {
    async fn handle(&self, packet: Packet) -> HandlerOutcome {
        if packet.class != PacketClass::Log {
            return HandlerOutcome::Pass(packet);
        }
        let source = packet
            .from
            .as_ref()
            .map(|from| from.to_string())
            .unwrap_or_else(|| "-".to_string());
        let text = packet.elem.text();
        match packet.elem.attr("type") {
            Some("alert") | Some("error") => error!(%source, "{}", text),
            Some("warn") => warn!(%source, "{}", text),
            _ => info!(%source, "{}", text),
        }
        HandlerOutcome::Done
    }
}
