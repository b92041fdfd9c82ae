//! Offline message spool with expiration handling.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use minidom::Element;
use tracing::{debug, trace};

use crate::error::StanzaError;
use crate::ns;
use crate::sm::modules::{ModCtx, ModOutcome, Module};
use crate::sm::session::parse_priority;
use crate::stanza::{self, Packet, PacketClass};
use crate::xdb::XdbAction;

/// Stores messages for users with no available session and drains the
/// spool when a session turns available with non-negative priority.
#[derive(Default)]
pub struct OfflineModule;

impl OfflineModule {
    pub fn new() -> Arc<OfflineModule> {
        Arc::new(OfflineModule::default())
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    /// Store a message in the spool, or decline so the caller bounces it.
    async fn store(&self, cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        if !cx.sm.config().stores_offline(packet.stanza_type()) {
            if packet.is_error() {
                // never bounce an error, that way lies a loop
                return ModOutcome::Handled;
            }
            if let Some(bounce) = packet.into_bounce(StanzaError::RECIPIENT_UNAVAILABLE) {
                cx.outbox.push(bounce);
            }
            return ModOutcome::Handled;
        }

        let mut elem = packet.elem.clone();
        // mark the expire hint with the moment of storage
        if let Some(expire) = elem.get_child_mut("x", ns::EXPIRE) {
            expire.set_attr("stored", Self::now().to_string());
        }
        stanza::delay_stamp(&mut elem, Some(&cx.user.jid.to_string()), "Offline Storage");

        let owner = jid::Jid::from(cx.user.jid.clone());
        match cx
            .sm
            .xdb()
            .act(&owner, ns::OFFLINE, XdbAction::Insert, None, Some(elem))
            .await
        {
            Ok(()) => {
                debug!(user = %cx.user.jid, "message stored offline");
                ModOutcome::Handled
            }
            Err(err) => {
                debug!(user = %cx.user.jid, error = %err, "offline store failed");
                ModOutcome::Pass(packet)
            }
        }
    }

    /// Deliver the spool to a session that just became available.
    async fn drain(&self, cx: &mut ModCtx<'_>) {
        let owner = jid::Jid::from(cx.user.jid.clone());
        let spool = match cx.sm.xdb().get(&owner, ns::OFFLINE).await {
            Ok(Some(spool)) => spool,
            Ok(None) => return,
            Err(err) => {
                debug!(user = %cx.user.jid, error = %err, "offline spool unavailable");
                return;
            }
        };

        let resource = match cx.resource.clone() {
            Some(resource) => resource,
            None => return,
        };

        let now = Self::now();
        let mut delivered = 0usize;
        for stored in spool.children() {
            if stored.name() != "message" {
                continue;
            }
            let mut message = stored.clone();
            if let Some(expire) = message.get_child_mut("x", ns::EXPIRE) {
                let seconds: i64 = expire
                    .attr("seconds")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                let stored_at: i64 = expire
                    .attr("stored")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(now);
                let elapsed = now - stored_at;
                if elapsed >= seconds {
                    trace!(user = %cx.user.jid, "dropping expired offline message");
                    continue;
                }
                expire.set_attr("seconds", (seconds - elapsed).to_string());
                expire.set_attr("stored", None::<String>);
            }
            cx.send_to_session(&resource, message);
            delivered += 1;
        }

        debug!(user = %cx.user.jid, delivered, "offline spool drained");
        // the spool is spent either way
        if let Err(err) = cx.sm.xdb().set(&owner, ns::OFFLINE, None).await {
            debug!(user = %cx.user.jid, error = %err, "offline spool erase failed");
        }
    }
}

#[async_trait]
impl Module for OfflineModule {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn features(&self) -> &'static [&'static str] {
        &["msgoffline"]
    }

    async fn session_start(&self, this: Arc<dyn Module>, cx: &mut ModCtx<'_>) {
        if let Some(session) = cx.session() {
            session.out_hooks.push(this);
        }
    }

    /// Watch outbound presence for the moment the session starts taking
    /// messages; this hook runs before the presence module commits the
    /// new state, so the previous state is still visible on the session.
    async fn session_out(&self, cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        if packet.class != PacketClass::Presence
            || packet.elem.attr("to").is_some()
            || packet.stanza_type().is_some()
        {
            return ModOutcome::Ignore(packet);
        }
        let new_priority = parse_priority(&packet.elem);
        let was_taking_messages = cx
            .session_ref()
            .map(|session| session.available && session.priority >= 0)
            .unwrap_or(false);
        if new_priority >= 0 && !was_taking_messages {
            self.drain(cx).await;
        }
        ModOutcome::Pass(packet)
    }

    async fn offline(&self, cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        if packet.class == PacketClass::Message {
            self.store(cx, packet).await
        } else {
            ModOutcome::Ignore(packet)
        }
    }
}
