//! vcard-temp: own-card management and public card queries.

use std::sync::Arc;

use async_trait::async_trait;
use jid::Jid;
use tracing::debug;

use crate::error::StanzaError;
use crate::ns;
use crate::sm::modules::{ModCtx, ModOutcome, Module};
use crate::stanza::{self, Packet, PacketClass};

#[derive(Default)]
pub struct VcardModule;

impl VcardModule {
    pub fn new() -> Arc<VcardModule> {
        Arc::new(VcardModule::default())
    }
}

#[async_trait]
impl Module for VcardModule {
    fn name(&self) -> &'static str {
        "vcard"
    }

    fn features(&self) -> &'static [&'static str] {
        &[ns::VCARD]
    }

    async fn session_start(&self, this: Arc<dyn Module>, cx: &mut ModCtx<'_>) {
        if let Some(session) = cx.session() {
            session.out_hooks.push(this);
        }
    }

    /// Own-card get and set from the user's session.
    async fn session_out(&self, cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        if packet.class != PacketClass::Iq || packet.elem.attr("to").is_some() {
            return ModOutcome::Ignore(packet);
        }
        let card = match packet.elem.get_child("vCard", ns::VCARD) {
            Some(card) => card.clone(),
            None => return ModOutcome::Ignore(packet),
        };
        let owner = Jid::from(cx.user.jid.clone());

        match packet.stanza_type() {
            Some("get") => {
                let stored = cx.sm.xdb().get(&owner, ns::VCARD).await.ok().flatten();
                let mut result = stanza::iq_result(packet.elem);
                match stored {
                    Some(stored) => result.append_child(stored),
                    None => result.append_child(card),
                }
                cx.send_to_client(result);
                ModOutcome::Handled
            }
            Some("set") => {
                match cx.sm.xdb().set(&owner, ns::VCARD, Some(card)).await {
                    Ok(()) => cx.send_to_client(stanza::iq_result(packet.elem)),
                    Err(err) => {
                        debug!(user = %cx.user.jid, error = %err, "vcard save failed");
                        cx.send_to_client(stanza::error_reply(
                            packet.elem,
                            StanzaError::INTERNAL,
                        ));
                    }
                }
                ModOutcome::Handled
            }
            _ => ModOutcome::Ignore(packet),
        }
    }

    /// Public card queries addressed to a user.
    async fn deliver(&self, cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        if packet.class != PacketClass::Iq || !packet.elem.has_child("vCard", ns::VCARD) {
            return ModOutcome::Ignore(packet);
        }
        match packet.stanza_type() {
            Some("get") => {
                let owner = Jid::from(cx.user.jid.clone());
                let stored = cx.sm.xdb().get(&owner, ns::VCARD).await.ok().flatten();
                let mut result = stanza::iq_result(packet.elem);
                if let Some(stored) = stored {
                    result.append_child(stored);
                }
                if let Ok(reply) = Packet::from_element(result) {
                    cx.outbox.push(reply);
                }
                ModOutcome::Handled
            }
            Some("set") => {
                // only the owner's own session may write, and that path
                // never reaches delivery
                if let Some(bounce) = packet.into_bounce(StanzaError::FORBIDDEN) {
                    cx.outbox.push(bounce);
                }
                ModOutcome::Handled
            }
            _ => ModOutcome::Ignore(packet),
        }
    }
}
