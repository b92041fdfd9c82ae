//! Private XML storage, keyed by the payload's element namespace.

use std::sync::Arc;

use async_trait::async_trait;
use jid::Jid;
use minidom::Element;

use crate::error::StanzaError;
use crate::ns;
use crate::sm::modules::{ModCtx, ModOutcome, Module};
use crate::stanza::{self, Packet, PacketClass};

#[derive(Default)]
pub struct PrivateModule;

impl PrivateModule {
    pub fn new() -> Arc<PrivateModule> {
        Arc::new(PrivateModule::default())
    }
}

#[async_trait]
impl Module for PrivateModule {
    fn name(&self) -> &'static str {
        "private"
    }

    fn features(&self) -> &'static [&'static str] {
        &[ns::PRIVATE]
    }

    async fn session_start(&self, this: Arc<dyn Module>, cx: &mut ModCtx<'_>) {
        if let Some(session) = cx.session() {
            session.out_hooks.push(this);
        }
    }

    async fn session_out(&self, cx: &mut ModCtx<'_>, packet: Packet) -> ModOutcome {
        if packet.class != PacketClass::Iq || packet.elem.attr("to").is_some() {
            return ModOutcome::Ignore(packet);
        }
        let query = match packet.elem.get_child("query", ns::PRIVATE) {
            Some(query) => query.clone(),
            None => return ModOutcome::Ignore(packet),
        };
        let wanted = match query.children().next() {
            Some(child) => (child.name().to_string(), child.ns()),
            None => {
                cx.send_to_client(stanza::error_reply(packet.elem, StanzaError::BAD_REQUEST));
                return ModOutcome::Handled;
            }
        };

        let owner = Jid::from(cx.user.jid.clone());
        let stored = cx.sm.xdb().get(&owner, ns::PRIVATE).await.ok().flatten();

        match packet.stanza_type() {
            Some("get") => {
                let found = stored.as_ref().and_then(|store| {
                    store
                        .children()
                        .find(|child| child.name() == wanted.0 && child.ns() == wanted.1)
                        .cloned()
                });
                let mut reply_query = Element::builder("query", ns::PRIVATE);
                match found {
                    Some(found) => reply_query = reply_query.append(found),
                    // echo the empty key back, per the private-XML contract
                    None => reply_query = reply_query.append(query.children().next().cloned().unwrap()),
                }
                let mut result = stanza::iq_result(packet.elem);
                result.append_child(reply_query.build());
                cx.send_to_client(result);
                ModOutcome::Handled
            }
            Some("set") => {
                let mut store = stored
                    .unwrap_or_else(|| Element::builder("query", ns::PRIVATE).build());
                // replace the stored fragment for this key
                let kept: Vec<Element> = store
                    .children()
                    .filter(|child| !(child.name() == wanted.0 && child.ns() == wanted.1))
                    .cloned()
                    .collect();
                let mut rebuilt = Element::builder("query", ns::PRIVATE);
                for child in kept {
                    rebuilt = rebuilt.append(child);
                }
                for child in query.children() {
                    rebuilt = rebuilt.append(child.clone());
                }
                store = rebuilt.build();

                match cx.sm.xdb().set(&owner, ns::PRIVATE, Some(store)).await {
                    Ok(()) => cx.send_to_client(stanza::iq_result(packet.elem)),
                    Err(_) => cx.send_to_client(stanza::error_reply(
                        packet.elem,
                        StanzaError::INTERNAL,
                    )),
                }
                ModOutcome::Handled
            }
            _ => ModOutcome::Ignore(packet),
        }
    }
}
