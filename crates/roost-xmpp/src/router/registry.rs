//! Instance registry: domain bindings and dynamic host management.
//!
//! Registration is read-mostly. Bindings change at startup and through the
//! administrative host add/remove surface; lookups happen on every packet.
//! `DashMap` keeps readers from ever observing a partial write, and handler
//! chains are snapshotted at delivery time so removing a binding never
//! aborts packets already inside a chain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::handler::{HandlerPhase, PacketHandler};

/// Which packet classes the router will hand to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    /// Receives `<log/>` records.
    Log,
    /// Receives `<xdb/>` storage requests.
    Xdb,
    /// Receives stanzas and routes.
    Normal,
}

/// An entry in a handler chain. The sequence number keeps registration
/// order within a phase and identifies the entry for self-removal.
struct ChainEntry {
    phase: HandlerPhase,
    seq: u64,
    handler: Arc<dyn PacketHandler>,
}

/// A runtime component binding: id, kind, and its handler chain.
pub struct Instance {
    id: String,
    kind: InstanceKind,
    chain: RwLock<Vec<ChainEntry>>,
    next_seq: AtomicU64,
}

impl Instance {
    pub fn new(id: impl Into<String>, kind: InstanceKind) -> Arc<Instance> {
        Arc::new(Instance {
            id: id.into(),
            kind,
            chain: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    /// Append a handler to the chain for the given phase.
    pub fn register_handler(&self, phase: HandlerPhase, handler: Arc<dyn PacketHandler>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut chain = self.chain.write().unwrap();
        chain.push(ChainEntry {
            phase,
            seq,
            handler,
        });
        chain.sort_by_key(|entry| (entry.phase, entry.seq));
    }

    /// Snapshot the chain in invocation order.
    pub(crate) fn chain_snapshot(&self) -> Vec<(HandlerPhase, u64, Arc<dyn PacketHandler>)> {
        self.chain
            .read()
            .unwrap()
            .iter()
            .map(|entry| (entry.phase, entry.seq, Arc::clone(&entry.handler)))
            .collect()
    }

    /// Remove the chain entry with the given sequence number.
    pub(crate) fn unregister_seq(&self, seq: u64) {
        self.chain.write().unwrap().retain(|entry| entry.seq != seq);
    }
}

/// Maps destination domains to instances and tracks per-kind defaults.
#[derive(Default)]
pub struct Registry {
    hosts: DashMap<String, Arc<Instance>>,
    default_normal: RwLock<Option<Arc<Instance>>>,
    default_xdb: RwLock<Option<Arc<Instance>>>,
    default_log: RwLock<Option<Arc<Instance>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Bind a domain to an instance. Re-registering the same binding is a
    /// no-op; binding a domain to a different instance replaces it.
    pub fn register(&self, domain: &str, instance: Arc<Instance>) {
        let domain = domain.to_ascii_lowercase();
        match self.hosts.insert(domain.clone(), Arc::clone(&instance)) {
            Some(old) if old.id() != instance.id() => {
                warn!(
                    domain = %domain,
                    old = %old.id(),
                    new = %instance.id(),
                    "domain rebound to a different instance"
                );
            }
            Some(_) => debug!(domain = %domain, "duplicate registration ignored"),
            None => info!(domain = %domain, instance = %instance.id(), "host registered"),
        }
    }

    /// Remove a domain binding. Unregistering an unknown binding is a no-op.
    pub fn unregister(&self, domain: &str) {
        let domain = domain.to_ascii_lowercase();
        if self.hosts.remove(&domain).is_some() {
            info!(domain = %domain, "host unregistered");
        }
    }

    /// Mark an instance as the default target for its kind.
    pub fn set_default(&self, instance: Arc<Instance>) {
        let slot = match instance.kind() {
            InstanceKind::Normal => &self.default_normal,
            InstanceKind::Xdb => &self.default_xdb,
            InstanceKind::Log => &self.default_log,
        };
        *slot.write().unwrap() = Some(instance);
    }

    pub fn default_for(&self, kind: InstanceKind) -> Option<Arc<Instance>> {
        let slot = match kind {
            InstanceKind::Normal => &self.default_normal,
            InstanceKind::Xdb => &self.default_xdb,
            InstanceKind::Log => &self.default_log,
        };
        slot.read().unwrap().clone()
    }

    /// Find the instance for a destination domain: exact match first, then
    /// the longest suffix (`a.b.example.com` falls back to `example.com`).
    pub fn lookup(&self, domain: &str) -> Option<Arc<Instance>> {
        let domain = domain.to_ascii_lowercase();
        let mut candidate: &str = &domain;
        loop {
            if let Some(instance) = self.hosts.get(candidate) {
                return Some(Arc::clone(instance.value()));
            }
            match candidate.split_once('.') {
                Some((_, rest)) if !rest.is_empty() => candidate = rest,
                _ => return None,
            }
        }
    }

    /// Whether a domain is served locally (used to decide bounce vs drop).
    pub fn is_local(&self, domain: &str) -> bool {
        self.lookup(domain).is_some()
    }
}
