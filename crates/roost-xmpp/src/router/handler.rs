//! Handler chains: the callback surface every component exposes to the
//! router.

use async_trait::async_trait;

use crate::stanza::Packet;

/// Phases of a handler chain, evaluated in declaration order.
///
/// `Precond` runs before any routing decision is honored (the XDB cache uses
/// it to intercept replies addressed to its instance). `Deliver` is
/// terminal: a packet passed through `Deliver` is unrouted and bounces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandlerPhase {
    Precond,
    Cond,
    Predeliver,
    Deliver,
}

impl HandlerPhase {
    pub const ALL: [HandlerPhase; 4] = [
        HandlerPhase::Precond,
        HandlerPhase::Cond,
        HandlerPhase::Predeliver,
        HandlerPhase::Deliver,
    ];
}

/// What a handler did with the packet it was given.
///
/// Ownership of the packet travels with the result: `Done` means the
/// handler kept it, everything else hands it back to the router.
pub enum HandlerOutcome {
    /// Not interested; try the next handler.
    Pass(Packet),
    /// Consumed; stop the chain.
    Done,
    /// Failed; the router bounces the packet to its sender.
    Fail(Packet),
    /// Remove this handler from the chain and continue as pass.
    Unregister(Packet),
}

/// A callback registered on an instance's handler chain.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    async fn handle(&self, packet: Packet) -> HandlerOutcome;
}
