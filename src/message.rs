//! Wire-level message records and their object pools.
//!
//! Three message types cross router boundaries: [`Flit`]s carry payload
//! fragments downstream, [`Credit`]s carry freed VC indices back upstream,
//! and [`Handshake`]s carry power-state coordination sideband. All three
//! are plain owned values — the input buffer owns queued flits, crossbar
//! transit hands ownership to the output queue, and a channel send hands it
//! to the downstream router.
//!
//! Messages are recycled through [`Pool`]s rather than allocated fresh each
//! cycle; `free` scrubs the record so identity never outlives its consumer.

use crate::router::power::PowerState;
use crate::routing::OutputSet;
use smallvec::SmallVec;

/// Payload classification carried by a flit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlitKind {
    #[default]
    ReadRequest,
    ReadReply,
    WriteRequest,
    WriteReply,
}

impl FlitKind {
    /// True for reply traffic heading back to a requester.
    #[inline]
    pub fn is_reply(&self) -> bool {
        matches!(self, FlitKind::ReadReply | FlitKind::WriteReply)
    }
}

/// Flow-control unit: the smallest independently arbitrated fragment.
#[derive(Debug, Clone, Default)]
pub struct Flit {
    /// Globally unique flit id.
    pub id: u64,
    /// Packet id shared by all flits of one packet.
    pub pid: u64,
    /// Traffic class.
    pub cl: usize,
    /// Message kind.
    pub kind: FlitKind,
    /// First flit of its packet.
    pub head: bool,
    /// Last flit of its packet.
    pub tail: bool,
    /// Source node id.
    pub src: usize,
    /// Destination node id.
    pub dest: usize,
    /// VC the flit currently occupies.
    pub vc: usize,
    /// Lookahead route set, consumed when route compute is bypassed.
    pub la_route_set: OutputSet,
    /// Hops through powered-on routers.
    pub hops: u32,
    /// Hops bypassed through powered-off routers.
    pub flov_hops: u32,
    /// Cycle this flit entered the current router; drives stage timeouts.
    pub rtime: u64,
    /// Emit detailed pipeline traces for this flit.
    pub watch: bool,
}

impl Recycle for Flit {
    fn recycle(&mut self) {
        *self = Flit::default();
    }
}

/// Freed-VC notification for one upstream port.
#[derive(Debug, Clone, Default)]
pub struct Credit {
    vcs: SmallVec<[usize; 8]>,
}

impl Credit {
    /// Record `vc` as freed; duplicates are collapsed.
    pub fn add_vc(&mut self, vc: usize) {
        if !self.vcs.contains(&vc) {
            self.vcs.push(vc);
        }
    }

    /// True if `vc` is already recorded.
    #[inline]
    pub fn has_vc(&self, vc: usize) -> bool {
        self.vcs.contains(&vc)
    }

    /// Freed VCs in insertion order.
    #[inline]
    pub fn vcs(&self) -> &[usize] {
        &self.vcs
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vcs.is_empty()
    }
}

impl Recycle for Credit {
    fn recycle(&mut self) {
        self.vcs.clear();
    }
}

/// Power-state coordination message.
///
/// At least one of `new_state`, `drain_done`, or `wakeup` is meaningful
/// per handshake; same-cycle messages for one port are merged into a
/// single record. `hid` correlates a drain-done response with the request
/// that solicited it; a response with a stale `hid` is ignored by the
/// receiver.
#[derive(Debug, Clone, Copy, Default)]
pub struct Handshake {
    /// Advertised state transition of the sender.
    pub new_state: Option<PowerState>,
    /// Acknowledges that the receiver's drain request is satisfied.
    pub drain_done: bool,
    /// Wakeup ping (carried for protocol completeness; unused by this
    /// router's handshaking variant).
    pub wakeup: bool,
    /// Sender router id.
    pub src_id: usize,
    /// Request id being issued or echoed.
    pub hid: u32,
}

impl Handshake {
    /// True if the record carries any meaningful field.
    #[inline]
    pub fn is_meaningful(&self) -> bool {
        self.new_state.is_some() || self.drain_done || self.wakeup
    }
}

impl Recycle for Handshake {
    fn recycle(&mut self) {
        *self = Handshake::default();
    }
}

/// Scrub state before a pooled value is handed out again.
pub trait Recycle {
    fn recycle(&mut self);
}

/// Free-list object pool.
///
/// `alloc` hands out a scrubbed value, reusing a freed one when available;
/// `free` returns a value to the pool. The outstanding count is the
/// leak-check surface: every message allocated must eventually come back.
#[derive(Debug)]
pub struct Pool<T> {
    free: Vec<T>,
    allocated: u64,
    freed: u64,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self { free: Vec::new(), allocated: 0, freed: 0 }
    }
}

impl<T: Default + Recycle> Pool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a value from the pool, or construct one if the pool is dry.
    pub fn alloc(&mut self) -> T {
        self.allocated += 1;
        match self.free.pop() {
            Some(mut item) => {
                item.recycle();
                item
            }
            None => T::default(),
        }
    }

    /// Return a value to the pool.
    pub fn free(&mut self, item: T) {
        self.freed += 1;
        self.free.push(item);
    }

    /// Values handed out and not yet returned.
    #[inline]
    pub fn outstanding(&self) -> u64 {
        self.allocated - self.freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credit_dedup() {
        let mut c = Credit::default();
        c.add_vc(2);
        c.add_vc(2);
        c.add_vc(0);
        assert_eq!(c.vcs(), &[2, 0]);
        assert!(c.has_vc(0));
        assert!(!c.has_vc(1));
    }

    #[test]
    fn test_pool_recycles_and_scrubs() {
        let mut pool: Pool<Credit> = Pool::new();
        let mut c = pool.alloc();
        c.add_vc(3);
        pool.free(c);
        assert_eq!(pool.outstanding(), 0);
        let c = pool.alloc();
        assert!(c.is_empty(), "recycled credit must be scrubbed");
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_handshake_meaningful() {
        let mut h = Handshake::default();
        assert!(!h.is_meaningful());
        h.drain_done = true;
        assert!(h.is_meaningful());
    }

    #[test]
    fn test_flit_recycle_scrubs() {
        let mut f = Flit { id: 9, watch: true, hops: 3, ..Flit::default() };
        f.recycle();
        assert_eq!(f.id, 0);
        assert_eq!(f.hops, 0);
        assert!(!f.watch);
    }
}
