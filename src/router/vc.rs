//! Input-side virtual channels.
//!
//! Each input port owns a set of VCs. A VC is a FIFO of flits plus a small
//! state machine that tracks where its front packet sits in the pipeline:
//!
//! ```text
//! idle ──head arrives──▶ routing ──RC done──▶ vc_alloc ──VA grant──▶ active
//!   ▲                                                                  │
//!   └──────────────────────── tail crosses switch ─────────────────────┘
//! ```
//!
//! Retargeting may force `vc_alloc` or `active` back to `routing` when the
//! chosen downstream router stops accepting traffic.

use crate::message::Flit;
use crate::routing::OutputSet;
use std::collections::VecDeque;

/// Pipeline position of a VC's front packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VcState {
    /// No packet, or waiting for a head flit.
    #[default]
    Idle,
    /// Head flit waiting for route compute.
    Routing,
    /// Route known; waiting for an output VC grant.
    VcAlloc,
    /// Output VC held; flits competing for the switch.
    Active,
}

/// One virtual channel: FIFO, state, route set, and the granted output.
#[derive(Debug, Default)]
pub struct Vc {
    state: VcState,
    fifo: VecDeque<Flit>,
    route_set: OutputSet,
    out_port: Option<usize>,
    out_vc: Option<usize>,
}

impl Vc {
    #[inline]
    pub fn state(&self) -> VcState {
        self.state
    }

    #[inline]
    pub fn set_state(&mut self, state: VcState) {
        self.state = state;
    }

    #[inline]
    pub fn occupancy(&self) -> usize {
        self.fifo.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    #[inline]
    pub fn front(&self) -> Option<&Flit> {
        self.fifo.front()
    }

    #[inline]
    pub fn front_mut(&mut self) -> Option<&mut Flit> {
        self.fifo.front_mut()
    }

    pub fn push(&mut self, flit: Flit) {
        self.fifo.push_back(flit);
    }

    pub fn pop(&mut self) -> Option<Flit> {
        self.fifo.pop_front()
    }

    #[inline]
    pub fn route_set(&self) -> &OutputSet {
        &self.route_set
    }

    #[inline]
    pub fn route_set_mut(&mut self) -> &mut OutputSet {
        &mut self.route_set
    }

    pub fn set_route_set(&mut self, set: OutputSet) {
        self.route_set = set;
    }

    pub fn clear_route_set(&mut self) {
        self.route_set.clear();
    }

    /// Record the VA grant.
    pub fn set_output(&mut self, out_port: usize, out_vc: usize) {
        self.out_port = Some(out_port);
        self.out_vc = Some(out_vc);
    }

    /// Forget the VA grant (retarget or packet end).
    pub fn clear_output(&mut self) {
        self.out_port = None;
        self.out_vc = None;
    }

    #[inline]
    pub fn out_port(&self) -> Option<usize> {
        self.out_port
    }

    #[inline]
    pub fn out_vc(&self) -> Option<usize> {
        self.out_vc
    }
}

/// All VCs of one input port.
#[derive(Debug)]
pub struct InputBuffer {
    vcs: Vec<Vc>,
    vc_capacity: usize,
}

impl InputBuffer {
    pub fn new(vcs: usize, vc_capacity: usize) -> Self {
        Self {
            vcs: (0..vcs).map(|_| Vc::default()).collect(),
            vc_capacity,
        }
    }

    #[inline]
    pub fn vc(&self, vc: usize) -> &Vc {
        &self.vcs[vc]
    }

    #[inline]
    pub fn vc_mut(&mut self, vc: usize) -> &mut Vc {
        &mut self.vcs[vc]
    }

    /// Deposit an arriving flit; upstream credits bound occupancy.
    pub fn add_flit(&mut self, vc: usize, flit: Flit) {
        let q = &mut self.vcs[vc];
        assert!(
            q.occupancy() < self.vc_capacity,
            "input VC {vc} overflow: upstream violated credit flow control"
        );
        q.push(flit);
    }

    /// True if every VC is idle and empty.
    pub fn is_quiescent(&self) -> bool {
        self.vcs.iter().all(|q| q.state() == VcState::Idle && q.is_empty())
    }

    /// Total buffered flits across VCs.
    pub fn occupancy(&self) -> usize {
        self.vcs.iter().map(|q| q.occupancy()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_flit(id: u64) -> Flit {
        Flit { id, head: true, tail: true, ..Flit::default() }
    }

    #[test]
    fn test_vc_state_cycle() {
        let mut buf = InputBuffer::new(2, 4);
        assert!(buf.is_quiescent());

        buf.add_flit(0, head_flit(1));
        let q = buf.vc_mut(0);
        assert_eq!(q.state(), VcState::Idle);
        q.set_state(VcState::Routing);
        q.set_state(VcState::VcAlloc);
        q.set_output(0, 3);
        q.set_state(VcState::Active);
        assert_eq!(q.out_vc(), Some(3));

        let f = q.pop().unwrap();
        assert!(f.tail);
        q.clear_output();
        q.set_state(VcState::Idle);
        assert!(buf.is_quiescent());
    }

    #[test]
    #[should_panic(expected = "overflow")]
    fn test_overflow_is_fatal() {
        let mut buf = InputBuffer::new(1, 1);
        buf.add_flit(0, head_flit(1));
        buf.add_flit(0, head_flit(2));
    }

    #[test]
    fn test_occupancy_sums_vcs() {
        let mut buf = InputBuffer::new(2, 4);
        buf.add_flit(0, head_flit(1));
        buf.add_flit(1, head_flit(2));
        buf.add_flit(1, head_flit(3));
        assert_eq!(buf.occupancy(), 3);
        assert!(!buf.is_quiescent());
    }
}
