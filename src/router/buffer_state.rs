//! Downstream buffer mirror.
//!
//! For each output port the router keeps an [`OutputState`]: its local view
//! of the neighbor's input buffer on the far side of the link. VC
//! allocation reserves a downstream VC here (`take_buffer`), every departing
//! flit counts against its headroom (`sending_flit`), and returning credits
//! replenish it (`process_credit`).
//!
//! Two bulk operations exist for power gating: `clear_credits` zeroes the
//! headroom when the neighbor powers off (the fly-over credit replay then
//! rebuilds the true picture), and `full_credits` restores a fresh view
//! when the neighbor completes wakeup with empty buffers.
//!
//! Every `take_buffer` is balanced by exactly one `return_buffer` or by the
//! tail flit of the owning packet passing through `sending_flit`.

use crate::message::{Credit, Flit};

/// Who holds a downstream VC reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    /// Reserved by VC allocation for a local input VC.
    InputVc { input: usize, vc: usize },
    /// Reserved by the fly-over relay of a powered-off router.
    FlyOver,
    /// Reserved by the local traffic source (injection port mirror).
    LocalSource,
}

#[derive(Debug, Clone, Copy, Default)]
struct VcMirror {
    owner: Option<BufferOwner>,
    occupancy: usize,
}

/// Credit/ownership mirror of one downstream input port.
#[derive(Debug)]
pub struct OutputState {
    vcs: Vec<VcMirror>,
    depth: usize,
}

impl OutputState {
    pub fn new(vcs: usize, depth: usize) -> Self {
        Self { vcs: vec![VcMirror::default(); vcs], depth }
    }

    /// True if `vc` has no current owner.
    #[inline]
    pub fn is_available_for(&self, vc: usize) -> bool {
        self.vcs[vc].owner.is_none()
    }

    /// True if `vc` has no buffer headroom left.
    #[inline]
    pub fn is_full_for(&self, vc: usize) -> bool {
        self.vcs[vc].occupancy >= self.depth
    }

    /// True if nothing is buffered downstream on `vc`.
    #[inline]
    pub fn is_empty_for(&self, vc: usize) -> bool {
        self.vcs[vc].occupancy == 0
    }

    /// Remaining credit headroom for `vc`.
    #[inline]
    pub fn available_for(&self, vc: usize) -> usize {
        self.depth - self.vcs[vc].occupancy
    }

    /// Current reservation holder for `vc`.
    #[inline]
    pub fn owner(&self, vc: usize) -> Option<BufferOwner> {
        self.vcs[vc].owner
    }

    /// Reserve `vc` for `owner`.
    pub fn take_buffer(&mut self, vc: usize, owner: BufferOwner) {
        let m = &mut self.vcs[vc];
        assert!(
            m.owner.is_none(),
            "downstream VC {vc} already owned by {:?}",
            m.owner
        );
        m.owner = Some(owner);
    }

    /// Reverse a `take_buffer` whose packet never departed (retarget path).
    pub fn return_buffer(&mut self, vc: usize) {
        let m = &mut self.vcs[vc];
        assert!(m.owner.is_some(), "return_buffer on unowned VC {vc}");
        m.owner = None;
    }

    /// Account a departing flit; the tail releases the reservation.
    pub fn sending_flit(&mut self, f: &Flit) {
        let m = &mut self.vcs[f.vc];
        m.occupancy += 1;
        assert!(
            m.occupancy <= self.depth,
            "downstream VC {} over-subscribed",
            f.vc
        );
        if f.tail {
            m.owner = None;
        }
    }

    /// Apply a returning credit.
    pub fn process_credit(&mut self, c: &Credit) {
        for &vc in c.vcs() {
            let m = &mut self.vcs[vc];
            assert!(m.occupancy > 0, "credit underflow on VC {vc}");
            m.occupancy -= 1;
        }
    }

    /// Zero the headroom: the neighbor powered off and the snapshot-driven
    /// credit replay is now the only source of truth.
    pub fn clear_credits(&mut self) {
        for m in &mut self.vcs {
            debug_assert!(m.owner.is_none());
            m.occupancy = self.depth;
        }
    }

    /// Restore the fresh-buffer view after the neighbor completed wakeup.
    pub fn full_credits(&mut self) {
        for m in &mut self.vcs {
            m.owner = None;
            m.occupancy = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Flit;

    fn flit(vc: usize, tail: bool) -> Flit {
        Flit { vc, tail, ..Flit::default() }
    }

    #[test]
    fn test_take_send_credit_round_trip() {
        let mut st = OutputState::new(2, 4);
        assert!(st.is_available_for(1));
        st.take_buffer(1, BufferOwner::InputVc { input: 0, vc: 0 });
        assert!(!st.is_available_for(1));

        st.sending_flit(&flit(1, false));
        st.sending_flit(&flit(1, true));
        // tail released the reservation
        assert!(st.is_available_for(1));
        assert_eq!(st.available_for(1), 2);

        let mut c = Credit::default();
        c.add_vc(1);
        st.process_credit(&c);
        st.process_credit(&c);
        assert_eq!(st.available_for(1), 4);
        assert!(st.is_empty_for(1));
    }

    #[test]
    fn test_return_buffer_reverses_take() {
        let mut st = OutputState::new(2, 4);
        st.take_buffer(0, BufferOwner::InputVc { input: 2, vc: 1 });
        st.return_buffer(0);
        assert!(st.is_available_for(0));
    }

    #[test]
    #[should_panic(expected = "already owned")]
    fn test_double_take_is_fatal() {
        let mut st = OutputState::new(1, 4);
        st.take_buffer(0, BufferOwner::FlyOver);
        st.take_buffer(0, BufferOwner::InputVc { input: 0, vc: 0 });
    }

    #[test]
    fn test_power_gate_credit_views() {
        let mut st = OutputState::new(2, 4);
        st.sending_flit(&flit(0, true));
        st.clear_credits();
        assert!(st.is_full_for(0));
        assert!(st.is_full_for(1));
        st.full_credits();
        assert_eq!(st.available_for(0), 4);
        assert_eq!(st.available_for(1), 4);
    }
}
