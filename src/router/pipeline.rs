//! Pipeline driver: input queuing, RC → VA → SA → ST, output queuing.
//!
//! Every stage keeps a work-list of entries tagged with the cycle its
//! result commits (`ready`). Each cycle runs an evaluate half (arbitration
//! and availability checks, outcomes recorded on the entries) followed by
//! an update half (entries whose time has come mutate router state).
//! Availability is tested during evaluate so results do not depend on port
//! visiting order; the power-state retarget checks stay in update, right
//! before a grant would commit.
//!
//! Retargeting: when a head flit's chosen downstream turns out to be
//! `draining` or `wakeup` (and is not a memory controller), the grant is
//! unwound — `return_buffer` for a VA grant already held, speculative
//! entries dropped — and the VC goes back to route compute. A head flit
//! stuck in VA or SA for [`STAGE_TIMEOUT`] cycles is forced back to route
//! compute unconditionally; that timeout is the only forward-progress
//! guarantee against repeated retargeting.

use super::{ProcCredit, Router};
use crate::message::Flit;
use crate::router::allocator::RoundRobinArbiter;
use crate::router::buffer_state::BufferOwner;
use crate::router::power::PowerState;
use crate::router::vc::VcState;
use crate::routing::compute_route;
use crate::topology::MESH_PORTS;

/// Cycles a head flit may sit in VA or SA before being forced back to RC.
pub const STAGE_TIMEOUT: u64 = 300;

/// Route-compute work item.
#[derive(Debug, Clone, Copy)]
pub(super) struct RouteEntry {
    pub ready: Option<u64>,
    pub input: usize,
    pub vc: usize,
}

impl RouteEntry {
    pub fn pending(input: usize, vc: usize) -> Self {
        Self { ready: None, input, vc }
    }
}

/// VC-allocation work item; `grant` is `(output, output VC)`.
#[derive(Debug, Clone, Copy)]
pub(super) struct VcAllocEntry {
    pub ready: Option<u64>,
    pub input: usize,
    pub vc: usize,
    pub grant: Option<(usize, usize)>,
}

impl VcAllocEntry {
    pub fn pending(input: usize, vc: usize) -> Self {
        Self { ready: None, input, vc, grant: None }
    }
}

/// Switch-allocation (and switch-hold) work item; `grant` is an expanded
/// output.
#[derive(Debug, Clone, Copy)]
pub(super) struct SwAllocEntry {
    pub ready: Option<u64>,
    pub input: usize,
    pub vc: usize,
    pub grant: Option<usize>,
}

impl SwAllocEntry {
    pub fn pending(input: usize, vc: usize) -> Self {
        Self { ready: None, input, vc, grant: None }
    }
}

/// A flit in switch traversal, between input buffer and output queue.
#[derive(Debug)]
pub(super) struct CrossbarEntry {
    pub ready: Option<u64>,
    pub flit: Flit,
    pub xin: usize,
    pub xout: usize,
}

impl Router {
    /// Phase C: one cycle of internal work.
    ///
    /// While gated (`power_off`/`wakeup`) only the fly-over relay runs; the
    /// pipeline work-lists are asserted empty there.
    pub fn internal_step(&mut self) {
        if matches!(self.power_state, PowerState::PowerOff | PowerState::Wakeup) {
            self.flyover_step();
            self.output_queuing();
            return;
        }

        if !self.active {
            self.handshake_response();
            self.output_queuing();
            return;
        }

        self.input_queuing();
        let mut activity = !self.proc_credits.is_empty();

        if !self.route_vcs.is_empty() {
            self.route_evaluate();
        }
        self.vc_allocator.clear();
        if !self.vc_alloc_vcs.is_empty() {
            self.vc_alloc_evaluate();
        }
        if self.params.hold_switch_for_packet && !self.sw_hold_vcs.is_empty() {
            self.sw_hold_evaluate();
        }
        self.sw_allocator.clear();
        if let Some(spec) = self.spec_sw_allocator.as_mut() {
            spec.clear();
        }
        if !self.sw_alloc_vcs.is_empty() {
            self.sw_alloc_evaluate();
        }
        if !self.crossbar_flits.is_empty() {
            self.switch_evaluate();
        }

        if !self.route_vcs.is_empty() {
            self.route_update();
            activity = activity || !self.route_vcs.is_empty();
        }
        if !self.vc_alloc_vcs.is_empty() {
            self.vc_alloc_update();
            activity = activity || !self.vc_alloc_vcs.is_empty();
        }
        if self.params.hold_switch_for_packet && !self.sw_hold_vcs.is_empty() {
            self.sw_hold_update();
            activity = activity || !self.sw_hold_vcs.is_empty();
        }
        if !self.sw_alloc_vcs.is_empty() {
            self.sw_alloc_update();
            activity = activity || !self.sw_alloc_vcs.is_empty();
        }
        if !self.crossbar_flits.is_empty() {
            self.switch_update();
            activity = activity || !self.crossbar_flits.is_empty();
        }

        self.handshake_response();

        // Retargeting may have refilled the RC list during the updates.
        self.active = activity || !self.route_vcs.is_empty();

        self.output_queuing();
        debug_assert!(self.out_queue_handshakes.is_empty());
    }

    /// Deposit freshly arrived flits into their VCs and apply due credits.
    fn input_queuing(&mut self) {
        let now = self.clock.now();
        let arrivals = std::mem::take(&mut self.in_queue_flits);
        for (input, mut f) in arrivals {
            let vc = f.vc;
            assert!(vc < self.params.vcs);
            f.rtime = now;
            if f.watch {
                log::debug!(
                    "router {} cycle {now}: flit {} enters input {input} VC {vc} ({:?})",
                    self.id,
                    f.id,
                    self.buf[input].vc(vc).state()
                );
            }

            let prior_state = self.buf[input].vc(vc).state();
            let head = f.head;
            self.buf[input].add_flit(vc, f);

            match prior_state {
                VcState::Idle => {
                    let q = self.buf[input].vc(vc);
                    assert!(q.occupancy() == 1 && head, "body flit on idle VC");
                    let xin = input * self.params.input_speedup
                        + vc % self.params.input_speedup;
                    debug_assert!(self.switch_hold_vc[xin] != Some(vc));
                    if self.params.routing_delay > 0 {
                        self.buf[input].vc_mut(vc).set_state(VcState::Routing);
                        self.route_vcs.push_back(RouteEntry::pending(input, vc));
                    } else {
                        // lookahead routing computed at the previous hop
                        let set = q.front().unwrap().la_route_set.clone();
                        let b = self.buf[input].vc_mut(vc);
                        b.set_route_set(set);
                        b.set_state(VcState::VcAlloc);
                        if self.params.speculative {
                            self.sw_alloc_vcs.push_back(SwAllocEntry::pending(input, vc));
                        }
                        self.vc_alloc_vcs.push_back(VcAllocEntry::pending(input, vc));
                    }
                }
                VcState::Active if self.buf[input].vc(vc).occupancy() == 1 => {
                    // the packet's next flit reached the front
                    let xin = input * self.params.input_speedup
                        + vc % self.params.input_speedup;
                    if self.switch_hold_vc[xin] == Some(vc) {
                        self.sw_hold_vcs.push_back(SwAllocEntry::pending(input, vc));
                    } else {
                        self.sw_alloc_vcs.push_back(SwAllocEntry::pending(input, vc));
                    }
                }
                _ => {}
            }
        }

        while let Some(front) = self.proc_credits.front() {
            if now < front.ready {
                break;
            }
            let ProcCredit { credit, output, .. } = self.proc_credits.pop_front().unwrap();
            self.next_buf[output].process_credit(&credit);
            self.credit_pool.free(credit);
        }
    }

    // === route compute ===

    fn route_evaluate(&mut self) {
        let now = self.clock.now();
        let delay = self.params.routing_delay;
        for e in self.route_vcs.iter_mut().filter(|e| e.ready.is_none()) {
            e.ready = Some(now + delay - 1);
        }
    }

    fn route_update(&mut self) {
        assert!(self.params.routing_delay > 0);
        let now = self.clock.now();
        while let Some(front) = self.route_vcs.front() {
            match front.ready {
                Some(t) if t <= now => {}
                _ => break,
            }
            let RouteEntry { input, vc, .. } = self.route_vcs.pop_front().unwrap();

            let q = self.buf[input].vc(vc);
            assert!(!q.is_empty() && q.state() == VcState::Routing);
            let f = q.front().unwrap();
            assert!(f.head && f.vc == vc);
            let (fid, dest, watch) = (f.id, f.dest, f.watch);

            let set = compute_route(self.params.routing, &self.topo, self.id, dest, self.params.vcs);
            if watch {
                log::debug!(
                    "router {} cycle {now}: routed flit {fid} -> {:?}",
                    self.id,
                    set.iter().map(|c| c.out_port).collect::<Vec<_>>()
                );
            }

            let b = self.buf[input].vc_mut(vc);
            b.set_route_set(set);
            b.set_state(VcState::VcAlloc);
            // fresh stamp so the VA/SA timeout measures from route compute
            b.front_mut().unwrap().rtime = now;

            if self.params.speculative {
                self.sw_alloc_vcs.push_back(SwAllocEntry::pending(input, vc));
            }
            self.vc_alloc_vcs.push_back(VcAllocEntry::pending(input, vc));
        }
    }

    // === VC allocation ===

    fn vc_alloc_evaluate(&mut self) {
        let now = self.clock.now();
        let vcs = self.params.vcs;

        for e in self.vc_alloc_vcs.iter().filter(|e| e.ready.is_none()) {
            let q = self.buf[e.input].vc(e.vc);
            debug_assert!(q.state() == VcState::VcAlloc);
            for cand in q.route_set().iter() {
                for out_vc in cand.vc_start..=cand.vc_end {
                    let db = &self.next_buf[cand.out_port];
                    if db.is_available_for(out_vc) && !db.is_full_for(out_vc) {
                        self.vc_allocator.add_request(
                            e.input * vcs + e.vc,
                            cand.out_port * vcs + out_vc,
                            0,
                            cand.pri,
                        );
                    }
                }
            }
        }

        self.vc_allocator.allocate();

        for e in self.vc_alloc_vcs.iter_mut().filter(|e| e.ready.is_none()) {
            e.ready = Some(now + self.params.vc_alloc_delay - 1);
            e.grant = self
                .vc_allocator
                .grant_for_input(e.input * vcs + e.vc)
                .map(|(out_and_vc, _)| (out_and_vc / vcs, out_and_vc % vcs));
        }
    }

    fn vc_alloc_update(&mut self) {
        let now = self.clock.now();
        while let Some(front) = self.vc_alloc_vcs.front() {
            match front.ready {
                Some(t) if t <= now => {}
                _ => break,
            }
            let e = self.vc_alloc_vcs.pop_front().unwrap();
            let (input, vc) = (e.input, e.vc);

            let q = self.buf[input].vc(vc);
            assert!(!q.is_empty() && q.state() == VcState::VcAlloc);
            let f = q.front().unwrap();
            assert!(f.head && f.vc == vc);
            let (fid, dest, watch, rtime) = (f.id, f.dest, f.watch, f.rtime);

            if let Some((out, out_vc)) = e.grant {
                if !self.downstream_unavailable(out, dest) {
                    if !self.next_buf[out].is_available_for(out_vc) {
                        // lost to a grant that committed since evaluate
                        // (possible only with a multi-cycle VA delay)
                        self.vc_alloc_vcs.push_back(VcAllocEntry::pending(input, vc));
                        continue;
                    }
                    if watch {
                        log::debug!(
                            "router {} cycle {now}: flit {fid} acquired output {out} VC {out_vc}",
                            self.id
                        );
                    }
                    self.next_buf[out].take_buffer(out_vc, BufferOwner::InputVc { input, vc });
                    let b = self.buf[input].vc_mut(vc);
                    b.set_output(out, out_vc);
                    b.set_state(VcState::Active);
                    if !self.params.speculative {
                        self.sw_alloc_vcs.push_back(SwAllocEntry::pending(input, vc));
                    }
                } else {
                    // downstream went draining/wakeup: back to route compute
                    if watch {
                        log::debug!(
                            "router {} cycle {now}: flit {fid} retargeted at VA, output {out} is {}",
                            self.id,
                            self.neighbor_states[out]
                        );
                    }
                    let b = self.buf[input].vc_mut(vc);
                    b.clear_route_set();
                    b.set_state(VcState::Routing);
                    self.route_vcs.push_back(RouteEntry::pending(input, vc));
                    if self.params.speculative {
                        self.remove_spec_sw_entries(input, vc);
                    }
                }
            } else {
                // no grant; prune candidates whose downstream became
                // unavailable, then retry or give up to RC
                if self.prune_unavailable_routes(input, vc) {
                    let b = self.buf[input].vc_mut(vc);
                    b.clear_route_set();
                    b.set_state(VcState::Routing);
                    self.route_vcs.push_back(RouteEntry::pending(input, vc));
                    if self.params.speculative {
                        self.remove_spec_sw_entries(input, vc);
                    }
                    continue;
                }
                if now - rtime == STAGE_TIMEOUT {
                    log::debug!(
                        "router {} cycle {now}: flit {fid} timed out in VA, back to RC",
                        self.id
                    );
                    self.buf[input].vc_mut(vc).set_state(VcState::Routing);
                    self.route_vcs.push_back(RouteEntry::pending(input, vc));
                    if self.params.speculative {
                        self.remove_spec_sw_entries(input, vc);
                    }
                } else {
                    self.vc_alloc_vcs.push_back(VcAllocEntry::pending(input, vc));
                }
            }
        }
    }

    // === switch hold ===

    fn sw_hold_evaluate(&mut self) {
        assert!(self.params.hold_switch_for_packet);
        let now = self.clock.now();
        let is = self.params.input_speedup;

        let mut grants: Vec<(usize, Option<usize>)> = Vec::new();
        for (idx, e) in self.sw_hold_vcs.iter().enumerate() {
            if e.ready.is_some() {
                continue;
            }
            let xin = e.input * is + e.vc % is;
            assert!(self.switch_hold_vc[xin] == Some(e.vc));
            let xout = self.switch_hold_in[xin].expect("held input without held output");
            let out = xout / self.params.output_speedup;

            let q = self.buf[e.input].vc(e.vc);
            debug_assert!(q.state() == VcState::Active);
            let sendable = q
                .out_vc()
                .map(|ovc| !self.next_buf[out].is_full_for(ovc))
                .unwrap_or(false)
                && self.output_space(out);
            grants.push((idx, sendable.then_some(xout)));
        }
        for (idx, grant) in grants {
            let e = &mut self.sw_hold_vcs[idx];
            e.ready = Some(now);
            e.grant = grant;
        }
    }

    fn sw_hold_update(&mut self) {
        assert!(self.params.hold_switch_for_packet);
        let now = self.clock.now();
        while let Some(front) = self.sw_hold_vcs.front() {
            match front.ready {
                Some(t) if t <= now => {}
                _ => break,
            }
            let e = self.sw_hold_vcs.pop_front().unwrap();
            let (input, vc) = (e.input, e.vc);
            let xin = input * self.params.input_speedup + vc % self.params.input_speedup;
            assert!(self.switch_hold_vc[xin] == Some(vc));

            match e.grant {
                Some(xout) => {
                    debug_assert!(self.switch_hold_in[xin] == Some(xout));
                    debug_assert!(self.switch_hold_out[xout] == Some(xin));
                    let q = self.buf[input].vc(vc);
                    let match_vc = q.out_vc().expect("held VC without output");
                    debug_assert!(q.out_port() == Some(xout / self.params.output_speedup));
                    self.cross_switch(input, vc, xin, xout, match_vc, true);
                }
                None => {
                    // flit not sendable: release the switch and re-arbitrate
                    let held = self.switch_hold_in[xin].expect("held input without output");
                    self.cancel_hold(xin, held);
                    self.sw_alloc_vcs.push_back(SwAllocEntry::pending(input, vc));
                }
            }
        }
    }

    // === switch allocation ===

    fn sw_alloc_evaluate(&mut self) {
        let now = self.clock.now();
        let is = self.params.input_speedup;
        let os = self.params.output_speedup;

        for e in self.sw_alloc_vcs.iter().filter(|e| e.ready.is_none()) {
            let q = self.buf[e.input].vc(e.vc);
            assert!(!q.is_empty());
            let xin = e.input * is + e.vc % is;
            if self.switch_hold_vc[xin].is_some() {
                continue; // input column pinned to another packet
            }
            match q.state() {
                VcState::Active => {
                    let out = q.out_port().expect("active VC without output");
                    let out_vc = q.out_vc().expect("active VC without output VC");
                    if !self.next_buf[out].is_full_for(out_vc) && self.output_space(out) {
                        let xout = out * os + xin % os;
                        if self.switch_hold_out[xout].is_none() {
                            self.sw_allocator.add_request(xin, xout, e.vc, 1);
                        }
                    }
                }
                VcState::VcAlloc => {
                    debug_assert!(self.params.speculative);
                    for cand in q.route_set().iter() {
                        let db = &self.next_buf[cand.out_port];
                        let usable = (cand.vc_start..=cand.vc_end)
                            .any(|ovc| db.is_available_for(ovc) && !db.is_full_for(ovc));
                        if usable && self.output_space(cand.out_port) {
                            let xout = cand.out_port * os + xin % os;
                            if self.switch_hold_out[xout].is_none() {
                                if let Some(spec) = self.spec_sw_allocator.as_mut() {
                                    spec.add_request(xin, xout, e.vc, cand.pri);
                                }
                            }
                        }
                    }
                }
                state => panic!(
                    "router {} cycle {now}: SA entry for VC in {state:?}",
                    self.id
                ),
            }
        }

        self.sw_allocator.allocate();
        if let Some(spec) = self.spec_sw_allocator.as_mut() {
            spec.allocate();
        }

        for e in self.sw_alloc_vcs.iter_mut().filter(|e| e.ready.is_none()) {
            e.ready = Some(now + self.params.sw_alloc_delay - 1);
            let xin = e.input * is + e.vc % is;
            let main = self.sw_allocator.grant_for_input(xin);
            e.grant = match main {
                Some((xout, gvc)) if gvc == e.vc => Some(xout),
                _ => {
                    let spec = self
                        .spec_sw_allocator
                        .as_ref()
                        .and_then(|spec| spec.grant_for_input(xin));
                    match spec {
                        // non-speculative winners mask speculative ones
                        Some((xout, gvc))
                            if gvc == e.vc
                                && main.is_none()
                                && self.sw_allocator.grant_for_output(xout).is_none() =>
                        {
                            Some(xout)
                        }
                        _ => None,
                    }
                }
            };
        }
    }

    fn sw_alloc_update(&mut self) {
        let now = self.clock.now();
        while let Some(front) = self.sw_alloc_vcs.front() {
            match front.ready {
                Some(t) if t <= now => {}
                _ => break,
            }
            let e = self.sw_alloc_vcs.pop_front().unwrap();
            let (input, vc) = (e.input, e.vc);
            let xin = input * self.params.input_speedup + vc % self.params.input_speedup;

            let q = self.buf[input].vc(vc);
            assert!(!q.is_empty());
            let state = q.state();
            assert!(
                state == VcState::Active
                    || (self.params.speculative && state == VcState::VcAlloc)
            );
            let f = q.front().unwrap();
            assert!(f.vc == vc);
            let (fid, dest, head, cl, watch, rtime) =
                (f.id, f.dest, f.head, f.cl, f.watch, f.rtime);

            match e.grant {
                Some(xout) => {
                    debug_assert!(self.switch_hold_vc[xin].is_none());
                    debug_assert!(self.switch_hold_out[xout].is_none());
                    let out = xout / self.params.output_speedup;

                    if state == VcState::VcAlloc {
                        // speculative win: the VC grant happens here, inline
                        if self.downstream_unavailable(out, dest) {
                            self.sw_alloc_vcs.push_back(SwAllocEntry::pending(input, vc));
                            continue;
                        }
                        match self.piggyback_vc_grant(input, vc, out, cl) {
                            Some(match_vc) => {
                                if watch {
                                    log::debug!(
                                        "router {} cycle {now}: flit {fid} piggyback VC {match_vc} at output {out}",
                                        self.id
                                    );
                                }
                                // VA no longer has anything to do for this VC
                                self.remove_vc_alloc_entries(input, vc);
                                self.cross_switch(input, vc, xin, xout, match_vc, false);
                            }
                            None => {
                                // mis-speculation: every eligible output VC
                                // was taken since evaluate
                                self.sw_alloc_vcs.push_back(SwAllocEntry::pending(input, vc));
                            }
                        }
                    } else {
                        let (out_port, match_vc) = {
                            let q = self.buf[input].vc(vc);
                            (q.out_port().unwrap(), q.out_vc().unwrap())
                        };
                        if out_port != out {
                            // stale grant against a different output
                            self.sw_alloc_vcs.push_back(SwAllocEntry::pending(input, vc));
                            continue;
                        }
                        if head && self.downstream_unavailable(out, dest) {
                            if watch {
                                log::debug!(
                                    "router {} cycle {now}: flit {fid} retargeted at SA, output {out} is {}",
                                    self.id,
                                    self.neighbor_states[out]
                                );
                            }
                            self.next_buf[out].return_buffer(match_vc);
                            let b = self.buf[input].vc_mut(vc);
                            b.clear_route_set();
                            b.clear_output();
                            b.set_state(VcState::Routing);
                            self.route_vcs.push_back(RouteEntry::pending(input, vc));
                            continue;
                        }
                        self.cross_switch(input, vc, xin, xout, match_vc, false);
                    }
                }
                None => {
                    if head {
                        let mut back_to_route = false;
                        if state == VcState::VcAlloc {
                            if self.prune_unavailable_routes(input, vc) {
                                back_to_route = true;
                                self.remove_vc_alloc_entries(input, vc);
                            }
                        } else {
                            let out = self.buf[input].vc(vc).out_port().unwrap();
                            if self.downstream_unavailable(out, dest) {
                                let match_vc = self.buf[input].vc(vc).out_vc().unwrap();
                                self.next_buf[out].return_buffer(match_vc);
                                back_to_route = true;
                            }
                        }
                        if back_to_route {
                            let b = self.buf[input].vc_mut(vc);
                            b.clear_route_set();
                            b.clear_output();
                            b.set_state(VcState::Routing);
                            self.route_vcs.push_back(RouteEntry::pending(input, vc));
                            continue;
                        }
                        if now - rtime == STAGE_TIMEOUT {
                            log::debug!(
                                "router {} cycle {now}: flit {fid} timed out in SA, back to RC",
                                self.id
                            );
                            if state == VcState::Active {
                                let (out, match_vc) = {
                                    let q = self.buf[input].vc(vc);
                                    (q.out_port().unwrap(), q.out_vc().unwrap())
                                };
                                self.next_buf[out].return_buffer(match_vc);
                                self.buf[input].vc_mut(vc).clear_output();
                            } else {
                                self.remove_vc_alloc_entries(input, vc);
                            }
                            self.buf[input].vc_mut(vc).set_state(VcState::Routing);
                            self.route_vcs.push_back(RouteEntry::pending(input, vc));
                            continue;
                        }
                    }
                    self.sw_alloc_vcs.push_back(SwAllocEntry::pending(input, vc));
                }
            }
        }
    }

    // === switch traversal ===

    fn switch_evaluate(&mut self) {
        let now = self.clock.now();
        let delay = self.params.st_delay;
        for e in self.crossbar_flits.iter_mut().filter(|e| e.ready.is_none()) {
            e.ready = Some(now + delay - 1);
        }
    }

    fn switch_update(&mut self) {
        let now = self.clock.now();
        while let Some(front) = self.crossbar_flits.front() {
            match front.ready {
                Some(t) if t <= now => {}
                _ => break,
            }
            let e = self.crossbar_flits.pop_front().unwrap();
            let output = e.xout / self.params.output_speedup;
            if e.flit.watch {
                log::debug!(
                    "router {} cycle {now}: flit {} traversed crossbar {} -> {}",
                    self.id,
                    e.flit.id,
                    e.xin,
                    e.xout
                );
            }
            self.output_buffer[output].push_back(e.flit);
        }
    }

    // === helpers ===

    /// Inline VC selection for a speculative switch grant: round-robin
    /// offset per {output, class}, among currently available output VCs.
    fn piggyback_vc_grant(
        &mut self,
        input: usize,
        vc: usize,
        out: usize,
        cl: usize,
    ) -> Option<usize> {
        let vcs = self.params.vcs;
        let offset = self.vc_rr_offset[out * self.params.classes + cl];

        let mut match_vc: Option<usize> = None;
        let mut match_prio = i32::MIN;
        for cand in self.buf[input].vc(vc).route_set().iter() {
            if cand.out_port != out {
                continue;
            }
            for out_vc in cand.vc_start..=cand.vc_end {
                let db = &self.next_buf[out];
                if !db.is_available_for(out_vc) || db.is_full_for(out_vc) {
                    continue;
                }
                let better = match match_vc {
                    None => true,
                    Some(cur) => RoundRobinArbiter::supersedes(
                        out_vc, cand.pri, cur, match_prio, offset, vcs,
                    ),
                };
                if better {
                    match_vc = Some(out_vc);
                    match_prio = cand.pri;
                }
            }
        }

        let match_vc = match_vc?;
        self.next_buf[out].take_buffer(match_vc, BufferOwner::InputVc { input, vc });
        let b = self.buf[input].vc_mut(vc);
        b.set_output(out, match_vc);
        b.set_state(VcState::Active);
        self.vc_rr_offset[out * self.params.classes + cl] = (match_vc + 1) % vcs;
        Some(match_vc)
    }

    /// Move the front flit of `(input, vc)` into the crossbar and settle
    /// the VC for whatever is behind it.
    fn cross_switch(
        &mut self,
        input: usize,
        vc: usize,
        xin: usize,
        xout: usize,
        match_vc: usize,
        from_hold: bool,
    ) {
        let out = xout / self.params.output_speedup;
        let mut f = self.buf[input].vc_mut(vc).pop().expect("crossing empty VC");
        let tail = f.tail;
        f.hops += 1;
        f.vc = match_vc;

        if self.params.routing_delay == 0 && f.head {
            self.update_lookahead(&mut f, out);
        }

        if f.watch {
            log::debug!(
                "router {} cycle {}: flit {} wins switch {} -> {}",
                self.id,
                self.clock.now(),
                f.id,
                xin,
                xout
            );
        }

        self.next_buf[out].sending_flit(&f);
        self.crossbar_flits.push_back(CrossbarEntry { ready: None, flit: f, xin, xout });
        self.queue_credit_vc(input, vc);

        let q = self.buf[input].vc(vc);
        if q.is_empty() {
            if from_hold {
                self.cancel_hold(xin, xout);
            }
            if tail {
                let b = self.buf[input].vc_mut(vc);
                b.clear_output();
                b.set_state(VcState::Idle);
            }
        } else if tail {
            // the next packet's head is already waiting
            if from_hold {
                self.cancel_hold(xin, xout);
            }
            assert!(self.buf[input].vc(vc).front().unwrap().head);
            let b = self.buf[input].vc_mut(vc);
            b.clear_output();
            if self.params.routing_delay > 0 {
                b.set_state(VcState::Routing);
                self.route_vcs.push_back(RouteEntry::pending(input, vc));
            } else {
                let set = b.front().unwrap().la_route_set.clone();
                b.set_route_set(set);
                b.set_state(VcState::VcAlloc);
                if self.params.speculative {
                    self.sw_alloc_vcs.push_back(SwAllocEntry::pending(input, vc));
                }
                self.vc_alloc_vcs.push_back(VcAllocEntry::pending(input, vc));
            }
        } else if from_hold {
            self.sw_hold_vcs.push_back(SwAllocEntry::pending(input, vc));
        } else if self.params.hold_switch_for_packet {
            self.switch_hold_vc[xin] = Some(vc);
            self.switch_hold_in[xin] = Some(xout);
            self.switch_hold_out[xout] = Some(xin);
            self.sw_hold_vcs.push_back(SwAllocEntry::pending(input, vc));
        } else {
            self.sw_alloc_vcs.push_back(SwAllocEntry::pending(input, vc));
        }
    }

    /// Refresh a flit's lookahead route for the next hop.
    fn update_lookahead(&mut self, f: &mut Flit, out: usize) {
        if out < MESH_PORTS {
            if let Some(n) = self.topo.neighbor(self.id, out) {
                f.la_route_set =
                    compute_route(self.params.routing, &self.topo, n, f.dest, self.params.vcs);
                return;
            }
        }
        f.la_route_set.clear();
    }

    fn cancel_hold(&mut self, xin: usize, xout: usize) {
        self.switch_hold_vc[xin] = None;
        self.switch_hold_in[xin] = None;
        self.switch_hold_out[xout] = None;
    }

    /// Drop candidates whose downstream is unavailable; true if the route
    /// set ended up empty.
    fn prune_unavailable_routes(&mut self, input: usize, vc: usize) -> bool {
        let dest = self.buf[input].vc(vc).front().expect("pruning empty VC").dest;
        let mut pruned: Vec<usize> = Vec::new();
        for c in self.buf[input].vc(vc).route_set().iter() {
            if self.downstream_unavailable(c.out_port, dest) {
                pruned.push(c.out_port);
            }
        }
        let b = self.buf[input].vc_mut(vc);
        b.route_set_mut().retain(|c| !pruned.contains(&c.out_port));
        b.route_set().is_empty()
    }

    fn remove_spec_sw_entries(&mut self, input: usize, vc: usize) {
        self.sw_alloc_vcs
            .retain(|e| !(e.input == input && e.vc == vc));
    }

    fn remove_vc_alloc_entries(&mut self, input: usize, vc: usize) {
        self.vc_alloc_vcs
            .retain(|e| !(e.input == input && e.vc == vc));
    }
}
