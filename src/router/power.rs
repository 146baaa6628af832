//! Per-router power-gating state machine.
//!
//! Each router walks a four-state machine:
//!
//! ```text
//! power_on ──idle──▶ draining ──all drain_done──▶ power_off
//!     ▲                  │                            │
//!     │   abort/timeout  │                 demand ≥ break-even
//!     └──────────────────┘                            ▼
//!     ◀──────────────all drain_done────────────── wakeup
//! ```
//!
//! Transitions commit only through the handshake protocol: a router
//! advertises its intent on every non-boundary port with a fresh request
//! id, collects `drain_done` acknowledgements into `drain_tags`, and backs
//! off whenever a neighbor's own transition would strand traffic. Boundary
//! directions are pre-acknowledged since no neighbor exists there.
//!
//! The memory-controller row never gates. A router holding outstanding
//! requests never leaves `power_on`; both are asserted every cycle.

use super::Router;
use crate::topology::{opposite, MESH_PORTS, SOUTH, WEST};

/// Power state of a router (or of an observed neighbor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerState {
    /// Fully operational.
    #[default]
    PowerOn,
    /// Quiescing traffic before gating.
    Draining,
    /// Gated; only the fly-over relay runs.
    PowerOff,
    /// Re-powering; neighbors re-quiesce before the pipeline restarts.
    Wakeup,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PowerState::PowerOn => "power_on",
            PowerState::Draining => "draining",
            PowerState::PowerOff => "power_off",
            PowerState::Wakeup => "wakeup",
        })
    }
}

/// Gating thresholds, in cycles.
#[derive(Debug, Clone, Copy)]
pub struct PowerConfig {
    /// Give up draining after this many cycles.
    pub drain_threshold: u64,
    /// Demand must persist this long before an off router re-powers
    /// (break-even point of the gating overhead).
    pub bet_threshold: u64,
    /// Cycles the power rail needs before the pipeline may restart.
    pub wakeup_threshold: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self { drain_threshold: 300, bet_threshold: 10, wakeup_threshold: 10 }
    }
}

/// Gating statistics exposed to the harness.
#[derive(Debug, Clone, Default)]
pub struct PowerStats {
    /// Off cycles in the current measurement window.
    pub power_off_cycles: u64,
    /// Off cycles since construction.
    pub total_power_off_cycles: u64,
    /// Drain attempts started.
    pub drain_counter: u64,
    /// Drain attempts that hit the drain threshold.
    pub drain_timeout_counter: u64,
    /// Completed off→wakeup events (gating overhead count).
    pub off_counter: u64,
    /// Shortest completed drain.
    pub drain_time_min: Option<u64>,
    /// Longest completed drain.
    pub drain_time_max: u64,
    /// Every drain duration, in completion order.
    pub drain_time_history: Vec<u64>,
}

impl PowerStats {
    fn record_drain(&mut self, cycles: u64) {
        self.drain_time_history.push(cycles);
        self.drain_time_max = self.drain_time_max.max(cycles);
        self.drain_time_min = Some(self.drain_time_min.map_or(cycles, |m| m.min(cycles)));
    }

    /// Reset the windowed counters; totals and history persist.
    pub fn reset_window(&mut self) {
        self.power_off_cycles = 0;
    }
}

impl Router {
    /// Phase B: advance the power FSM by one cycle.
    ///
    /// Each transition predicate resets the timers it consumed, so calling
    /// this twice in one cycle with inputs suppressed is a no-op after the
    /// first evaluation.
    pub fn power_state_evaluate(&mut self) {
        let now = self.clock.now();

        if self.outstanding_requests > 0 {
            assert!(
                self.power_state == PowerState::PowerOn,
                "router {} cycle {now}: {} outstanding requests while {}",
                self.id,
                self.outstanding_requests,
                self.power_state
            );
        }
        if self.topo.is_always_on(self.id) {
            assert!(
                self.power_state == PowerState::PowerOn,
                "router {} cycle {now}: memory-controller row router left power_on",
                self.id
            );
        }

        match self.power_state {
            PowerState::PowerOn => self.evaluate_power_on(now),
            PowerState::Draining => self.evaluate_draining(now),
            PowerState::PowerOff => self.evaluate_power_off(now),
            PowerState::Wakeup => self.evaluate_wakeup(now),
        }
    }

    fn evaluate_power_on(&mut self, now: u64) {
        self.drain_tags = [false; MESH_PORTS];
        if self.outstanding_requests > 0 {
            self.idle_timer = 0;
        }
        if self.wakeup_signal {
            self.wakeup_signal = false;
            self.idle_timer = 0;
        } else if !self.router_state && !self.topo.is_always_on(self.id) {
            assert!(self.outstanding_requests == 0);

            let mut neighbor_draining = false;
            let mut neighbor_off = false;
            for out in 0..MESH_PORTS {
                match self.neighbor_states[out] {
                    PowerState::Draining => {
                        neighbor_draining = true;
                        break;
                    }
                    PowerState::PowerOff | PowerState::Wakeup => {
                        if self.topo.is_boundary(self.id, out) {
                            continue;
                        }
                        neighbor_off = true;
                        break;
                    }
                    PowerState::PowerOn => {}
                }
            }

            if !neighbor_draining && !neighbor_off {
                log::debug!("router {}: power_on -> draining at cycle {now}", self.id);
                self.power_state = PowerState::Draining;
                self.idle_timer = 0;
                self.drain_timer = 0;
                self.stats.drain_counter += 1;
                self.drain_tags = [false; MESH_PORTS];
                debug_assert!(self.out_queue_handshakes.is_empty());
                for out in 0..MESH_PORTS {
                    if self.topo.is_boundary(self.id, out) {
                        self.drain_tags[out] = true;
                        continue;
                    }
                    self.queue_state_handshake(out, PowerState::Draining);
                }
            } else {
                self.idle_timer = 0;
            }
        }
    }

    fn evaluate_draining(&mut self, now: u64) {
        assert!(self.outstanding_requests == 0);
        self.drain_timer += 1;

        // A west/south neighbor draining, or going dark on that side,
        // outranks this router's attempt.
        let mut neighbor_draining = false;
        let mut neighbor_off_wakeup = false;
        for out in 0..MESH_PORTS {
            match self.neighbor_states[out] {
                PowerState::Draining if out == WEST || out == SOUTH => {
                    neighbor_draining = true;
                    break;
                }
                PowerState::Wakeup => {
                    neighbor_off_wakeup = true;
                    break;
                }
                PowerState::PowerOff => {
                    if (out == WEST || out == SOUTH) && !self.topo.is_boundary(self.id, out) {
                        neighbor_off_wakeup = true;
                        break;
                    }
                }
                _ => {}
            }
        }

        let mut drain_done = self.drain_tags.iter().all(|&t| t)
            && self.in_queue_flits.is_empty()
            && self.crossbar_flits.is_empty()
            && self.buf.iter().all(|b| b.is_quiescent())
            && self.output_buffer.iter().all(|q| q.is_empty());
        drain_done &= self.route_vcs.is_empty()
            && self.vc_alloc_vcs.is_empty()
            && self.sw_hold_vcs.is_empty()
            && self.sw_alloc_vcs.is_empty();

        if self.wakeup_signal {
            log::debug!("router {}: drain aborted by wakeup at cycle {now}", self.id);
            self.wakeup_signal = false;
            self.power_state = PowerState::PowerOn;
            self.drain_tags = [false; MESH_PORTS];
            self.idle_timer = 0;
            self.drain_timer = 0;
            debug_assert!(self.out_queue_handshakes.is_empty());
            for out in 0..MESH_PORTS {
                if self.topo.is_boundary(self.id, out) {
                    continue;
                }
                self.queue_state_handshake(out, PowerState::PowerOn);
            }
        } else if neighbor_draining || neighbor_off_wakeup {
            log::debug!(
                "router {}: drain aborted by neighbor transition at cycle {now}",
                self.id
            );
            self.power_state = PowerState::PowerOn;
            self.drain_tags = [false; MESH_PORTS];
            debug_assert!(self.out_queue_handshakes.is_empty());
            for out in 0..MESH_PORTS {
                self.queue_state_handshake(out, PowerState::PowerOn);
            }
            self.idle_timer = 0;
            self.drain_timer = 0;
        } else if drain_done {
            // Snapshot the downstream credit view; the fly-over relay
            // replays it upstream while this router is dark. Outputs whose
            // opposite side is a fabric edge have no upstream to replay to.
            for out in 0..MESH_PORTS {
                if self.topo.is_boundary(self.id, opposite(out)) {
                    continue;
                }
                for vc in 0..self.params.vcs {
                    self.credit_counter[out][vc] = self.next_buf[out].available_for(vc);
                }
            }
            log::info!(
                "router {}: draining -> power_off after {} cycles at cycle {now}",
                self.id,
                self.drain_timer
            );
            self.power_state = PowerState::PowerOff;
            self.drain_tags = [false; MESH_PORTS];
            self.off_timer = 0;
            debug_assert!(self.out_queue_handshakes.is_empty());
            for out in 0..MESH_PORTS {
                if self.topo.is_boundary(self.id, out) {
                    continue;
                }
                self.queue_state_handshake(out, PowerState::PowerOff);
            }
            let drained = self.drain_timer;
            self.stats.record_drain(drained);
            self.drain_timer = 0;
        } else if self.drain_timer > self.power_cfg.drain_threshold {
            log::debug!("router {}: drain timed out at cycle {now}", self.id);
            self.power_state = PowerState::PowerOn;
            self.drain_tags = [false; MESH_PORTS];
            self.idle_timer = 0;
            debug_assert!(self.out_queue_handshakes.is_empty());
            for out in 0..MESH_PORTS {
                if self.topo.is_boundary(self.id, out) {
                    continue;
                }
                self.queue_state_handshake(out, PowerState::PowerOn);
            }
            self.stats.drain_timeout_counter += 1;
            let drained = self.drain_timer;
            self.stats.record_drain(drained);
            self.drain_timer = 0;
        }
    }

    fn evaluate_power_off(&mut self, now: u64) {
        self.drain_tags = [false; MESH_PORTS];
        assert!(
            self.buf.iter().all(|b| b.is_quiescent()),
            "router {} cycle {now}: input VC busy while power_off",
            self.id
        );
        self.stats.power_off_cycles += 1;
        self.stats.total_power_off_cycles += 1;

        if self.router_state {
            self.off_timer += 1;
            if self.off_timer >= self.power_cfg.bet_threshold {
                log::info!("router {}: power_off -> wakeup at cycle {now}", self.id);
                self.wakeup_signal = false;
                self.power_state = PowerState::Wakeup;
                self.wakeup_timer = 0;
                self.off_timer = 0;
                self.stats.off_counter += 1;
                self.drain_tags = [false; MESH_PORTS];
                debug_assert!(self.out_queue_handshakes.is_empty());
                for out in 0..MESH_PORTS {
                    if self.topo.is_boundary(self.id, out) {
                        self.drain_tags[out] = true;
                        continue;
                    }
                    self.queue_state_handshake(out, PowerState::Wakeup);
                }
            }
        }
    }

    fn evaluate_wakeup(&mut self, now: u64) {
        assert!(
            self.buf.iter().all(|b| b.is_quiescent()),
            "router {} cycle {now}: input VC busy while waking up",
            self.id
        );
        let drain_done = self.drain_tags.iter().all(|&t| t) && self.in_queue_flits.is_empty();
        self.wakeup_timer += 1;

        if drain_done && self.wakeup_timer >= self.power_cfg.wakeup_threshold {
            log::info!("router {}: wakeup -> power_on at cycle {now}", self.id);
            self.wakeup_signal = false;
            self.wakeup_timer = 0;
            self.idle_timer = 0;
            self.power_state = PowerState::PowerOn;
            self.drain_tags = [false; MESH_PORTS];
            debug_assert!(self.out_queue_handshakes.is_empty());
            for out in 0..MESH_PORTS {
                self.queue_state_handshake(out, PowerState::PowerOn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Clock;
    use crate::message::Handshake;
    use crate::topology::Topology;
    use crate::router::{Inbound, Outbound, Router, RouterParams};

    fn bench(id: usize) -> (Router, Clock) {
        let clock = Clock::new();
        let power = PowerConfig { drain_threshold: 20, bet_threshold: 3, wakeup_threshold: 3 };
        let router = Router::new(
            id,
            Topology::new(4),
            clock.clone(),
            RouterParams::default(),
            power,
        );
        (router, clock)
    }

    fn step(router: &mut Router, clock: &Clock, inbound: Inbound) -> Outbound {
        router.read_inputs(inbound);
        router.power_state_evaluate();
        router.internal_step();
        let outbound = router.write_outputs();
        clock.tick();
        outbound
    }

    fn ack_drains(outbound: &Outbound) -> Inbound {
        let mut inbound = Inbound::default();
        for &(port, h) in &outbound.handshakes {
            inbound.handshakes.push((
                port,
                Handshake { drain_done: true, hid: h.hid, src_id: 99, ..Handshake::default() },
            ));
        }
        inbound
    }

    #[test]
    fn test_idle_interior_router_reaches_power_off() {
        let (mut router, clock) = bench(5);
        let out = step(&mut router, &clock, Inbound::default());
        assert_eq!(router.power_state(), PowerState::Draining);
        assert_eq!(router.stats().drain_counter, 1);
        assert_eq!(out.handshakes.len(), 4);
        for &(_, h) in &out.handshakes {
            assert_eq!(h.new_state, Some(PowerState::Draining));
        }

        let acks = ack_drains(&out);
        let out = step(&mut router, &clock, acks);
        assert_eq!(router.power_state(), PowerState::PowerOff);
        assert_eq!(out.handshakes.len(), 4);
        for &(_, h) in &out.handshakes {
            assert_eq!(h.new_state, Some(PowerState::PowerOff));
        }
        assert_eq!(router.stats().drain_time_history.len(), 1);
        assert!(router.stats().drain_time_min.is_some());
    }

    #[test]
    fn test_off_router_wakes_on_sustained_demand() {
        let (mut router, clock) = bench(5);
        let out = step(&mut router, &clock, Inbound::default());
        let acks = ack_drains(&out);
        step(&mut router, &clock, acks);
        assert_eq!(router.power_state(), PowerState::PowerOff);

        router.set_router_state(true);
        let mut wakeup_out = None;
        for _ in 0..5 {
            let out = step(&mut router, &clock, Inbound::default());
            if router.power_state() == PowerState::Wakeup {
                wakeup_out = Some(out);
                break;
            }
        }
        let out = wakeup_out.expect("bet threshold never reached");
        assert_eq!(router.stats().off_counter, 1);
        assert_eq!(out.handshakes.len(), 4);

        let acks = ack_drains(&out);
        let mut inbound = acks;
        for _ in 0..5 {
            let out = step(&mut router, &clock, inbound);
            inbound = Inbound::default();
            if router.power_state() == PowerState::PowerOn {
                // full round trip leaves the protocol state clean
                for port in 0..4 {
                    assert!(!router.drain_tag(port));
                    assert!(!router.drain_done_sent(port));
                }
                assert_eq!(out.handshakes.len(), 4);
                return;
            }
        }
        panic!("wakeup never completed");
    }

    #[test]
    fn test_drain_aborts_on_adversarial_neighbor() {
        let (mut router, clock) = bench(5);
        step(&mut router, &clock, Inbound::default());
        assert_eq!(router.power_state(), PowerState::Draining);

        // south neighbor starts draining too; the south side wins
        let mut inbound = Inbound::default();
        inbound.handshakes.push((
            crate::topology::SOUTH,
            Handshake { new_state: Some(PowerState::Draining), src_id: 1, hid: 7, ..Handshake::default() },
        ));
        let out = step(&mut router, &clock, inbound);
        assert_eq!(router.power_state(), PowerState::PowerOn);
        assert_eq!(router.stats().drain_counter, 1);
        assert_eq!(out.handshakes.len(), 4);
        for &(_, h) in &out.handshakes {
            assert_eq!(h.new_state, Some(PowerState::PowerOn));
        }
    }

    #[test]
    fn test_drain_times_out_without_acknowledgements() {
        let (mut router, clock) = bench(5);
        step(&mut router, &clock, Inbound::default());
        assert_eq!(router.power_state(), PowerState::Draining);

        for _ in 0..25 {
            step(&mut router, &clock, Inbound::default());
            if router.power_state() == PowerState::PowerOn {
                break;
            }
        }
        assert_eq!(router.power_state(), PowerState::PowerOn);
        assert_eq!(router.stats().drain_timeout_counter, 1);
        assert_eq!(router.stats().power_off_cycles, 0);
    }

    #[test]
    fn test_corner_router_preseeds_boundary_tags() {
        let (mut router, clock) = bench(0);
        let out = step(&mut router, &clock, Inbound::default());
        assert_eq!(router.power_state(), PowerState::Draining);
        // west and south face the edge: pre-acknowledged, no handshake
        assert!(router.drain_tag(crate::topology::WEST));
        assert!(router.drain_tag(crate::topology::SOUTH));
        assert_eq!(out.handshakes.len(), 2);

        let acks = ack_drains(&out);
        step(&mut router, &clock, acks);
        assert_eq!(router.power_state(), PowerState::PowerOff);
    }

    #[test]
    fn test_outstanding_requests_pin_power_on() {
        let (mut router, clock) = bench(5);
        router.inc_outstanding();
        for _ in 0..10 {
            step(&mut router, &clock, Inbound::default());
            assert_eq!(router.power_state(), PowerState::PowerOn);
        }
        assert_eq!(router.stats().drain_counter, 0);
        router.dec_outstanding();
        step(&mut router, &clock, Inbound::default());
        assert_eq!(router.power_state(), PowerState::Draining);
    }

    #[test]
    fn test_controller_row_never_drains() {
        let (mut router, clock) = bench(13);
        for _ in 0..10 {
            step(&mut router, &clock, Inbound::default());
            assert_eq!(router.power_state(), PowerState::PowerOn);
        }
        assert_eq!(router.stats().drain_counter, 0);
    }

    #[test]
    fn test_evaluate_is_idempotent_with_inputs_suppressed() {
        let (mut router, clock) = bench(5);
        step(&mut router, &clock, Inbound::default());
        assert_eq!(router.power_state(), PowerState::Draining);
        let timer_probe = router.stats().clone();
        // a second evaluation in the same cycle must not double-count
        router.power_state_evaluate();
        router.power_state_evaluate();
        assert_eq!(router.power_state(), PowerState::Draining);
        assert_eq!(router.stats().drain_counter, timer_probe.drain_counter);
        let _ = clock;
    }
}
