//! Fly-over relay: the only logic that runs while a router is gated.
//!
//! A powered-off (or waking) router keeps the row and column links alive
//! by shuttling every arriving flit straight across to the opposite port —
//! east↔west, north↔south — within the cycle. Credits keep flowing too:
//! arriving credits update the local downstream mirror and are relayed to
//! the upstream router on the opposite side, which believes its flits
//! crossed a single hop.
//!
//! On top of the relay, the credit snapshot taken at gating time
//! (`credit_counter`) is replayed upstream one credit per VC per cycle, so
//! the headroom that existed at the dark router's downstream neighbors
//! becomes visible upstream again.

use super::{ProcCredit, Router};
use crate::router::buffer_state::BufferOwner;
use crate::router::power::PowerState;
use crate::topology::{opposite, MESH_PORTS};

impl Router {
    /// Relay flits and credits through a gated router for one cycle.
    pub(super) fn flyover_step(&mut self) {
        let now = self.clock.now();
        assert!(
            matches!(self.power_state, PowerState::PowerOff | PowerState::Wakeup),
            "router {} cycle {now}: fly-over while {}",
            self.id,
            self.power_state
        );
        assert!(
            self.route_vcs.is_empty()
                && self.vc_alloc_vcs.is_empty()
                && self.sw_hold_vcs.is_empty()
                && self.sw_alloc_vcs.is_empty()
                && self.crossbar_flits.is_empty(),
            "router {} cycle {now}: pipeline work left while gated",
            self.id
        );

        // flits cross to the opposite port, one cycle, no buffering
        let arrivals = std::mem::take(&mut self.in_queue_flits);
        for (input, mut f) in arrivals {
            assert!(
                input < MESH_PORTS,
                "router {} cycle {now}: local flit while gated",
                self.id
            );
            let output = opposite(input);
            if f.watch {
                log::debug!(
                    "router {} cycle {now}: flit {} flies over {input} -> {output}",
                    self.id,
                    f.id
                );
            }
            if f.head {
                // marked so regular VC allocation cannot reuse the slot
                self.next_buf[output].take_buffer(f.vc, BufferOwner::FlyOver);
            }
            self.next_buf[output].sending_flit(&f);
            f.flov_hops += 1;
            self.output_buffer[output].push_back(f);
        }

        // credits update the local mirror and are relayed upstream
        while let Some(front) = self.proc_credits.front() {
            if now < front.ready {
                break;
            }
            let ProcCredit { credit, output, .. } = self.proc_credits.pop_front().unwrap();
            self.next_buf[output].process_credit(&credit);

            if output < MESH_PORTS && !self.topo.is_boundary(self.id, opposite(output)) {
                let upstream = opposite(output);
                for &vc in credit.vcs() {
                    self.queue_credit_vc(upstream, vc);
                }
            }
            self.credit_pool.free(credit);
        }

        // replay the gating-time snapshot, one credit per VC per cycle
        for input in 0..MESH_PORTS {
            let output = opposite(input);
            for vc in 0..self.params.vcs {
                if self.credit_counter[output][vc] == 0 {
                    continue;
                }
                let already = self
                    .out_queue_credits
                    .get(&input)
                    .map_or(false, |c| c.has_vc(vc));
                if !already {
                    self.credit_counter[output][vc] -= 1;
                    self.queue_credit_vc(input, vc);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::Clock;
    use crate::message::{Credit, Flit, Handshake};
    use crate::router::power::{PowerConfig, PowerState};
    use crate::router::{Inbound, Outbound, Router, RouterParams};
    use crate::topology::{Topology, EAST, NORTH, SOUTH, WEST};

    fn step(router: &mut Router, clock: &Clock, inbound: Inbound) -> Outbound {
        router.read_inputs(inbound);
        router.power_state_evaluate();
        router.internal_step();
        let outbound = router.write_outputs();
        clock.tick();
        outbound
    }

    /// Idle interior router driven through the drain dance until gated.
    fn gated_bench(id: usize) -> (Router, Clock) {
        let clock = Clock::new();
        let power = PowerConfig { drain_threshold: 50, bet_threshold: 3, wakeup_threshold: 3 };
        let mut router = Router::new(
            id,
            Topology::new(4),
            clock.clone(),
            RouterParams::default(),
            power,
        );
        let out = step(&mut router, &clock, Inbound::default());
        assert_eq!(router.power_state(), PowerState::Draining);
        let mut acks = Inbound::default();
        for &(port, h) in &out.handshakes {
            acks.handshakes.push((
                port,
                Handshake { drain_done: true, hid: h.hid, src_id: 99, ..Handshake::default() },
            ));
        }
        step(&mut router, &clock, acks);
        assert_eq!(router.power_state(), PowerState::PowerOff);
        (router, clock)
    }

    fn drain_replay(router: &mut Router, clock: &Clock) {
        // exhaust the snapshot credit replay so later asserts see only
        // freshly generated credits
        for _ in 0..10 {
            step(router, clock, Inbound::default());
        }
    }

    #[test]
    fn test_flit_crosses_to_opposite_port() {
        let (mut router, clock) = gated_bench(5);
        drain_replay(&mut router, &clock);

        let mut inbound = Inbound::default();
        inbound.flits.push((
            WEST,
            Flit { id: 1, src: 4, dest: 6, head: true, tail: true, vc: 2, ..Flit::default() },
        ));
        let out = step(&mut router, &clock, inbound);
        let (port, f) = out.flits.first().expect("flit was not relayed");
        assert_eq!(*port, EAST);
        assert_eq!(f.flov_hops, 1);
        assert_eq!(f.hops, 0, "fly-over is not a pipeline hop");
        assert_eq!(f.vc, 2, "the relay must not reassign VCs");
        assert!(router.is_quiescent());
    }

    #[test]
    fn test_north_south_pairing() {
        let (mut router, clock) = gated_bench(5);
        drain_replay(&mut router, &clock);

        let mut inbound = Inbound::default();
        inbound.flits.push((
            NORTH,
            Flit { id: 2, src: 9, dest: 1, head: true, tail: true, vc: 0, ..Flit::default() },
        ));
        let out = step(&mut router, &clock, inbound);
        assert_eq!(out.flits.first().map(|(p, _)| *p), Some(SOUTH));
    }

    #[test]
    fn test_credit_relayed_upstream() {
        let (mut router, clock) = gated_bench(5);
        drain_replay(&mut router, &clock);

        // first occupy headroom so the relayed credit has something to free
        let mut inbound = Inbound::default();
        inbound.flits.push((
            WEST,
            Flit { id: 3, src: 4, dest: 6, head: true, tail: true, vc: 1, ..Flit::default() },
        ));
        step(&mut router, &clock, inbound);

        let mut credit = Credit::default();
        credit.add_vc(1);
        let mut inbound = Inbound::default();
        inbound.credits.push((EAST, credit));
        let out = step(&mut router, &clock, inbound);
        let relayed = out
            .credits
            .iter()
            .find(|(p, _)| *p == WEST)
            .expect("credit was not relayed upstream");
        assert!(relayed.1.has_vc(1));
    }

    #[test]
    fn test_snapshot_replay_is_bounded() {
        let (mut router, clock) = gated_bench(5);

        // the snapshot holds one full buffer of headroom per VC; the relay
        // streams it out one credit per VC per cycle, then goes silent.
        // One replay cycle already ran in the cycle the router gated.
        let depth = RouterParams::default().vc_buf_size;
        let mut replay_cycles = 0;
        for _ in 0..depth + 5 {
            let out = step(&mut router, &clock, Inbound::default());
            if !out.credits.is_empty() {
                replay_cycles += 1;
            }
        }
        assert_eq!(replay_cycles, depth - 1);
        let out = step(&mut router, &clock, Inbound::default());
        assert!(out.credits.is_empty());
    }

    #[test]
    fn test_wakeup_still_relays() {
        let (mut router, clock) = gated_bench(5);
        drain_replay(&mut router, &clock);

        router.set_router_state(true);
        while router.power_state() == PowerState::PowerOff {
            step(&mut router, &clock, Inbound::default());
        }
        assert_eq!(router.power_state(), PowerState::Wakeup);

        let mut inbound = Inbound::default();
        inbound.flits.push((
            EAST,
            Flit { id: 4, src: 6, dest: 4, head: true, tail: true, vc: 0, ..Flit::default() },
        ));
        let out = step(&mut router, &clock, inbound);
        assert_eq!(out.flits.first().map(|(p, _)| *p), Some(WEST));
    }
}
