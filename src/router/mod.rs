//! Virtual-channel input-queued router with distributed power gating.
//!
//! One [`Router`] models a single mesh node. The surrounding cycle loop
//! calls the four phase methods once per simulated cycle, in order, for
//! every router in the network:
//!
//! 1. [`Router::read_inputs`] — drain arriving flits, credits, and
//!    handshakes; apply handshakes to the neighbor-state mirror.
//! 2. [`Router::power_state_evaluate`] — advance the power-gating state
//!    machine; may queue outbound handshakes.
//! 3. [`Router::internal_step`] — run the RC→VA→SA→ST pipeline, or the
//!    fly-over relay while gated.
//! 4. [`Router::write_outputs`] — surrender at most one flit, credit, and
//!    handshake per port for the harness to put on the links.
//!
//! The router never touches channels or neighbor objects directly: the
//! harness moves messages, and all adjacency comes from the [`Topology`]
//! by id.
//!
//! Ports 0 through 3 are the mesh directions; port 4 is the local
//! injection/ejection interface of the attached node. Handshakes and
//! fly-over exist only on the mesh ports.

pub mod allocator;
pub mod buffer_state;
mod flyover;
mod handshake;
mod pipeline;
pub mod power;
pub mod vc;

use crate::channel::Clock;
use crate::message::{Credit, Flit, Handshake, Pool};
use crate::routing::RoutingKind;
use crate::topology::{Topology, MESH_PORTS};
use allocator::SeparableInputFirstAllocator;
use buffer_state::OutputState;
use pipeline::{CrossbarEntry, RouteEntry, SwAllocEntry, VcAllocEntry};
use power::{PowerConfig, PowerState, PowerStats};
use smallvec::SmallVec;
use std::collections::{BTreeMap, VecDeque};
use vc::InputBuffer;

/// Microarchitectural knobs of one router.
#[derive(Debug, Clone)]
pub struct RouterParams {
    /// Input ports (mesh directions plus the local port).
    pub inputs: usize,
    /// Output ports; equals `inputs` on a mesh.
    pub outputs: usize,
    /// Virtual channels per port.
    pub vcs: usize,
    /// Buffer slots per VC.
    pub vc_buf_size: usize,
    /// Route-compute latency; 0 selects lookahead routing.
    pub routing_delay: u64,
    /// VC-allocation latency (at least 1).
    pub vc_alloc_delay: u64,
    /// Switch-allocation latency (at least 1).
    pub sw_alloc_delay: u64,
    /// Switch-traversal latency (at least 1).
    pub st_delay: u64,
    /// Cycles before an arriving credit is applied.
    pub credit_delay: u64,
    /// Input crossbar speedup.
    pub input_speedup: usize,
    /// Output crossbar speedup.
    pub output_speedup: usize,
    /// Allow switch requests while VC allocation is still pending.
    pub speculative: bool,
    /// Pin the switch to a packet until its tail passes.
    pub hold_switch_for_packet: bool,
    /// Per-output staging queue bound; `None` is unbounded.
    pub output_buffer_size: Option<usize>,
    /// Routing function.
    pub routing: RoutingKind,
    /// Traffic classes.
    pub classes: usize,
}

impl Default for RouterParams {
    fn default() -> Self {
        Self {
            inputs: MESH_PORTS + 1,
            outputs: MESH_PORTS + 1,
            vcs: 4,
            vc_buf_size: 4,
            routing_delay: 1,
            vc_alloc_delay: 1,
            sw_alloc_delay: 1,
            st_delay: 1,
            credit_delay: 0,
            input_speedup: 1,
            output_speedup: 1,
            speculative: true,
            hold_switch_for_packet: false,
            output_buffer_size: None,
            routing: RoutingKind::DimensionOrder,
            classes: 1,
        }
    }
}

/// Messages delivered to a router at the start of a cycle.
#[derive(Debug, Default)]
pub struct Inbound {
    /// Arriving flits by input port.
    pub flits: SmallVec<[(usize, Flit); 8]>,
    /// Returning credits by output port.
    pub credits: SmallVec<[(usize, Credit); 8]>,
    /// Arriving handshakes by mesh port.
    pub handshakes: SmallVec<[(usize, Handshake); 4]>,
}

/// Messages a router surrenders at the end of a cycle.
#[derive(Debug, Default)]
pub struct Outbound {
    /// Departing flits by output port.
    pub flits: SmallVec<[(usize, Flit); 8]>,
    /// Upstream credits by input port.
    pub credits: SmallVec<[(usize, Credit); 8]>,
    /// Departing handshakes by mesh port.
    pub handshakes: SmallVec<[(usize, Handshake); 4]>,
}

#[derive(Debug)]
struct ProcCredit {
    ready: u64,
    credit: Credit,
    output: usize,
}

/// One power-gated mesh router.
pub struct Router {
    id: usize,
    topo: Topology,
    clock: Clock,
    params: RouterParams,
    power_cfg: PowerConfig,

    /// Skip-work flag: false only when nothing can possibly change.
    active: bool,

    buf: Vec<InputBuffer>,
    next_buf: Vec<OutputState>,

    in_queue_flits: BTreeMap<usize, Flit>,
    proc_credits: VecDeque<ProcCredit>,
    proc_handshakes: VecDeque<(usize, Handshake)>,

    route_vcs: VecDeque<RouteEntry>,
    vc_alloc_vcs: VecDeque<VcAllocEntry>,
    sw_hold_vcs: VecDeque<SwAllocEntry>,
    sw_alloc_vcs: VecDeque<SwAllocEntry>,
    crossbar_flits: VecDeque<CrossbarEntry>,

    switch_hold_vc: Vec<Option<usize>>,
    switch_hold_in: Vec<Option<usize>>,
    switch_hold_out: Vec<Option<usize>>,

    vc_allocator: SeparableInputFirstAllocator,
    sw_allocator: SeparableInputFirstAllocator,
    spec_sw_allocator: Option<SeparableInputFirstAllocator>,
    vc_rr_offset: Vec<usize>,

    output_buffer: Vec<VecDeque<Flit>>,
    credit_buffer: Vec<VecDeque<Credit>>,
    handshake_buffer: Vec<VecDeque<Handshake>>,
    out_queue_credits: BTreeMap<usize, Credit>,
    out_queue_handshakes: BTreeMap<usize, Handshake>,

    power_state: PowerState,
    neighbor_states: [PowerState; MESH_PORTS],
    drain_tags: [bool; MESH_PORTS],
    drain_done_sent: [bool; MESH_PORTS],
    req_hids: [u32; MESH_PORTS],
    resp_hids: [u32; MESH_PORTS],
    credit_counter: Vec<Vec<usize>>,

    idle_timer: u64,
    drain_timer: u64,
    off_timer: u64,
    wakeup_timer: u64,
    router_state: bool,
    wakeup_signal: bool,
    outstanding_requests: u32,

    stats: PowerStats,

    credit_pool: Pool<Credit>,
    handshake_pool: Pool<Handshake>,
}

impl Router {
    pub fn new(
        id: usize,
        topo: Topology,
        clock: Clock,
        params: RouterParams,
        power_cfg: PowerConfig,
    ) -> Self {
        assert!(params.inputs == MESH_PORTS + 1 && params.outputs == MESH_PORTS + 1);
        assert!(params.vcs >= 1 && params.vc_buf_size >= 1);
        assert!(params.vc_alloc_delay >= 1 && params.sw_alloc_delay >= 1 && params.st_delay >= 1);

        let xinputs = params.inputs * params.input_speedup;
        let xoutputs = params.outputs * params.output_speedup;
        let spec_sw_allocator = params
            .speculative
            .then(|| SeparableInputFirstAllocator::new(xinputs, xoutputs));

        Self {
            buf: (0..params.inputs)
                .map(|_| InputBuffer::new(params.vcs, params.vc_buf_size))
                .collect(),
            next_buf: (0..params.outputs)
                .map(|_| OutputState::new(params.vcs, params.vc_buf_size))
                .collect(),
            in_queue_flits: BTreeMap::new(),
            proc_credits: VecDeque::new(),
            proc_handshakes: VecDeque::new(),
            route_vcs: VecDeque::new(),
            vc_alloc_vcs: VecDeque::new(),
            sw_hold_vcs: VecDeque::new(),
            sw_alloc_vcs: VecDeque::new(),
            crossbar_flits: VecDeque::new(),
            switch_hold_vc: vec![None; xinputs],
            switch_hold_in: vec![None; xinputs],
            switch_hold_out: vec![None; xoutputs],
            vc_allocator: SeparableInputFirstAllocator::new(
                params.inputs * params.vcs,
                params.outputs * params.vcs,
            ),
            sw_allocator: SeparableInputFirstAllocator::new(xinputs, xoutputs),
            spec_sw_allocator,
            vc_rr_offset: vec![0; params.outputs * params.classes],
            output_buffer: (0..params.outputs).map(|_| VecDeque::new()).collect(),
            credit_buffer: (0..params.inputs).map(|_| VecDeque::new()).collect(),
            handshake_buffer: (0..MESH_PORTS).map(|_| VecDeque::new()).collect(),
            out_queue_credits: BTreeMap::new(),
            out_queue_handshakes: BTreeMap::new(),
            power_state: PowerState::PowerOn,
            neighbor_states: [PowerState::PowerOn; MESH_PORTS],
            drain_tags: [false; MESH_PORTS],
            drain_done_sent: [false; MESH_PORTS],
            req_hids: [0; MESH_PORTS],
            resp_hids: [0; MESH_PORTS],
            credit_counter: vec![vec![0; params.vcs]; MESH_PORTS],
            idle_timer: 0,
            drain_timer: 0,
            off_timer: 0,
            wakeup_timer: 0,
            router_state: false,
            wakeup_signal: false,
            outstanding_requests: 0,
            stats: PowerStats::default(),
            active: false,
            credit_pool: Pool::new(),
            handshake_pool: Pool::new(),
            id,
            topo,
            clock,
            params,
            power_cfg,
        }
    }

    /// Phase A: accept this cycle's channel arrivals and apply handshakes.
    pub fn read_inputs(&mut self, inbound: Inbound) {
        let now = self.clock.now();
        let mut have_traffic = false;

        for (input, flit) in inbound.flits {
            assert!(input < self.params.inputs);
            let clash = self.in_queue_flits.insert(input, flit);
            assert!(
                clash.is_none(),
                "router {} cycle {now}: two flits on input {input} in one cycle",
                self.id
            );
            have_traffic = true;
        }
        for (output, credit) in inbound.credits {
            assert!(output < self.params.outputs);
            self.proc_credits.push_back(ProcCredit {
                ready: now + self.params.credit_delay,
                credit,
                output,
            });
            have_traffic = true;
        }
        for (port, hs) in inbound.handshakes {
            assert!(port < MESH_PORTS);
            self.proc_handshakes.push_back((port, hs));
        }

        // Neighbor-state updates must land before the power FSM runs.
        self.handshake_evaluate();
        debug_assert!(self.proc_handshakes.is_empty());

        self.active = self.active || have_traffic;
    }

    /// Phase D: hand over at most one message per port per kind.
    pub fn write_outputs(&mut self) -> Outbound {
        let mut out = Outbound::default();
        for port in 0..self.params.outputs {
            if let Some(f) = self.output_buffer[port].pop_front() {
                out.flits.push((port, f));
            }
        }
        for port in 0..self.params.inputs {
            if let Some(c) = self.credit_buffer[port].pop_front() {
                out.credits.push((port, c));
            }
        }
        for port in 0..MESH_PORTS {
            if let Some(h) = self.handshake_buffer[port].pop_front() {
                out.handshakes.push((port, h));
            }
        }
        out
    }

    // === harness-facing state ===

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn power_state(&self) -> PowerState {
        self.power_state
    }

    /// Power-gating statistics.
    #[inline]
    pub fn stats(&self) -> &PowerStats {
        &self.stats
    }

    /// Neighbor power state last observed on `port`.
    #[inline]
    pub fn neighbor_state(&self, port: usize) -> PowerState {
        self.neighbor_states[port]
    }

    /// Pipeline state of one input VC.
    #[inline]
    pub fn vc_state(&self, input: usize, vc: usize) -> vc::VcState {
        self.buf[input].vc(vc).state()
    }

    /// True once `port`'s drain request has been acknowledged (or the port
    /// is a fabric boundary).
    #[inline]
    pub fn drain_tag(&self, port: usize) -> bool {
        self.drain_tags[port]
    }

    /// True while a drain-done sent on `port` awaits the neighbor's
    /// commit or abort.
    #[inline]
    pub fn drain_done_sent(&self, port: usize) -> bool {
        self.drain_done_sent[port]
    }

    /// True if no reservation holds the downstream VC on `port`.
    #[inline]
    pub fn downstream_available(&self, port: usize, vc: usize) -> bool {
        self.next_buf[port].is_available_for(vc)
    }

    /// Local demand signal: true while the attached node needs this
    /// router (pending injection, outstanding requests, inbound traffic).
    pub fn set_router_state(&mut self, demanded: bool) {
        self.router_state = demanded;
        if demanded
            && matches!(self.power_state, PowerState::PowerOn | PowerState::Draining)
        {
            self.wakeup_signal = true;
        }
    }

    /// Count a request this node has in flight; keeps the router on until
    /// the matching reply drains back.
    pub fn inc_outstanding(&mut self) {
        assert!(
            self.power_state == PowerState::PowerOn,
            "router {} cycle {}: request issued while {:?}",
            self.id,
            self.clock.now(),
            self.power_state
        );
        self.outstanding_requests += 1;
    }

    pub fn dec_outstanding(&mut self) {
        assert!(self.outstanding_requests > 0);
        self.outstanding_requests -= 1;
    }

    #[inline]
    pub fn outstanding_requests(&self) -> u32 {
        self.outstanding_requests
    }

    /// True when no flit is buffered, staged, or crossing anywhere inside.
    pub fn is_quiescent(&self) -> bool {
        self.in_queue_flits.is_empty()
            && self.crossbar_flits.is_empty()
            && self.route_vcs.is_empty()
            && self.vc_alloc_vcs.is_empty()
            && self.sw_hold_vcs.is_empty()
            && self.sw_alloc_vcs.is_empty()
            && self.buf.iter().all(|b| b.is_quiescent())
            && self.output_buffer.iter().all(|q| q.is_empty())
    }

    /// Flits currently inside this router (buffered, staged, or queued).
    pub fn flits_inside(&self) -> usize {
        self.in_queue_flits.len()
            + self.crossbar_flits.len()
            + self.buf.iter().map(|b| b.occupancy()).sum::<usize>()
            + self.output_buffer.iter().map(|q| q.len()).sum::<usize>()
    }

    /// Free a credit that left through `write_outputs` but had no link to
    /// travel on (boundary port or local sink).
    pub fn free_credit(&mut self, c: Credit) {
        self.credit_pool.free(c);
    }

    /// Free a handshake that left through `write_outputs` but had no link.
    pub fn free_handshake(&mut self, h: Handshake) {
        self.handshake_pool.free(h);
    }

    // === shared internal helpers ===

    /// Merge a freed VC into this cycle's outbound credit for `port`.
    fn queue_credit_vc(&mut self, port: usize, vc: usize) {
        if !self.out_queue_credits.contains_key(&port) {
            let c = self.credit_pool.alloc();
            self.out_queue_credits.insert(port, c);
        }
        self.out_queue_credits.get_mut(&port).unwrap().add_vc(vc);
    }

    /// This cycle's outbound handshake record for `port`.
    fn queue_handshake_mut(&mut self, port: usize) -> &mut Handshake {
        debug_assert!(port < MESH_PORTS);
        if !self.out_queue_handshakes.contains_key(&port) {
            let h = self.handshake_pool.alloc();
            self.out_queue_handshakes.insert(port, h);
        }
        self.out_queue_handshakes.get_mut(&port).unwrap()
    }

    /// Queue a state-advertisement handshake with a fresh request id.
    fn queue_state_handshake(&mut self, port: usize, state: PowerState) {
        self.req_hids[port] = self.req_hids[port].wrapping_add(1);
        let (src_id, hid) = (self.id, self.req_hids[port]);
        let h = self.queue_handshake_mut(port);
        h.new_state = Some(state);
        h.src_id = src_id;
        h.hid = hid;
    }

    /// Move merged credits and handshakes onto the per-port send queues.
    fn output_queuing(&mut self) {
        let credits = std::mem::take(&mut self.out_queue_credits);
        for (input, c) in credits {
            debug_assert!(!c.is_empty());
            self.credit_buffer[input].push_back(c);
        }
        let handshakes = std::mem::take(&mut self.out_queue_handshakes);
        for (port, h) in handshakes {
            debug_assert!(h.is_meaningful());
            self.handshake_buffer[port].push_back(h);
        }
    }

    /// True if output `port` can still stage another flit this cycle.
    fn output_space(&self, port: usize) -> bool {
        self.params
            .output_buffer_size
            .map_or(true, |cap| self.output_buffer[port].len() < cap)
    }

    /// A downstream candidate is unavailable when a non-memory-controller
    /// neighbor sits in `draining` or `wakeup`. Powered-off neighbors stay
    /// reachable through fly-over — unless the neighbor is the flit's
    /// destination, which must finish waking (its demand signal is already
    /// pulling it up) before it can consume anything.
    fn downstream_unavailable(&self, out_port: usize, dest: usize) -> bool {
        if out_port >= MESH_PORTS {
            return false;
        }
        match self.topo.neighbor(self.id, out_port) {
            Some(n) if !self.topo.is_always_on(n) => match self.neighbor_states[out_port] {
                PowerState::Draining | PowerState::Wakeup => true,
                PowerState::PowerOff => n == dest,
                PowerState::PowerOn => false,
            },
            _ => false,
        }
    }
}
