//! Arbitration for the VC and switch allocation stages.
//!
//! Both stages use a separable input-first allocator built from
//! round-robin arbiters: each input first picks one of its requests, then
//! each output picks one of the inputs that chose it. Priorities win
//! outright; ties break in circular order starting at the arbiter's
//! pointer, and a pointer only advances past a granted requestor, which is
//! what makes repeated contention fair.
//!
//! Requests are filtered for downstream availability before they are added
//! (in the evaluate half of the stage), so the outcome does not depend on
//! the order ports are visited.

/// Round-robin arbiter over `size` requestor slots.
#[derive(Debug, Clone)]
pub struct RoundRobinArbiter {
    size: usize,
    pointer: usize,
}

impl RoundRobinArbiter {
    pub fn new(size: usize) -> Self {
        Self { size, pointer: 0 }
    }

    /// True if candidate `(cand, cand_pri)` beats the current winner
    /// `(cur, cur_pri)` under round-robin order starting at `pointer`.
    pub fn supersedes(
        cand: usize,
        cand_pri: i32,
        cur: usize,
        cur_pri: i32,
        pointer: usize,
        size: usize,
    ) -> bool {
        if cand_pri != cur_pri {
            return cand_pri > cur_pri;
        }
        let cand_dist = (cand + size - pointer) % size;
        let cur_dist = (cur + size - pointer) % size;
        cand_dist < cur_dist
    }

    /// Pick a winner among `(slot, priority)` requests, without updating
    /// state.
    pub fn arbitrate(&self, requests: impl Iterator<Item = (usize, i32)>) -> Option<usize> {
        let mut winner: Option<(usize, i32)> = None;
        for (slot, pri) in requests {
            debug_assert!(slot < self.size);
            match winner {
                None => winner = Some((slot, pri)),
                Some((cur, cur_pri)) => {
                    if Self::supersedes(slot, pri, cur, cur_pri, self.pointer, self.size) {
                        winner = Some((slot, pri));
                    }
                }
            }
        }
        winner.map(|(slot, _)| slot)
    }

    /// Advance the pointer past a granted slot.
    pub fn grant(&mut self, winner: usize) {
        debug_assert!(winner < self.size);
        self.pointer = (winner + 1) % self.size;
    }

    #[inline]
    pub fn pointer(&self) -> usize {
        self.pointer
    }
}

#[derive(Debug, Clone, Copy)]
struct Request {
    output: usize,
    label: usize,
    pri: i32,
}

/// Separable input-first allocator matching `inputs` to `outputs`.
///
/// `label` rides along with a request and is reported back with the grant;
/// the switch stage uses it to carry the requesting VC.
#[derive(Debug)]
pub struct SeparableInputFirstAllocator {
    inputs: usize,
    outputs: usize,
    requests: Vec<Vec<Request>>,
    input_arbs: Vec<RoundRobinArbiter>,
    output_arbs: Vec<RoundRobinArbiter>,
    grants_by_input: Vec<Option<(usize, usize)>>,
    grants_by_output: Vec<Option<usize>>,
}

impl SeparableInputFirstAllocator {
    pub fn new(inputs: usize, outputs: usize) -> Self {
        Self {
            inputs,
            outputs,
            requests: vec![Vec::new(); inputs],
            input_arbs: (0..inputs).map(|_| RoundRobinArbiter::new(outputs)).collect(),
            output_arbs: (0..outputs).map(|_| RoundRobinArbiter::new(inputs)).collect(),
            grants_by_input: vec![None; inputs],
            grants_by_output: vec![None; outputs],
        }
    }

    /// Drop all requests and grants; arbiter pointers persist.
    pub fn clear(&mut self) {
        for reqs in &mut self.requests {
            reqs.clear();
        }
        self.grants_by_input.fill(None);
        self.grants_by_output.fill(None);
    }

    /// Add a request from `input` for `output`. For duplicate
    /// (input, output) pairs the higher-priority request is kept.
    pub fn add_request(&mut self, input: usize, output: usize, label: usize, pri: i32) {
        debug_assert!(input < self.inputs && output < self.outputs);
        let reqs = &mut self.requests[input];
        if let Some(existing) = reqs.iter_mut().find(|r| r.output == output) {
            if pri > existing.pri {
                existing.pri = pri;
                existing.label = label;
            }
            return;
        }
        reqs.push(Request { output, label, pri });
    }

    /// Run both arbitration stages and commit grants.
    pub fn allocate(&mut self) {
        // stage 1: each input picks one output
        let mut picks: Vec<Option<Request>> = vec![None; self.inputs];
        for input in 0..self.inputs {
            let reqs = &self.requests[input];
            if reqs.is_empty() {
                continue;
            }
            let winner = self.input_arbs[input]
                .arbitrate(reqs.iter().map(|r| (r.output, r.pri)));
            picks[input] = winner
                .and_then(|out| reqs.iter().find(|r| r.output == out))
                .copied();
        }

        // stage 2: each output picks one of the inputs that chose it
        for output in 0..self.outputs {
            let winner = self.output_arbs[output].arbitrate(
                picks
                    .iter()
                    .enumerate()
                    .filter_map(|(input, pick)| {
                        pick.filter(|r| r.output == output).map(|r| (input, r.pri))
                    }),
            );
            if let Some(input) = winner {
                let req = picks[input].expect("stage-2 winner must have a pick");
                self.grants_by_input[input] = Some((output, req.label));
                self.grants_by_output[output] = Some(input);
                self.input_arbs[input].grant(output);
                self.output_arbs[output].grant(input);
            }
        }
    }

    /// Grant for `input`: `(output, label)` if matched.
    #[inline]
    pub fn grant_for_input(&self, input: usize) -> Option<(usize, usize)> {
        self.grants_by_input[input]
    }

    /// Input matched to `output`, if any.
    #[inline]
    pub fn grant_for_output(&self, output: usize) -> Option<usize> {
        self.grants_by_output[output]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supersedes_priority_then_distance() {
        assert!(RoundRobinArbiter::supersedes(3, 1, 0, 0, 0, 4));
        assert!(!RoundRobinArbiter::supersedes(3, 0, 0, 1, 0, 4));
        // equal priority: closest to pointer wins
        assert!(RoundRobinArbiter::supersedes(2, 0, 3, 0, 2, 4));
        assert!(!RoundRobinArbiter::supersedes(3, 0, 2, 0, 2, 4));
    }

    #[test]
    fn test_round_robin_rotation() {
        let mut arb = RoundRobinArbiter::new(3);
        let all = [(0usize, 0i32), (1, 0), (2, 0)];
        let w1 = arb.arbitrate(all.iter().copied()).unwrap();
        arb.grant(w1);
        let w2 = arb.arbitrate(all.iter().copied()).unwrap();
        arb.grant(w2);
        let w3 = arb.arbitrate(all.iter().copied()).unwrap();
        assert_eq!((w1, w2, w3), (0, 1, 2));
    }

    #[test]
    fn test_conflicting_inputs_share_output_over_time() {
        let mut alloc = SeparableInputFirstAllocator::new(2, 1);
        alloc.add_request(0, 0, 10, 0);
        alloc.add_request(1, 0, 11, 0);
        alloc.allocate();
        let first = alloc.grant_for_output(0).unwrap();

        alloc.clear();
        alloc.add_request(0, 0, 10, 0);
        alloc.add_request(1, 0, 11, 0);
        alloc.allocate();
        let second = alloc.grant_for_output(0).unwrap();
        assert_ne!(first, second, "round robin must rotate between inputs");
    }

    #[test]
    fn test_disjoint_requests_all_granted() {
        let mut alloc = SeparableInputFirstAllocator::new(2, 2);
        alloc.add_request(0, 1, 7, 0);
        alloc.add_request(1, 0, 9, 0);
        alloc.allocate();
        assert_eq!(alloc.grant_for_input(0), Some((1, 7)));
        assert_eq!(alloc.grant_for_input(1), Some((0, 9)));
    }

    #[test]
    fn test_duplicate_request_keeps_higher_priority() {
        let mut alloc = SeparableInputFirstAllocator::new(1, 1);
        alloc.add_request(0, 0, 1, 0);
        alloc.add_request(0, 0, 2, 5);
        alloc.add_request(0, 0, 3, -1);
        alloc.allocate();
        assert_eq!(alloc.grant_for_input(0), Some((0, 2)));
    }

    #[test]
    fn test_priority_beats_round_robin() {
        let mut alloc = SeparableInputFirstAllocator::new(2, 1);
        alloc.add_request(0, 0, 0, 0);
        alloc.add_request(1, 0, 0, 3);
        alloc.allocate();
        assert_eq!(alloc.grant_for_output(0), Some(1));
    }
}
