//! Route computation.
//!
//! A routing function maps (router, destination) to an [`OutputSet`]: the
//! candidate output ports a head flit may request, each with an output VC
//! range and a priority. The route-compute stage fills the set; the VC and
//! switch allocation stages consume it, and the retargeter prunes it when a
//! downstream router is unavailable.
//!
//! Two functions are provided for the mesh:
//!
//! - `DimensionOrder`: classic XY; one productive candidate per hop.
//! - `RowFirstAdaptive`: west-first partial-adaptive. Westward traffic
//!   routes west before anything else; everywhere else both productive
//!   directions are offered, row preferred, giving the retargeter an
//!   alternative before it has to fall back to timeouts. The west-first
//!   turn restriction keeps the channel dependency graph acyclic.

use crate::topology::{Topology, EAST, LOCAL, NORTH, SOUTH, WEST};
use serde::Deserialize;
use smallvec::SmallVec;

/// Which routing function the pipeline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingKind {
    /// Deterministic XY dimension-order routing.
    #[default]
    DimensionOrder,
    /// Row-first with a lower-priority column alternative.
    RowFirstAdaptive,
}

/// One candidate output produced by route compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteCandidate {
    /// Output port to request.
    pub out_port: usize,
    /// First eligible output VC.
    pub vc_start: usize,
    /// Last eligible output VC (inclusive).
    pub vc_end: usize,
    /// Arbitration priority; larger wins.
    pub pri: i32,
}

/// Candidate set for one head flit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSet {
    candidates: SmallVec<[RouteCandidate; 4]>,
}

impl OutputSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate covering the VC range `[vc_start, vc_end]`.
    pub fn add_range(&mut self, out_port: usize, vc_start: usize, vc_end: usize, pri: i32) {
        debug_assert!(vc_start <= vc_end);
        self.candidates.push(RouteCandidate { out_port, vc_start, vc_end, pri });
    }

    /// Drop every candidate.
    pub fn clear(&mut self) {
        self.candidates.clear();
    }

    /// Candidates in insertion order.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &RouteCandidate> {
        self.candidates.iter()
    }

    /// Keep only candidates for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&RouteCandidate) -> bool) {
        self.candidates.retain(|c| keep(c));
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// The single candidate, if exactly one remains.
    pub fn single(&self) -> Option<&RouteCandidate> {
        if self.candidates.len() == 1 {
            self.candidates.first()
        } else {
            None
        }
    }
}

/// Compute the candidate set for a flit at `router` heading to `dest`.
///
/// All candidates span the full VC range `0..vcs`. A flit already at its
/// destination gets the local ejection port.
pub fn compute_route(
    kind: RoutingKind,
    topo: &Topology,
    router: usize,
    dest: usize,
    vcs: usize,
) -> OutputSet {
    let mut set = OutputSet::new();
    if dest == router {
        set.add_range(LOCAL, 0, vcs - 1, 0);
        return set;
    }

    let (col, row) = (topo.col(router), topo.row(router));
    let (dcol, drow) = (topo.col(dest), topo.row(dest));

    let x_port = match dcol.cmp(&col) {
        std::cmp::Ordering::Greater => Some(EAST),
        std::cmp::Ordering::Less => Some(WEST),
        std::cmp::Ordering::Equal => None,
    };
    let y_port = match drow.cmp(&row) {
        std::cmp::Ordering::Greater => Some(NORTH),
        std::cmp::Ordering::Less => Some(SOUTH),
        std::cmp::Ordering::Equal => None,
    };

    match kind {
        RoutingKind::DimensionOrder => {
            // X until the column matches, then Y.
            if let Some(p) = x_port {
                set.add_range(p, 0, vcs - 1, 0);
            } else if let Some(p) = y_port {
                set.add_range(p, 0, vcs - 1, 0);
            }
        }
        RoutingKind::RowFirstAdaptive => {
            if x_port == Some(WEST) {
                // west moves must come first to stay deadlock free
                set.add_range(WEST, 0, vcs - 1, 1);
            } else {
                if let Some(p) = x_port {
                    set.add_range(p, 0, vcs - 1, 1);
                }
                if let Some(p) = y_port {
                    set.add_range(p, 0, vcs - 1, 0);
                }
            }
        }
    }
    debug_assert!(!set.is_empty());
    set
}
