//! 2D mesh topology math.
//!
//! The network is a K×K mesh of routers, numbered row-major from the
//! south-west corner: router `id` sits at column `id % K`, row `id / K`.
//! Each router has four mesh ports plus a local injection/ejection port:
//!
//! ```text
//!             North (2)
//!                │
//!     West (1) ──┼── East (0)
//!                │
//!             South (3)
//! ```
//!
//! Opposite ports differ only in the low bit (`port ^ 1`). The top row
//! (`id / K == K - 1`) hosts the memory controllers and is never power
//! gated.

/// Number of mesh directions per router.
pub const MESH_PORTS: usize = 4;

/// East output/input port.
pub const EAST: usize = 0;
/// West output/input port.
pub const WEST: usize = 1;
/// North output/input port.
pub const NORTH: usize = 2;
/// South output/input port.
pub const SOUTH: usize = 3;

/// Local injection/ejection port (network interface).
pub const LOCAL: usize = 4;

/// The mesh port facing the opposite direction.
#[inline]
pub fn opposite(port: usize) -> usize {
    debug_assert!(port < MESH_PORTS);
    port ^ 1
}

/// Immutable K×K mesh descriptor.
///
/// Routers hold a copy instead of neighbor pointers; all adjacency is
/// derived from ids, so there is nothing to dangle during teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    k: usize,
}

impl Topology {
    /// Create a mesh of side length `k` (so `k * k` routers).
    pub fn new(k: usize) -> Self {
        assert!(k >= 2, "mesh side length must be at least 2");
        Self { k }
    }

    /// Mesh side length.
    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Total router count.
    #[inline]
    pub fn nodes(&self) -> usize {
        self.k * self.k
    }

    /// Column of a router.
    #[inline]
    pub fn col(&self, id: usize) -> usize {
        id % self.k
    }

    /// Row of a router.
    #[inline]
    pub fn row(&self, id: usize) -> usize {
        id / self.k
    }

    /// Router id at the given coordinates.
    #[inline]
    pub fn id_of(&self, col: usize, row: usize) -> usize {
        debug_assert!(col < self.k && row < self.k);
        row * self.k + col
    }

    /// True if `port` of `id` faces the fabric edge (no neighbor there).
    #[inline]
    pub fn is_boundary(&self, id: usize, port: usize) -> bool {
        match port {
            EAST => id % self.k == self.k - 1,
            WEST => id % self.k == 0,
            NORTH => id / self.k == self.k - 1,
            SOUTH => id / self.k == 0,
            _ => panic!("port {port} is not a mesh direction"),
        }
    }

    /// True for routers on the memory-controller row; they are never gated.
    #[inline]
    pub fn is_always_on(&self, id: usize) -> bool {
        id >= self.nodes() - self.k
    }

    /// Neighbor router on `port`, or `None` across the fabric edge.
    #[inline]
    pub fn neighbor(&self, id: usize, port: usize) -> Option<usize> {
        if self.is_boundary(id, port) {
            return None;
        }
        Some(match port {
            EAST => id + 1,
            WEST => id - 1,
            NORTH => id + self.k,
            SOUTH => id - self.k,
            _ => unreachable!(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite_ports() {
        assert_eq!(opposite(EAST), WEST);
        assert_eq!(opposite(WEST), EAST);
        assert_eq!(opposite(NORTH), SOUTH);
        assert_eq!(opposite(SOUTH), NORTH);
    }

    #[test]
    fn test_coordinates_round_trip() {
        let topo = Topology::new(4);
        for id in 0..topo.nodes() {
            assert_eq!(topo.id_of(topo.col(id), topo.row(id)), id);
        }
    }

    #[test]
    fn test_boundary_predicates() {
        let topo = Topology::new(4);
        // south-west corner
        assert!(topo.is_boundary(0, WEST));
        assert!(topo.is_boundary(0, SOUTH));
        assert!(!topo.is_boundary(0, EAST));
        assert!(!topo.is_boundary(0, NORTH));
        // north-east corner
        assert!(topo.is_boundary(15, EAST));
        assert!(topo.is_boundary(15, NORTH));
        // interior router has no boundary ports
        for port in 0..MESH_PORTS {
            assert!(!topo.is_boundary(5, port));
        }
    }

    #[test]
    fn test_neighbors() {
        let topo = Topology::new(4);
        assert_eq!(topo.neighbor(5, EAST), Some(6));
        assert_eq!(topo.neighbor(5, WEST), Some(4));
        assert_eq!(topo.neighbor(5, NORTH), Some(9));
        assert_eq!(topo.neighbor(5, SOUTH), Some(1));
        assert_eq!(topo.neighbor(3, EAST), None);
        assert_eq!(topo.neighbor(12, WEST), None);
    }

    #[test]
    fn test_always_on_row() {
        let topo = Topology::new(4);
        for id in 0..12 {
            assert!(!topo.is_always_on(id));
        }
        for id in 12..16 {
            assert!(topo.is_always_on(id));
            assert!(topo.is_boundary(id, NORTH));
        }
    }
}
