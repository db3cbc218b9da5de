//! Sparse octree over the terrain volume.
//!
//! Node identity is positional: a node at `depth` has integer coordinates in
//! `[0, 2^depth)` per axis, so ids survive splits and joins and neighbor
//! lookup is pure arithmetic. The tree itself is an arena keyed by id.

use std::collections::HashMap;

use glam::Vec3;

/// Positional id of an octree node.
///
/// `index[axis]` is the node's cell coordinate at its depth. The root is
/// `([0, 0, 0], 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OctreeNodeId {
    pub index: [u32; 3],
    pub depth: u32,
}

impl OctreeNodeId {
    pub const ROOT: OctreeNodeId = OctreeNodeId {
        index: [0, 0, 0],
        depth: 0,
    };

    /// Child in the given octant; bit `axis` of `octant` selects the upper
    /// half along that axis.
    pub fn child(&self, octant: u32) -> OctreeNodeId {
        debug_assert!(octant < 8);
        OctreeNodeId {
            index: [
                self.index[0] * 2 + (octant & 1),
                self.index[1] * 2 + ((octant >> 1) & 1),
                self.index[2] * 2 + ((octant >> 2) & 1),
            ],
            depth: self.depth + 1,
        }
    }

    /// Which octant of its parent this node occupies.
    pub fn octant(&self) -> u32 {
        (self.index[0] & 1) | ((self.index[1] & 1) << 1) | ((self.index[2] & 1) << 2)
    }

    pub fn parent(&self) -> Option<OctreeNodeId> {
        if self.depth == 0 {
            return None;
        }
        Some(OctreeNodeId {
            index: [self.index[0] / 2, self.index[1] / 2, self.index[2] / 2],
            depth: self.depth - 1,
        })
    }

    /// The sibling sharing this node's parent across `axis`.
    pub fn inner_neighbor(&self, axis: usize) -> OctreeNodeId {
        let mut index = self.index;
        index[axis] ^= 1;
        OctreeNodeId {
            index,
            depth: self.depth,
        }
    }

    /// The same-depth neighbor on the far side of the parent boundary along
    /// `axis`, away from the inner sibling. `None` at the volume boundary.
    pub fn outer_neighbor(&self, axis: usize) -> Option<OctreeNodeId> {
        let mut index = self.index;
        if self.index[axis] & 1 == 0 {
            index[axis] = self.index[axis].checked_sub(1)?;
        } else {
            index[axis] = self.index[axis] + 1;
            if index[axis] >= 1 << self.depth {
                return None;
            }
        }
        Some(OctreeNodeId {
            index,
            depth: self.depth,
        })
    }

    /// This node's ancestor at a shallower depth.
    pub fn at_depth(&self, depth: u32) -> OctreeNodeId {
        debug_assert!(depth <= self.depth);
        let shift = self.depth - depth;
        OctreeNodeId {
            index: [
                self.index[0] >> shift,
                self.index[1] >> shift,
                self.index[2] >> shift,
            ],
            depth,
        }
    }

    /// Lower corner in normalized `[0, 1]` volume coordinates.
    ///
    /// Not named `min`: that would be shadowed by `Ord::min`, which this id
    /// derives for stable leaf ordering.
    pub fn min_corner(&self) -> Vec3 {
        let scale = 1.0 / (1u32 << self.depth) as f32;
        Vec3::new(
            self.index[0] as f32,
            self.index[1] as f32,
            self.index[2] as f32,
        ) * scale
    }

    /// Upper corner in normalized `[0, 1]` volume coordinates.
    pub fn max_corner(&self) -> Vec3 {
        let scale = 1.0 / (1u32 << self.depth) as f32;
        Vec3::new(
            (self.index[0] + 1) as f32,
            (self.index[1] + 1) as f32,
            (self.index[2] + 1) as f32,
        ) * scale
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Leaf,
    Internal,
}

/// Arena-backed sparse octree. Starts as a single root leaf.
#[derive(Debug)]
pub struct Octree {
    nodes: HashMap<OctreeNodeId, NodeKind>,
}

impl Default for Octree {
    fn default() -> Self {
        Self::new()
    }
}

impl Octree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(OctreeNodeId::ROOT, NodeKind::Leaf);
        Self { nodes }
    }

    pub fn contains(&self, id: OctreeNodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn is_leaf(&self, id: OctreeNodeId) -> bool {
        self.nodes.get(&id) == Some(&NodeKind::Leaf)
    }

    pub fn is_internal(&self, id: OctreeNodeId) -> bool {
        self.nodes.get(&id) == Some(&NodeKind::Internal)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Turn a leaf into an internal node with eight leaf children. No-op
    /// for internal or absent nodes.
    pub fn split(&mut self, id: OctreeNodeId) -> bool {
        if self.nodes.get(&id) != Some(&NodeKind::Leaf) {
            return false;
        }
        self.nodes.insert(id, NodeKind::Internal);
        for octant in 0..8 {
            self.nodes.insert(id.child(octant), NodeKind::Leaf);
        }
        true
    }

    /// Turn an internal node back into a leaf, removing every descendant.
    /// No-op for leaves and absent nodes.
    pub fn join(&mut self, id: OctreeNodeId) -> bool {
        if self.nodes.get(&id) != Some(&NodeKind::Internal) {
            return false;
        }
        let mut stack: Vec<OctreeNodeId> = (0..8).map(|octant| id.child(octant)).collect();
        while let Some(node) = stack.pop() {
            if self.nodes.remove(&node) == Some(NodeKind::Internal) {
                stack.extend((0..8).map(|octant| node.child(octant)));
            }
        }
        self.nodes.insert(id, NodeKind::Leaf);
        true
    }

    /// Resolve an id to the deepest existing node on its root path.
    ///
    /// Returns `id` itself when it exists, otherwise the ancestor leaf that
    /// covers its cell. The result can be shallower than requested when the
    /// tree is not refined there.
    pub fn decode(&self, id: OctreeNodeId) -> OctreeNodeId {
        let mut current = OctreeNodeId::ROOT;
        for depth in 1..=id.depth {
            if self.nodes.get(&current) != Some(&NodeKind::Internal) {
                break;
            }
            current = id.at_depth(depth);
        }
        current
    }

    /// Visit nodes top-down.
    ///
    /// A node's children are queued after the callback runs on it, so nodes
    /// split by the callback get their new children visited and nodes joined
    /// by the callback do not leak removed descendants into the walk.
    pub fn enumerate(&mut self, mut callback: impl FnMut(&mut Octree, OctreeNodeId)) {
        let mut stack = vec![OctreeNodeId::ROOT];
        while let Some(id) = stack.pop() {
            if !self.nodes.contains_key(&id) {
                continue;
            }
            callback(self, id);
            if self.nodes.get(&id) == Some(&NodeKind::Internal) {
                stack.extend((0..8).map(|octant| id.child(octant)));
            }
        }
    }

    /// Visit only leaves, with the same mutation tolerance as
    /// [`enumerate`](Self::enumerate).
    pub fn enumerate_leaves(&mut self, mut callback: impl FnMut(&mut Octree, OctreeNodeId)) {
        self.enumerate(|tree, id| {
            if tree.is_leaf(id) {
                callback(tree, id);
            }
        });
    }

    /// Snapshot of the current leaf ids.
    pub fn leaves(&self) -> Vec<OctreeNodeId> {
        let mut out = Vec::new();
        let mut stack = vec![OctreeNodeId::ROOT];
        while let Some(id) = stack.pop() {
            match self.nodes.get(&id) {
                Some(NodeKind::Leaf) => out.push(id),
                Some(NodeKind::Internal) => {
                    stack.extend((0..8).map(|octant| id.child(octant)))
                }
                None => {}
            }
        }
        out
    }

    /// Visit the leaves under `id` reachable through children whose octant
    /// satisfies `mask`, applying the same mask at every level.
    pub fn enumerate_masked(
        &self,
        id: OctreeNodeId,
        mask: impl Fn(u32) -> bool,
        mut callback: impl FnMut(OctreeNodeId),
    ) {
        let mut stack: Vec<OctreeNodeId> = (0..8)
            .filter(|octant| mask(*octant))
            .map(|octant| id.child(octant))
            .collect();
        while let Some(node) = stack.pop() {
            match self.nodes.get(&node) {
                Some(NodeKind::Leaf) => callback(node),
                Some(NodeKind::Internal) => stack.extend(
                    (0..8)
                        .filter(|octant| mask(*octant))
                        .map(|octant| node.child(octant)),
                ),
                None => {}
            }
        }
    }
}
