//! Scene-graph node tree.
//!
//! Nodes own their children through [`Arc`] and point back at their parent
//! through [`Weak`], so dropping a subtree releases it without reference
//! cycles. Reparenting is always detach-then-attach. Mesh and material
//! content is referenced by opaque handles; asset formats live outside this
//! crate and are consumed pull-style by whoever loads them.

use std::sync::{Arc, Weak};

use glam::Mat4;
use parking_lot::RwLock;

/// Opaque handle to mesh data owned by an asset system.
pub type MeshHandle = u64;

/// Opaque handle to material data owned by an asset system.
pub type MaterialHandle = u64;

/// A node in the scene graph.
///
/// Nodes are shared via `Arc<SceneNode>`; all fields use interior mutability
/// so a node can be mutated through the shared handle.
pub struct SceneNode {
    name: RwLock<String>,
    parent: RwLock<Weak<SceneNode>>,
    children: RwLock<Vec<Arc<SceneNode>>>,
    transform: RwLock<Option<Mat4>>,
    mesh: RwLock<Option<MeshHandle>>,
    material: RwLock<Option<MaterialHandle>>,
}

impl SceneNode {
    /// Create a detached node.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: RwLock::new(name.into()),
            parent: RwLock::new(Weak::new()),
            children: RwLock::new(Vec::new()),
            transform: RwLock::new(None),
            mesh: RwLock::new(None),
            material: RwLock::new(None),
        })
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    /// The parent node, if attached and still alive.
    pub fn parent(&self) -> Option<Arc<SceneNode>> {
        self.parent.read().upgrade()
    }

    /// Snapshot of the current children.
    pub fn children(&self) -> Vec<Arc<SceneNode>> {
        self.children.read().clone()
    }

    pub fn local_transform(&self) -> Option<Mat4> {
        *self.transform.read()
    }

    pub fn set_local_transform(&self, transform: Option<Mat4>) {
        *self.transform.write() = transform;
    }

    pub fn mesh(&self) -> Option<MeshHandle> {
        *self.mesh.read()
    }

    pub fn set_mesh(&self, mesh: Option<MeshHandle>) {
        *self.mesh.write() = mesh;
    }

    pub fn material(&self) -> Option<MaterialHandle> {
        *self.material.read()
    }

    pub fn set_material(&self, material: Option<MaterialHandle>) {
        *self.material.write() = material;
    }

    /// Whether `node` is reachable from `self` by walking down the tree.
    pub fn is_ancestor_of(self: &Arc<Self>, node: &Arc<SceneNode>) -> bool {
        let mut current = node.parent();
        while let Some(ancestor) = current {
            if Arc::ptr_eq(self, &ancestor) {
                return true;
            }
            current = ancestor.parent();
        }
        false
    }

    /// Reparent this node.
    ///
    /// Detaches from the current parent first, then attaches to `parent`.
    /// Attaching a node to itself or to one of its own descendants would
    /// create a cycle; such a request is rejected and leaves the node
    /// detached. Returns `false` when rejected.
    pub fn set_parent(self: &Arc<Self>, parent: Option<&Arc<SceneNode>>) -> bool {
        // Detach.
        if let Some(old_parent) = self.parent.read().upgrade() {
            old_parent
                .children
                .write()
                .retain(|child| !Arc::ptr_eq(child, self));
        }
        *self.parent.write() = Weak::new();

        // Attach.
        let Some(parent) = parent else {
            return true;
        };
        if Arc::ptr_eq(self, parent) || self.is_ancestor_of(parent) {
            log::warn!(
                "SceneNode: refusing to attach {:?} under its own descendant {:?}",
                self.name(),
                parent.name()
            );
            return false;
        }
        parent.children.write().push(Arc::clone(self));
        *self.parent.write() = Arc::downgrade(parent);
        true
    }

    /// Transform from node space to world space.
    ///
    /// Composes the local transforms up to the root; nodes without a local
    /// transform contribute identity.
    pub fn world_transform(self: &Arc<Self>) -> Mat4 {
        let local = self.local_transform().unwrap_or(Mat4::IDENTITY);
        match self.parent() {
            Some(parent) => parent.world_transform() * local,
            None => local,
        }
    }

    /// Depth-first search for a descendant by name.
    pub fn find_descendant(self: &Arc<Self>, name: &str) -> Option<Arc<SceneNode>> {
        for child in self.children.read().iter() {
            if child.name.read().as_str() == name {
                return Some(Arc::clone(child));
            }
            if let Some(found) = child.find_descendant(name) {
                return Some(found);
            }
        }
        None
    }

    /// Visit this node and every descendant, depth first.
    pub fn visit(self: &Arc<Self>, visitor: &mut impl FnMut(&Arc<SceneNode>)) {
        visitor(self);
        for child in self.children() {
            child.visit(visitor);
        }
    }
}

impl std::fmt::Debug for SceneNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneNode")
            .field("name", &*self.name.read())
            .field("children", &self.children.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_attach_detach() {
        let root = SceneNode::new("root");
        let child = SceneNode::new("child");

        assert!(child.set_parent(Some(&root)));
        assert_eq!(root.children().len(), 1);
        assert!(Arc::ptr_eq(&child.parent().unwrap(), &root));

        assert!(child.set_parent(None));
        assert!(root.children().is_empty());
        assert!(child.parent().is_none());
    }

    #[test]
    fn test_reparent_moves_node() {
        let a = SceneNode::new("a");
        let b = SceneNode::new("b");
        let child = SceneNode::new("child");

        child.set_parent(Some(&a));
        child.set_parent(Some(&b));

        assert!(a.children().is_empty());
        assert_eq!(b.children().len(), 1);
        assert!(Arc::ptr_eq(&child.parent().unwrap(), &b));
    }

    #[test]
    fn test_cycle_rejected() {
        let root = SceneNode::new("root");
        let child = SceneNode::new("child");
        child.set_parent(Some(&root));

        // Attaching the root under its own child must fail and detach it.
        assert!(!root.set_parent(Some(&child)));
        assert!(root.parent().is_none());
        assert!(child.children().is_empty());

        // Self-attachment is also a cycle.
        assert!(!root.set_parent(Some(&root)));
    }

    #[test]
    fn test_world_transform_composes() {
        let root = SceneNode::new("root");
        let child = SceneNode::new("child");
        child.set_parent(Some(&root));

        root.set_local_transform(Some(Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0))));
        child.set_local_transform(Some(Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0))));

        let world = child.world_transform();
        let origin = world.transform_point3(Vec3::ZERO);
        assert_eq!(origin, Vec3::new(1.0, 2.0, 0.0));
    }

    #[test]
    fn test_world_transform_without_locals_is_identity() {
        let root = SceneNode::new("root");
        let child = SceneNode::new("child");
        child.set_parent(Some(&root));
        assert_eq!(child.world_transform(), Mat4::IDENTITY);
    }

    #[test]
    fn test_find_descendant() {
        let root = SceneNode::new("root");
        let mid = SceneNode::new("mid");
        let leaf = SceneNode::new("leaf");
        mid.set_parent(Some(&root));
        leaf.set_parent(Some(&mid));

        let found = root.find_descendant("leaf").unwrap();
        assert!(Arc::ptr_eq(&found, &leaf));
        assert!(root.find_descendant("missing").is_none());
    }

    #[test]
    fn test_drop_releases_subtree() {
        let root = SceneNode::new("root");
        let child = SceneNode::new("child");
        child.set_parent(Some(&root));

        let weak = Arc::downgrade(&child);
        drop(child);
        // Still held by the parent.
        assert!(weak.upgrade().is_some());

        drop(root);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_visit_order() {
        let root = SceneNode::new("root");
        let a = SceneNode::new("a");
        let b = SceneNode::new("b");
        a.set_parent(Some(&root));
        b.set_parent(Some(&root));

        let mut names = Vec::new();
        root.visit(&mut |node| names.push(node.name()));
        assert_eq!(names, vec!["root", "a", "b"]);
    }
}
