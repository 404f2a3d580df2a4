use arrayvec::ArrayVec;

use super::pool::{Idx, NIL};
use crate::driver::StreamHandle;

/// Non-reserved dense stream slots. Exhausting them is fatal.
pub(crate) const MAX_STREAMS: usize = 100;

/// Dense IDs start here; the first 32 slots are reserved for CPU threads
/// by convention, so stream IDs never collide with thread IDs in traces.
pub(crate) const FIRST_STREAM_ID: u32 = 32;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum InsertError {
    /// The handle already has an ID.
    Duplicate,
    /// All [`MAX_STREAMS`] dense slots are taken.
    Exhausted,
}

struct SplayNode {
    handle: StreamHandle,
    id: u32,
    left: Idx,
    right: Idx,
}

/// Ordered map from opaque driver stream handles to dense IDs.
///
/// A splay tree over fixed-capacity node storage: every lookup rotates the
/// hit to the root, so the stream an application touches repeatedly stays
/// O(1). IDs are never recycled within a run; removal only unlinks the
/// node from the tree, the slot (and its ID) stays reserved.
pub(crate) struct StreamRegistry {
    nodes: ArrayVec<SplayNode, MAX_STREAMS>,
    root: Idx,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            nodes: ArrayVec::new(),
            root: NIL,
        }
    }

    /// Top-down splay: after this, the node closest to `key` is the root.
    fn splay(&mut self, key: StreamHandle) {
        if self.root == NIL {
            return;
        }
        let mut root = self.root;
        // `l`/`r` are the insertion points of the growing left and right
        // trees, `l_head`/`r_head` their roots.
        let mut l = NIL;
        let mut r = NIL;
        let mut l_head = NIL;
        let mut r_head = NIL;
        loop {
            let root_key = self.nodes[root as usize].handle;
            if key < root_key {
                let mut child = self.nodes[root as usize].left;
                if child == NIL {
                    break;
                }
                if key < self.nodes[child as usize].handle {
                    // zig: rotate right
                    self.nodes[root as usize].left = self.nodes[child as usize].right;
                    self.nodes[child as usize].right = root;
                    root = child;
                    child = self.nodes[root as usize].left;
                    if child == NIL {
                        break;
                    }
                }
                // link right
                if r == NIL {
                    r_head = root;
                } else {
                    self.nodes[r as usize].left = root;
                }
                r = root;
                root = child;
            } else if key > root_key {
                let mut child = self.nodes[root as usize].right;
                if child == NIL {
                    break;
                }
                if key > self.nodes[child as usize].handle {
                    // zag: rotate left
                    self.nodes[root as usize].right = self.nodes[child as usize].left;
                    self.nodes[child as usize].left = root;
                    root = child;
                    child = self.nodes[root as usize].right;
                    if child == NIL {
                        break;
                    }
                }
                // link left
                if l == NIL {
                    l_head = root;
                } else {
                    self.nodes[l as usize].right = root;
                }
                l = root;
                root = child;
            } else {
                break;
            }
        }
        // reassemble
        if l == NIL {
            l_head = self.nodes[root as usize].left;
        } else {
            self.nodes[l as usize].right = self.nodes[root as usize].left;
        }
        if r == NIL {
            r_head = self.nodes[root as usize].right;
        } else {
            self.nodes[r as usize].left = self.nodes[root as usize].right;
        }
        self.nodes[root as usize].left = l_head;
        self.nodes[root as usize].right = r_head;
        self.root = root;
    }

    pub fn insert(&mut self, handle: StreamHandle) -> Result<u32, InsertError> {
        if self.root != NIL {
            self.splay(handle);
            if self.nodes[self.root as usize].handle == handle {
                return Err(InsertError::Duplicate);
            }
        }
        if self.nodes.is_full() {
            return Err(InsertError::Exhausted);
        }
        let id = FIRST_STREAM_ID + self.nodes.len() as u32;
        let node = if self.root == NIL {
            SplayNode {
                handle,
                id,
                left: NIL,
                right: NIL,
            }
        } else if handle < self.nodes[self.root as usize].handle {
            let left = self.nodes[self.root as usize].left;
            self.nodes[self.root as usize].left = NIL;
            SplayNode {
                handle,
                id,
                left,
                right: self.root,
            }
        } else {
            let right = self.nodes[self.root as usize].right;
            self.nodes[self.root as usize].right = NIL;
            SplayNode {
                handle,
                id,
                left: self.root,
                right,
            }
        };
        self.nodes.push(node);
        self.root = (self.nodes.len() - 1) as Idx;
        Ok(id)
    }

    pub fn lookup(&mut self, handle: StreamHandle) -> Option<u32> {
        if self.root == NIL {
            return None;
        }
        self.splay(handle);
        let root = &self.nodes[self.root as usize];
        (root.handle == handle).then_some(root.id)
    }

    /// Unlinks `handle` from the map. Its dense ID stays reserved.
    pub fn remove(&mut self, handle: StreamHandle) -> Option<u32> {
        if self.root == NIL {
            return None;
        }
        self.splay(handle);
        let removed = self.root;
        if self.nodes[removed as usize].handle != handle {
            return None;
        }
        let left = self.nodes[removed as usize].left;
        let right = self.nodes[removed as usize].right;
        if left == NIL {
            self.root = right;
        } else {
            // Splaying the left subtree for the removed key brings its
            // maximum to the top, which then has no right child.
            self.root = left;
            self.splay(handle);
            self.nodes[self.root as usize].right = right;
        }
        Some(self.nodes[removed as usize].id)
    }

    /// Visits every mapped ID in post order.
    pub fn post_order(&self, mut visit: impl FnMut(u32)) {
        fn walk(nodes: &ArrayVec<SplayNode, MAX_STREAMS>, at: Idx, visit: &mut impl FnMut(u32)) {
            if at == NIL {
                return;
            }
            let node = &nodes[at as usize];
            walk(nodes, node.left, visit);
            walk(nodes, node.right, visit);
            visit(node.id);
        }
        walk(&self.nodes, self.root, &mut visit);
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = NIL;
    }
}
