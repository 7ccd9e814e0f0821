//! The per-bucket B-tree of data-node handles.
//!
//! Keys are slot indices into the data-node slab, ordered by the pair
//! `(cached_hash, key)`. Tree nodes live in their own slab and reference each
//! other (and their parent) by slot index, so the tree is freed wholesale when
//! its slab is dropped. Every operation here runs under the owning bucket's
//! exclusive lock or during a single-threaded table phase.

use std::cmp::Ordering;

use super::DataNode;
use crate::slab::Slab;

/// Sentinel slot index.
pub(crate) const NIL: usize = usize::MAX;

/// Minimum degree of the tree.
pub(crate) const MIN_DEGREE: usize = 3;

/// Maximum keys per node.
const MAX_KEYS: usize = 2 * MIN_DEGREE - 1;

/// Minimum keys per non-root node.
const MIN_KEYS: usize = MIN_DEGREE - 1;

/// Maximum children per node.
const MAX_CHILDREN: usize = MAX_KEYS + 1;

/// An internal node: data-node handles plus child and parent links, all as
/// slab slot indices.
pub(crate) struct TreeNode {
    parent: usize,
    len: usize,
    keys: [usize; MAX_KEYS],
    children: [usize; MAX_CHILDREN],
}

impl TreeNode {
    fn new_leaf() -> Self {
        Self {
            parent: NIL,
            len: 0,
            keys: [NIL; MAX_KEYS],
            children: [NIL; MAX_CHILDREN],
        }
    }

    #[inline]
    fn is_leaf(&self) -> bool {
        self.children[0] == NIL
    }

    /// Shifts keys right and writes `key` at `pos`; the caller adjusts `len`.
    fn insert_key(&mut self, pos: usize, key: usize) {
        let mut i = self.len;
        while i > pos {
            self.keys[i] = self.keys[i - 1];
            i -= 1;
        }
        self.keys[pos] = key;
    }

    /// Shifts children right and writes `child` at `pos`; the caller adjusts
    /// `len`.
    fn insert_child(&mut self, pos: usize, child: usize) {
        let mut i = self.len + 1;
        while i > pos {
            self.children[i] = self.children[i - 1];
            i -= 1;
        }
        self.children[pos] = child;
    }

    fn remove_key(&mut self, pos: usize) {
        for i in pos + 1..self.len {
            self.keys[i - 1] = self.keys[i];
        }
    }

    fn remove_child(&mut self, pos: usize) {
        for i in pos + 1..=self.len {
            self.children[i - 1] = self.children[i];
        }
    }
}

/// Slab references every tree operation needs: the tree-node arena and the
/// data-node arena the handles point into.
pub(crate) struct TreeCtx<'s, K, V> {
    pub(crate) data: &'s Slab<DataNode<K, V>>,
    pub(crate) nodes: &'s Slab<TreeNode>,
}

impl<K, V> TreeCtx<'_, K, V> {
    /// # Safety
    ///
    /// `idx` must be an allocated, initialized tree-node slot, and no `&mut`
    /// to it may be live.
    #[inline]
    unsafe fn node(&self, idx: usize) -> &TreeNode {
        &*self.nodes.slot_ptr(idx)
    }

    /// # Safety
    ///
    /// `idx` must be an allocated, initialized tree-node slot, the caller must
    /// hold the owning bucket exclusively, and no other reference to the node
    /// may be live.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn node_mut(&self, idx: usize) -> &mut TreeNode {
        &mut *self.nodes.slot_ptr(idx)
    }

    /// Compares the probe `(hash, key)` against the entry behind `data_idx`.
    ///
    /// # Safety
    ///
    /// `data_idx` must be an allocated, initialized data-node slot.
    #[inline]
    unsafe fn cmp(&self, hash: usize, key: &K, data_idx: usize) -> Ordering
    where
        K: Ord,
    {
        let entry = &*self.data.slot_ptr(data_idx);
        hash.cmp(&entry.hash).then_with(|| key.cmp(&entry.key))
    }

    /// Returns the first key position strictly greater than the probe, or
    /// `node.len` if there is none.
    unsafe fn upper_slot(&self, node: &TreeNode, hash: usize, key: &K) -> usize
    where
        K: Ord,
    {
        let mut i = 0;
        while i < node.len {
            if self.cmp(hash, key, node.keys[i]) == Ordering::Less {
                break;
            }
            i += 1;
        }
        i
    }
}

/// Outcome of a tree insertion.
pub(crate) enum TreeInsert {
    /// The handle was inserted.
    Inserted,
    /// An entry with the same `(hash, key)` already exists.
    Found(usize),
}

/// The tree-node slab ran dry; the tree is semantically unchanged.
pub(crate) struct NodesExhausted;

/// A B-tree rooted in a slab slot. Plain old data, stored inline in the
/// bucket's chain word.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BTree {
    pub(crate) root: usize,
    pub(crate) len: usize,
}

impl BTree {
    pub(crate) fn new() -> Self {
        Self { root: NIL, len: 0 }
    }

    /// Finds the data-node handle stored for `(hash, key)`.
    pub(crate) fn search<K: Ord, V>(
        &self,
        ctx: &TreeCtx<'_, K, V>,
        hash: usize,
        key: &K,
    ) -> Option<usize> {
        self.locate(ctx, hash, key)
            .map(|(node_idx, pos)| unsafe { ctx.node(node_idx).keys[pos] })
    }

    fn locate<K: Ord, V>(
        &self,
        ctx: &TreeCtx<'_, K, V>,
        hash: usize,
        key: &K,
    ) -> Option<(usize, usize)> {
        let mut current = self.root;
        while current != NIL {
            let upper = unsafe { ctx.upper_slot(ctx.node(current), hash, key) };
            if upper > 0 {
                let candidate = unsafe { ctx.node(current).keys[upper - 1] };
                if unsafe { ctx.cmp(hash, key, candidate) } == Ordering::Equal {
                    return Some((current, upper - 1));
                }
            }
            current = unsafe { ctx.node(current).children[upper] };
        }
        None
    }

    /// Inserts the handle `data_idx` for the probe `(hash, key)`.
    ///
    /// Full nodes are split on the way down, so the recursion never has to
    /// back up. On [`NodesExhausted`] the key set is unchanged; completed
    /// splits are kept, which is harmless.
    pub(crate) fn insert<K: Ord, V>(
        &mut self,
        ctx: &TreeCtx<'_, K, V>,
        hash: usize,
        key: &K,
        data_idx: usize,
    ) -> Result<TreeInsert, NodesExhausted> {
        // A full root is split up front; splitting it mid-descent would
        // overflow its parent.
        if self.root != NIL && unsafe { ctx.node(self.root).len } == MAX_KEYS {
            let old_root = self.root;
            let new_root = ctx.nodes.allocate().ok_or(NodesExhausted)?;
            unsafe {
                ctx.nodes.slot_ptr(new_root).write(TreeNode::new_leaf());
                ctx.node_mut(new_root).children[0] = old_root;
            }
            if self.split_child(ctx, new_root, 0, old_root).is_err() {
                ctx.nodes.free(new_root);
                return Err(NodesExhausted);
            }
            unsafe { ctx.node_mut(old_root).parent = new_root };
            self.root = new_root;
        }

        let mut hot = NIL;
        let mut current = self.root;
        while current != NIL {
            let upper = unsafe { ctx.upper_slot(ctx.node(current), hash, key) };
            if upper > 0 {
                let candidate = unsafe { ctx.node(current).keys[upper - 1] };
                if unsafe { ctx.cmp(hash, key, candidate) } == Ordering::Equal {
                    return Ok(TreeInsert::Found(candidate));
                }
            }
            hot = current;
            current = unsafe { ctx.node(current).children[upper] };

            if current != NIL && unsafe { ctx.node(current).len } == MAX_KEYS {
                self.split_child(ctx, hot, upper, current)?;
                // The split hoisted a key into `hot` at `upper`; route around
                // it.
                let hoisted = unsafe { ctx.node(hot).keys[upper] };
                match unsafe { ctx.cmp(hash, key, hoisted) } {
                    Ordering::Greater => {
                        current = unsafe { ctx.node(hot).children[upper + 1] };
                    }
                    Ordering::Equal => return Ok(TreeInsert::Found(hoisted)),
                    Ordering::Less => {}
                }
            }
        }

        if hot == NIL {
            let root = ctx.nodes.allocate().ok_or(NodesExhausted)?;
            unsafe {
                ctx.nodes.slot_ptr(root).write(TreeNode::new_leaf());
                let node = ctx.node_mut(root);
                node.keys[0] = data_idx;
                node.len = 1;
            }
            self.root = root;
            self.len += 1;
            return Ok(TreeInsert::Inserted);
        }

        unsafe {
            let node = ctx.node_mut(hot);
            let pos = ctx.upper_slot(node, hash, key);
            node.insert_key(pos, data_idx);
            node.len += 1;
        }
        self.len += 1;
        Ok(TreeInsert::Inserted)
    }

    /// Splits the full `child` (at `child_pos` of `parent`) into two minimal
    /// nodes, hoisting the middle key.
    fn split_child<K, V>(
        &mut self,
        ctx: &TreeCtx<'_, K, V>,
        parent: usize,
        child_pos: usize,
        child: usize,
    ) -> Result<(), NodesExhausted> {
        let right = ctx.nodes.allocate().ok_or(NodesExhausted)?;
        unsafe {
            ctx.nodes.slot_ptr(right).write(TreeNode::new_leaf());
            let right_node = ctx.node_mut(right);
            let child_node = ctx.node_mut(child);
            right_node.parent = parent;
            right_node.len = MIN_KEYS;
            for i in 0..MIN_KEYS {
                right_node.keys[i] = child_node.keys[i + MIN_DEGREE];
            }
            if !child_node.is_leaf() {
                for i in 0..MIN_DEGREE {
                    let grandchild = child_node.children[i + MIN_DEGREE];
                    right_node.children[i] = grandchild;
                    ctx.node_mut(grandchild).parent = right;
                }
            }
            let middle = child_node.keys[MIN_KEYS];
            child_node.len = MIN_KEYS;
            let parent_node = ctx.node_mut(parent);
            parent_node.insert_key(child_pos, middle);
            parent_node.insert_child(child_pos + 1, right);
            parent_node.len += 1;
        }
        Ok(())
    }

    /// Removes `(hash, key)` and returns the stored data-node handle.
    pub(crate) fn remove<K: Ord, V>(
        &mut self,
        ctx: &TreeCtx<'_, K, V>,
        hash: usize,
        key: &K,
    ) -> Option<usize> {
        let (mut node_idx, mut pos) = self.locate(ctx, hash, key)?;
        let removed = unsafe { ctx.node(node_idx).keys[pos] };
        unsafe {
            if !ctx.node(node_idx).is_leaf() {
                // Swap with the in-order successor so the deletion itself
                // always happens at a leaf.
                let mut successor = ctx.node(node_idx).children[pos + 1];
                while !ctx.node(successor).is_leaf() {
                    successor = ctx.node(successor).children[0];
                }
                ctx.node_mut(node_idx).keys[pos] = ctx.node(successor).keys[0];
                node_idx = successor;
                pos = 0;
            }
            let node = ctx.node_mut(node_idx);
            node.remove_key(pos);
            node.len -= 1;
        }
        if node_idx != self.root {
            self.solve_underflow(ctx, node_idx);
        } else if unsafe { ctx.node(self.root).len } == 0 {
            let child = unsafe { ctx.node(self.root).children[0] };
            ctx.nodes.free(self.root);
            self.root = child;
            if child != NIL {
                unsafe { ctx.node_mut(child).parent = NIL };
            }
        }
        self.len -= 1;
        Some(removed)
    }

    /// Repairs a node left with fewer than `MIN_KEYS` keys by borrowing from
    /// a sibling or merging with one, walking upwards as merges shrink the
    /// parent.
    fn solve_underflow<K, V>(&mut self, ctx: &TreeCtx<'_, K, V>, start: usize) {
        let mut q = start;
        loop {
            if unsafe { ctx.node(q).len } >= MIN_KEYS {
                return;
            }
            if q == self.root {
                if unsafe { ctx.node(q).len } == 0 {
                    // The tree loses one level.
                    let child = unsafe { ctx.node(q).children[0] };
                    ctx.nodes.free(q);
                    self.root = child;
                    if child != NIL {
                        unsafe { ctx.node_mut(child).parent = NIL };
                    }
                }
                return;
            }

            let parent = unsafe { ctx.node(q).parent };
            let q_pos = unsafe {
                let parent_node = ctx.node(parent);
                let mut n = 0;
                while parent_node.children[n] != q {
                    n += 1;
                }
                n
            };

            // Borrow from the left sibling if it can spare a key.
            if q_pos > 0 {
                let left = unsafe { ctx.node(parent).children[q_pos - 1] };
                if unsafe { ctx.node(left).len } > MIN_KEYS {
                    unsafe {
                        let parent_node = ctx.node_mut(parent);
                        let left_node = ctx.node_mut(left);
                        let q_node = ctx.node_mut(q);
                        q_node.insert_key(0, parent_node.keys[q_pos - 1]);
                        if !q_node.is_leaf() {
                            let moved = left_node.children[left_node.len];
                            q_node.insert_child(0, moved);
                            ctx.node_mut(moved).parent = q;
                        }
                        q_node.len += 1;
                        parent_node.keys[q_pos - 1] = left_node.keys[left_node.len - 1];
                        left_node.len -= 1;
                    }
                    return;
                }
            }

            // Borrow from the right sibling if it can spare a key.
            if q_pos < unsafe { ctx.node(parent).len } {
                let right = unsafe { ctx.node(parent).children[q_pos + 1] };
                if unsafe { ctx.node(right).len } > MIN_KEYS {
                    unsafe {
                        let parent_node = ctx.node_mut(parent);
                        let right_node = ctx.node_mut(right);
                        let q_node = ctx.node_mut(q);
                        q_node.keys[q_node.len] = parent_node.keys[q_pos];
                        q_node.len += 1;
                        if !right_node.is_leaf() {
                            let moved = right_node.children[0];
                            q_node.children[q_node.len] = moved;
                            ctx.node_mut(moved).parent = q;
                        }
                        parent_node.keys[q_pos] = right_node.keys[0];
                        right_node.remove_key(0);
                        right_node.remove_child(0);
                        right_node.len -= 1;
                    }
                    return;
                }
            }

            // Both siblings are minimal: merge through the parent key.
            unsafe {
                let parent_node = ctx.node_mut(parent);
                if q_pos > 0 {
                    let left = parent_node.children[q_pos - 1];
                    let left_node = ctx.node_mut(left);
                    let q_node = ctx.node(q);
                    left_node.keys[left_node.len] = parent_node.keys[q_pos - 1];
                    left_node.len += 1;
                    for i in 0..q_node.len {
                        left_node.keys[left_node.len + i] = q_node.keys[i];
                    }
                    if !q_node.is_leaf() {
                        for i in 0..=q_node.len {
                            let child = q_node.children[i];
                            ctx.node_mut(child).parent = left;
                            left_node.children[left_node.len + i] = child;
                        }
                    }
                    left_node.len += q_node.len;
                    parent_node.remove_key(q_pos - 1);
                    parent_node.remove_child(q_pos);
                    parent_node.len -= 1;
                    ctx.nodes.free(q);
                } else {
                    let right = parent_node.children[q_pos + 1];
                    let right_node = ctx.node(right);
                    let q_node = ctx.node_mut(q);
                    q_node.keys[q_node.len] = parent_node.keys[q_pos];
                    q_node.len += 1;
                    for i in 0..right_node.len {
                        q_node.keys[q_node.len + i] = right_node.keys[i];
                    }
                    if !right_node.is_leaf() {
                        for i in 0..=right_node.len {
                            let child = right_node.children[i];
                            ctx.node_mut(child).parent = q;
                            q_node.children[q_node.len + i] = child;
                        }
                    }
                    q_node.len += right_node.len;
                    parent_node.remove_key(q_pos);
                    parent_node.remove_child(q_pos + 1);
                    parent_node.len -= 1;
                    ctx.nodes.free(right);
                }
            }

            // The parent lost a key; it may underflow in turn.
            q = parent;
        }
    }

    /// Appends every data-node handle in the tree to `out`.
    pub(crate) fn collect<K, V>(&self, ctx: &TreeCtx<'_, K, V>, out: &mut Vec<usize>) {
        if self.root != NIL {
            Self::collect_subtree(ctx, self.root, out);
        }
    }

    fn collect_subtree<K, V>(ctx: &TreeCtx<'_, K, V>, node_idx: usize, out: &mut Vec<usize>) {
        let node = unsafe { ctx.node(node_idx) };
        if !node.is_leaf() {
            for i in 0..=node.len {
                Self::collect_subtree(ctx, node.children[i], out);
            }
        }
        for i in 0..node.len {
            out.push(node.keys[i]);
        }
    }

    /// Frees every tree node, leaving the tree empty. Data nodes are not
    /// touched.
    pub(crate) fn clear<K, V>(&mut self, ctx: &TreeCtx<'_, K, V>) {
        if self.root != NIL {
            Self::clear_subtree(ctx, self.root);
        }
        self.root = NIL;
        self.len = 0;
    }

    fn clear_subtree<K, V>(ctx: &TreeCtx<'_, K, V>, node_idx: usize) {
        let node = unsafe { ctx.node(node_idx) };
        if !node.is_leaf() {
            for i in 0..=node.len {
                Self::clear_subtree(ctx, node.children[i]);
            }
        }
        ctx.nodes.free(node_idx);
    }

    /// Asserts the structural invariants: node arity, parent links, uniform
    /// leaf depth, and global `(hash, key)` ordering.
    #[cfg(test)]
    pub(crate) fn check_invariants<K: Ord, V>(&self, ctx: &TreeCtx<'_, K, V>) {
        if self.root == NIL {
            assert_eq!(self.len, 0);
            return;
        }
        let mut count = 0;
        let mut last: Option<usize> = None;
        let mut leaf_depth: Option<usize> = None;
        Self::check_subtree(
            ctx,
            self.root,
            NIL,
            true,
            0,
            &mut count,
            &mut last,
            &mut leaf_depth,
        );
        assert_eq!(count, self.len);
    }

    #[cfg(test)]
    #[allow(clippy::too_many_arguments)]
    fn check_subtree<K: Ord, V>(
        ctx: &TreeCtx<'_, K, V>,
        node_idx: usize,
        parent: usize,
        is_root: bool,
        depth: usize,
        count: &mut usize,
        last: &mut Option<usize>,
        leaf_depth: &mut Option<usize>,
    ) {
        let node = unsafe { ctx.node(node_idx) };
        assert_eq!(node.parent, parent);
        assert!(node.len <= MAX_KEYS);
        if is_root {
            assert!(node.len >= 1);
        } else {
            assert!(node.len >= MIN_KEYS);
        }
        if node.is_leaf() {
            match leaf_depth {
                Some(expected) => assert_eq!(*expected, depth),
                None => *leaf_depth = Some(depth),
            }
        }
        for i in 0..node.len {
            if !node.is_leaf() {
                Self::check_subtree(
                    ctx,
                    node.children[i],
                    node_idx,
                    false,
                    depth + 1,
                    count,
                    last,
                    leaf_depth,
                );
            }
            let data_idx = node.keys[i];
            if let Some(prev) = last {
                let prev_entry = unsafe { &*ctx.data.slot_ptr(*prev) };
                assert_eq!(
                    unsafe { ctx.cmp(prev_entry.hash, &prev_entry.key, data_idx) },
                    Ordering::Less
                );
            }
            *last = Some(data_idx);
            *count += 1;
        }
        if !node.is_leaf() {
            Self::check_subtree(
                ctx,
                node.children[node.len],
                node_idx,
                false,
                depth + 1,
                count,
                last,
                leaf_depth,
            );
        }
    }
}
