//! Prefix trie over vocabulary indices.
//!
//! Nodes live in an arena and refer to each other by `NodeId`; a parent
//! owns its children through its child map. The same structure backs both
//! the count store (keys in sentence order) and the backoff model (keys are
//! contexts, most recent word first).
//!
//! # Example
//! ```
//! use libngram_core::trie::Trie;
//!
//! let mut trie: Trie<u32> = Trie::new();
//! let node = trie.insert(&[3, 1, 4]);
//! *trie.value_mut(node) = 7;
//!
//! assert_eq!(trie.find(&[3, 1, 4]).map(|n| *trie.value(n)), Some(7));
//! assert!(trie.find(&[3, 1]).is_some());
//! assert!(trie.find(&[3, 9]).is_none());
//! ```
use ahash::AHashMap;

use crate::vocab::VocabIndex;

pub type NodeId = u32;

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    children: AHashMap<VocabIndex, NodeId>,
    parent: NodeId,
    key: VocabIndex,
    live: bool,
}

#[derive(Debug, Clone)]
pub struct Trie<V> {
    slots: Vec<Slot<V>>,
    free: Vec<NodeId>,
}

impl<V: Default> Default for Trie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Default> Trie<V> {
    /// Create a trie holding only the root.
    pub fn new() -> Self {
        Self {
            slots: vec![Slot {
                value: V::default(),
                children: AHashMap::new(),
                parent: 0,
                key: 0,
                live: true,
            }],
            free: Vec::new(),
        }
    }

    fn alloc(&mut self, parent: NodeId, key: VocabIndex) -> NodeId {
        let slot = Slot {
            value: V::default(),
            children: AHashMap::new(),
            parent,
            key,
            live: true,
        };
        match self.free.pop() {
            Some(id) => {
                self.slots[id as usize] = slot;
                id
            }
            None => {
                self.slots.push(slot);
                (self.slots.len() - 1) as NodeId
            }
        }
    }

    /// Node for `path`, creating missing nodes along the way.
    pub fn insert(&mut self, path: &[VocabIndex]) -> NodeId {
        let mut node = self.root();
        for &key in path {
            node = match self.child(node, key) {
                Some(next) => next,
                None => {
                    let next = self.alloc(node, key);
                    self.slots[node as usize].children.insert(key, next);
                    next
                }
            };
        }
        node
    }

    /// Child of `node` under `key`, creating it when missing.
    pub fn insert_child(&mut self, node: NodeId, key: VocabIndex) -> NodeId {
        match self.child(node, key) {
            Some(next) => next,
            None => {
                let next = self.alloc(node, key);
                self.slots[node as usize].children.insert(key, next);
                next
            }
        }
    }

    /// Detach and free the subtree at `path`. The root cannot be removed.
    pub fn remove(&mut self, path: &[VocabIndex]) -> bool {
        match self.find(path) {
            Some(node) if node != self.root() => {
                self.remove_node(node);
                true
            }
            _ => false,
        }
    }

    pub fn remove_node(&mut self, node: NodeId) {
        if node == self.root() || !self.slots[node as usize].live {
            return;
        }
        let parent = self.slots[node as usize].parent;
        let key = self.slots[node as usize].key;
        self.slots[parent as usize].children.remove(&key);

        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            let slot = &mut self.slots[n as usize];
            stack.extend(slot.children.values().copied());
            slot.children = AHashMap::new();
            slot.value = V::default();
            slot.live = false;
            self.free.push(n);
        }
    }
}

impl<V> Trie<V> {
    pub fn root(&self) -> NodeId {
        0
    }

    pub fn value(&self, node: NodeId) -> &V {
        &self.slots[node as usize].value
    }

    pub fn value_mut(&mut self, node: NodeId) -> &mut V {
        &mut self.slots[node as usize].value
    }

    pub fn child(&self, node: NodeId, key: VocabIndex) -> Option<NodeId> {
        self.slots[node as usize].children.get(&key).copied()
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        if node == self.root() {
            None
        } else {
            Some(self.slots[node as usize].parent)
        }
    }

    /// Key of the edge leading into `node`.
    pub fn key(&self, node: NodeId) -> VocabIndex {
        self.slots[node as usize].key
    }

    pub fn num_children(&self, node: NodeId) -> usize {
        self.slots[node as usize].children.len()
    }

    pub fn children(&self, node: NodeId) -> impl Iterator<Item = (VocabIndex, NodeId)> + '_ {
        self.slots[node as usize]
            .children
            .iter()
            .map(|(&k, &n)| (k, n))
    }

    /// Children ordered by key, for reproducible output.
    pub fn sorted_children(&self, node: NodeId) -> Vec<(VocabIndex, NodeId)> {
        let mut kids: Vec<_> = self.children(node).collect();
        kids.sort_unstable_by_key(|&(k, _)| k);
        kids
    }

    /// Walk `path` from the root; `None` if any step is missing.
    pub fn find(&self, path: &[VocabIndex]) -> Option<NodeId> {
        let mut node = self.root();
        for &key in path {
            node = self.child(node, key)?;
        }
        Some(node)
    }

    /// Walk as far as `path` allows, returning the last node reached and
    /// the number of keys consumed.
    pub fn find_prefix(&self, path: &[VocabIndex]) -> (NodeId, usize) {
        let mut node = self.root();
        for (depth, &key) in path.iter().enumerate() {
            match self.child(node, key) {
                Some(next) => node = next,
                None => return (node, depth),
            }
        }
        (node, path.len())
    }

    /// Keys on the path from the root down to `node`.
    pub fn path_of(&self, node: NodeId) -> Vec<VocabIndex> {
        let mut path = Vec::new();
        let mut n = node;
        while let Some(p) = self.parent(n) {
            path.push(self.key(n));
            n = p;
        }
        path.reverse();
        path
    }

    /// All nodes at exactly `depth` below the root together with their
    /// key paths, in key order at every level.
    pub fn nodes_at_depth(&self, depth: usize) -> Vec<(Vec<VocabIndex>, NodeId)> {
        let mut out = Vec::new();
        let mut path = Vec::with_capacity(depth);
        self.collect_depth(self.root(), depth, &mut path, &mut out);
        out
    }

    fn collect_depth(
        &self,
        node: NodeId,
        depth: usize,
        path: &mut Vec<VocabIndex>,
        out: &mut Vec<(Vec<VocabIndex>, NodeId)>,
    ) {
        if path.len() == depth {
            out.push((path.clone(), node));
            return;
        }
        for (key, child) in self.sorted_children(node) {
            path.push(key);
            self.collect_depth(child, depth, path, out);
            path.pop();
        }
    }

    /// Number of live nodes, root included.
    pub fn num_nodes(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_walk_prefixes() {
        let mut t: Trie<i32> = Trie::new();
        let n = t.insert(&[1, 2, 3]);
        *t.value_mut(n) = 5;
        assert_eq!(t.find_prefix(&[1, 2, 9, 9]), (t.find(&[1, 2]).unwrap(), 2));
        assert_eq!(t.path_of(n), vec![1, 2, 3]);
        assert_eq!(t.num_nodes(), 4);
    }

    #[test]
    fn remove_frees_subtree_and_reuses_slots() {
        let mut t: Trie<i32> = Trie::new();
        t.insert(&[1, 2, 3]);
        t.insert(&[1, 4]);
        assert!(t.remove(&[1, 2]));
        assert!(t.find(&[1, 2]).is_none());
        assert!(t.find(&[1, 4]).is_some());
        assert_eq!(t.num_nodes(), 3);

        let again = t.insert(&[7, 8]);
        assert_eq!(*t.value(again), 0);
        assert_eq!(t.num_nodes(), 5);
        assert!(!t.remove(&[]));
    }

    #[test]
    fn depth_enumeration_is_ordered() {
        let mut t: Trie<()> = Trie::new();
        t.insert(&[5, 1]);
        t.insert(&[2, 9]);
        t.insert(&[2, 3]);
        let paths: Vec<_> = t.nodes_at_depth(2).into_iter().map(|(p, _)| p).collect();
        assert_eq!(paths, vec![vec![2, 3], vec![2, 9], vec![5, 1]]);
    }
}
