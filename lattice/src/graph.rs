// lattice/src/graph.rs
//
// The lattice graph: an arena of nodes addressed by index, each holding
// ordered maps of incoming and outgoing transitions. Removed nodes leave a
// hole so indices stay stable across rewriting passes.

use std::collections::{BTreeMap, VecDeque};

use libngram_core::prob::add_logp;
use libngram_core::{LogP, Vocab, VocabIndex, LOGP_ONE, VOCAB_NONE};
use serde::{Deserialize, Serialize};

use crate::error::{LatticeError, Result};

pub type NodeIndex = usize;

/// Transition flags.
pub const TRANS_BACKOFF: u32 = 1;
pub const TRANS_PAUSE: u32 = 2;

/// Per-node scores carried over from HTK lattices. Log values use base 10.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HtkWordInfo {
    /// End time in seconds.
    pub time: Option<f64>,
    pub acoustic: Option<f64>,
    pub ngram: Option<f64>,
    pub language: Option<f64>,
    pub pron: Option<f64>,
    pub duration: Option<f64>,
    pub posterior: Option<f64>,
    pub x_scores: [Option<f64>; 9],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatticeTransition {
    pub weight: LogP,
    pub flags: u32,
}

impl LatticeTransition {
    pub fn new(weight: LogP) -> Self {
        Self { weight, flags: 0 }
    }

    pub fn with_flags(weight: LogP, flags: u32) -> Self {
        Self { weight, flags }
    }
}

/// How the weights of two transitions between the same node pair combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// Add probabilities (mass-preserving).
    Sum,
    /// Keep the better transition.
    #[default]
    Max,
}

impl MergePolicy {
    pub fn merge(self, a: LatticeTransition, b: LatticeTransition) -> LatticeTransition {
        let weight = match self {
            MergePolicy::Sum => add_logp(a.weight, b.weight),
            MergePolicy::Max => a.weight.max(b.weight),
        };
        LatticeTransition {
            weight,
            flags: a.flags & b.flags,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LatticeNode {
    /// Word label, `VOCAB_NONE` for null nodes.
    pub word: VocabIndex,
    pub flags: u32,
    /// Log posterior from the last forward-backward pass.
    pub posterior: LogP,
    pub htk: Option<Box<HtkWordInfo>>,
    pub(crate) out: BTreeMap<NodeIndex, LatticeTransition>,
    pub(crate) ins: BTreeMap<NodeIndex, LatticeTransition>,
}

impl LatticeNode {
    fn new(word: VocabIndex) -> Self {
        Self {
            word,
            flags: 0,
            posterior: LOGP_ONE,
            htk: None,
            out: BTreeMap::new(),
            ins: BTreeMap::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.word == VOCAB_NONE
    }

    pub fn out_degree(&self) -> usize {
        self.out.len()
    }

    pub fn in_degree(&self) -> usize {
        self.ins.len()
    }
}

#[derive(Debug, Clone)]
pub struct Lattice {
    name: String,
    vocab: Vocab,
    nodes: Vec<Option<LatticeNode>>,
    initial: NodeIndex,
    final_node: NodeIndex,
}

impl Lattice {
    /// An empty lattice with a null initial and a null final node.
    pub fn new(vocab: Vocab, name: impl Into<String>) -> Self {
        let mut lat = Self {
            name: name.into(),
            vocab,
            nodes: Vec::new(),
            initial: 0,
            final_node: 0,
        };
        lat.initial = lat.add_node(VOCAB_NONE);
        lat.final_node = lat.add_node(VOCAB_NONE);
        lat
    }

    /// A lattice without nodes; readers fill it in and set the end points.
    pub(crate) fn empty(vocab: Vocab, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vocab,
            nodes: Vec::new(),
            initial: 0,
            final_node: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn initial(&self) -> NodeIndex {
        self.initial
    }

    pub fn final_node(&self) -> NodeIndex {
        self.final_node
    }

    pub fn set_initial(&mut self, node: NodeIndex) {
        self.initial = node;
    }

    pub fn set_final(&mut self, node: NodeIndex) {
        self.final_node = node;
    }

    pub fn add_node(&mut self, word: VocabIndex) -> NodeIndex {
        self.nodes.push(Some(LatticeNode::new(word)));
        self.nodes.len() - 1
    }

    /// Make sure slot `index` holds a node, growing the arena as needed.
    pub(crate) fn ensure_node(&mut self, index: NodeIndex, word: VocabIndex) {
        if index >= self.nodes.len() {
            self.nodes.resize_with(index + 1, || None);
        }
        match &mut self.nodes[index] {
            Some(node) => node.word = word,
            slot => *slot = Some(LatticeNode::new(word)),
        }
    }

    pub fn node(&self, index: NodeIndex) -> Option<&LatticeNode> {
        self.nodes.get(index).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> Option<&mut LatticeNode> {
        self.nodes.get_mut(index).and_then(Option::as_mut)
    }

    pub fn word(&self, index: NodeIndex) -> VocabIndex {
        self.node(index).map_or(VOCAB_NONE, |n| n.word)
    }

    pub fn is_null(&self, index: NodeIndex) -> bool {
        self.word(index) == VOCAB_NONE
    }

    pub fn is_pause(&self, index: NodeIndex) -> bool {
        self.word(index) == self.vocab.pause_index()
    }

    /// Nodes the language model does not predict: null nodes and
    /// non-events such as `<s>` and pauses.
    pub fn is_non_word(&self, index: NodeIndex) -> bool {
        let w = self.word(index);
        w == VOCAB_NONE || self.vocab.is_non_event(w)
    }

    /// Number of live nodes.
    pub fn num_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// One past the highest node index ever allocated.
    pub fn max_index(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_transitions(&self) -> usize {
        self.nodes.iter().flatten().map(|n| n.out.len()).sum()
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.nodes.iter().enumerate().filter_map(|(i, n)| n.as_ref().map(|_| i))
    }

    pub fn successors(&self, index: NodeIndex) -> impl Iterator<Item = (NodeIndex, &LatticeTransition)> + '_ {
        self.node(index).into_iter().flat_map(|n| n.out.iter().map(|(&j, t)| (j, t)))
    }

    pub fn predecessors(&self, index: NodeIndex) -> impl Iterator<Item = (NodeIndex, &LatticeTransition)> + '_ {
        self.node(index).into_iter().flat_map(|n| n.ins.iter().map(|(&j, t)| (j, t)))
    }

    pub fn find_trans(&self, from: NodeIndex, to: NodeIndex) -> Option<&LatticeTransition> {
        self.node(from).and_then(|n| n.out.get(&to))
    }

    /// Add a transition, combining with an existing one under `policy`.
    /// Returns false when either end point does not exist.
    pub fn insert_trans_merge(
        &mut self,
        from: NodeIndex,
        to: NodeIndex,
        trans: LatticeTransition,
        policy: MergePolicy,
    ) -> bool {
        if self.node(from).is_none() || self.node(to).is_none() {
            return false;
        }
        let merged = match self.find_trans(from, to) {
            Some(&old) => policy.merge(old, trans),
            None => trans,
        };
        if let Some(n) = self.node_mut(from) {
            n.out.insert(to, merged);
        }
        if let Some(n) = self.node_mut(to) {
            n.ins.insert(from, merged);
        }
        true
    }

    /// Add a transition, keeping the better weight if one already exists.
    pub fn insert_trans(&mut self, from: NodeIndex, to: NodeIndex, trans: LatticeTransition) -> bool {
        self.insert_trans_merge(from, to, trans, MergePolicy::Max)
    }

    /// Replace the weight of an existing transition.
    pub fn set_trans_weight(&mut self, from: NodeIndex, to: NodeIndex, weight: LogP) -> bool {
        let Some(t) = self.node_mut(from).and_then(|n| n.out.get_mut(&to)) else {
            return false;
        };
        t.weight = weight;
        if let Some(t) = self.node_mut(to).and_then(|n| n.ins.get_mut(&from)) {
            t.weight = weight;
        }
        true
    }

    pub fn remove_trans(&mut self, from: NodeIndex, to: NodeIndex) -> Option<LatticeTransition> {
        let removed = self.node_mut(from).and_then(|n| n.out.remove(&to));
        if let Some(n) = self.node_mut(to) {
            n.ins.remove(&from);
        }
        removed
    }

    /// Remove a node and every transition touching it.
    pub fn remove_node(&mut self, index: NodeIndex) -> Option<LatticeNode> {
        let node = self.nodes.get_mut(index)?.take()?;
        for &succ in node.out.keys() {
            if let Some(n) = self.node_mut(succ) {
                n.ins.remove(&index);
            }
        }
        for &pred in node.ins.keys() {
            if let Some(n) = self.node_mut(pred) {
                n.out.remove(&index);
            }
        }
        Some(node)
    }

    /// Add a copy of `other` (same vocabulary table) and return the index
    /// map from `other`'s nodes to the new ones.
    pub fn append(&mut self, other: &Lattice) -> Result<Vec<Option<NodeIndex>>> {
        if !other.vocab.same_table(&self.vocab) {
            return Err(LatticeError::malformed(
                &self.name,
                format!("cannot combine with {}: different vocabularies", other.name),
            ));
        }
        let mut map = vec![None; other.max_index()];
        for i in other.node_indices() {
            let Some(src) = other.node(i) else { continue };
            let j = self.add_node(src.word);
            if let Some(dst) = self.node_mut(j) {
                dst.flags = src.flags;
                dst.posterior = src.posterior;
                dst.htk = src.htk.clone();
            }
            map[i] = Some(j);
        }
        for i in other.node_indices() {
            for (succ, &t) in other.successors(i) {
                if let (Some(a), Some(b)) = (map[i], map[succ]) {
                    self.insert_trans(a, b, t);
                }
            }
        }
        Ok(map)
    }

    /// Nodes in topological order. Fails on cycles.
    pub fn sort_nodes(&self) -> Result<Vec<NodeIndex>> {
        let mut indegree = vec![0usize; self.max_index()];
        for i in self.node_indices() {
            for (succ, _) in self.successors(i) {
                indegree[succ] += 1;
            }
        }
        let mut queue: VecDeque<NodeIndex> = self.node_indices().filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.num_nodes());
        while let Some(i) = queue.pop_front() {
            order.push(i);
            for (succ, _) in self.successors(i) {
                indegree[succ] -= 1;
                if indegree[succ] == 0 {
                    queue.push_back(succ);
                }
            }
        }
        if order.len() != self.num_nodes() {
            return Err(LatticeError::malformed(&self.name, "lattice contains a cycle"));
        }
        Ok(order)
    }

    /// Nodes reachable from `start` following transitions forward
    /// (`forward`) or backward.
    pub fn reachable(&self, start: NodeIndex, forward: bool) -> Vec<bool> {
        let mut seen = vec![false; self.max_index()];
        if self.node(start).is_none() {
            return seen;
        }
        let mut stack = vec![start];
        seen[start] = true;
        while let Some(i) = stack.pop() {
            let next: Vec<NodeIndex> = if forward {
                self.successors(i).map(|(j, _)| j).collect()
            } else {
                self.predecessors(i).map(|(j, _)| j).collect()
            };
            for j in next {
                if !seen[j] {
                    seen[j] = true;
                    stack.push(j);
                }
            }
        }
        seen
    }

    /// Well-formedness: end points exist without self-loops, and every
    /// node lies on some path from initial to final.
    pub fn check(&self) -> Result<()> {
        for (what, end) in [("initial", self.initial), ("final", self.final_node)] {
            if self.node(end).is_none() {
                return Err(LatticeError::malformed(&self.name, format!("{} node {} missing", what, end)));
            }
            if self.find_trans(end, end).is_some() {
                return Err(LatticeError::malformed(&self.name, format!("self-loop on {} node", what)));
            }
        }
        let from_initial = self.reachable(self.initial, true);
        let to_final = self.reachable(self.final_node, false);
        for i in self.node_indices() {
            if !from_initial[i] {
                return Err(LatticeError::malformed(&self.name, format!("node {} unreachable from initial", i)));
            }
            if !to_final[i] {
                return Err(LatticeError::malformed(&self.name, format!("node {} cannot reach final", i)));
            }
        }
        Ok(())
    }

    /// Drop nodes that lie on no initial-to-final path. Returns how many
    /// were removed.
    pub fn remove_useless_nodes(&mut self) -> usize {
        let from_initial = self.reachable(self.initial, true);
        let to_final = self.reachable(self.final_node, false);
        let useless: Vec<NodeIndex> = self
            .node_indices()
            .filter(|&i| !(from_initial[i] && to_final[i]))
            .collect();
        for &i in &useless {
            self.remove_node(i);
        }
        if !useless.is_empty() {
            tracing::debug!(lattice = %self.name, removed = useless.len(), "removed useless nodes");
        }
        useless.len()
    }

    /// Move every transition of `from` onto `into` and delete `from`.
    /// Incoming transitions that collide combine under `policy`; outgoing
    /// ones keep the better weight.
    pub fn merge_nodes(&mut self, into: NodeIndex, from: NodeIndex, policy: MergePolicy) {
        if into == from {
            return;
        }
        let Some(node) = self.remove_node(from) else { return };
        for (succ, t) in node.out {
            self.insert_trans_merge(into, succ, t, MergePolicy::Max);
        }
        for (pred, t) in node.ins {
            self.insert_trans_merge(pred, into, t, policy);
        }
        if self.initial == from {
            self.initial = into;
        }
        if self.final_node == from {
            self.final_node = into;
        }
    }

    /// Words along a node path without null nodes, non-events or `</s>`.
    pub fn path_words(&self, path: &[NodeIndex]) -> Vec<VocabIndex> {
        let se = self.vocab.se_index();
        path.iter()
            .filter(|&&i| !self.is_non_word(i) && self.word(i) != se)
            .map(|&i| self.word(i))
            .collect()
    }

    /// Rebuild with dense node indices in topological order.
    pub fn compact(&self) -> Result<Lattice> {
        let order = self.sort_nodes()?;
        let mut out = Lattice::empty(self.vocab.clone(), self.name.clone());
        let mut map = vec![0; self.max_index()];
        for (new, &old) in order.iter().enumerate() {
            map[old] = new;
            if let Some(src) = self.node(old) {
                out.ensure_node(new, src.word);
                if let Some(dst) = out.node_mut(new) {
                    dst.flags = src.flags;
                    dst.posterior = src.posterior;
                    dst.htk = src.htk.clone();
                }
            }
        }
        for &old in &order {
            for (succ, &t) in self.successors(old) {
                out.insert_trans(map[old], map[succ], t);
            }
        }
        out.initial = map.get(self.initial).copied().unwrap_or(0);
        out.final_node = map.get(self.final_node).copied().unwrap_or(0);
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use libngram_core::prob::log_of;

    /// `<s> -> {b, c} -> d -> </s>` with the given branch weights.
    pub(crate) fn diamond(vocab: &Vocab, wb: f64, wc: f64) -> Lattice {
        let mut lat = Lattice::empty(vocab.clone(), "diamond");
        let words = ["<s>", "b", "c", "d", "</s>"];
        let ids: Vec<NodeIndex> = words.iter().map(|w| lat.add_node(vocab.add_word(w))).collect();
        lat.set_initial(ids[0]);
        lat.set_final(ids[4]);
        lat.insert_trans(ids[0], ids[1], LatticeTransition::new(log_of(wb)));
        lat.insert_trans(ids[0], ids[2], LatticeTransition::new(log_of(wc)));
        lat.insert_trans(ids[1], ids[3], LatticeTransition::new(LOGP_ONE));
        lat.insert_trans(ids[2], ids[3], LatticeTransition::new(LOGP_ONE));
        lat.insert_trans(ids[3], ids[4], LatticeTransition::new(LOGP_ONE));
        lat
    }

    #[test]
    fn sorts_and_checks() {
        let vocab = Vocab::new();
        let lat = diamond(&vocab, 0.4, 0.6);
        let order = lat.sort_nodes().unwrap();
        assert_eq!(order.first(), Some(&lat.initial()));
        assert_eq!(order.last(), Some(&lat.final_node()));
        lat.check().unwrap();
        assert_eq!(lat.num_transitions(), 5);
    }

    #[test]
    fn detects_cycles_and_dangling_nodes() {
        let vocab = Vocab::new();
        let mut lat = diamond(&vocab, 0.4, 0.6);
        let stray = lat.add_node(vocab.add_word("x"));
        assert!(lat.check().is_err());
        assert_eq!(lat.remove_useless_nodes(), 1);
        assert!(lat.node(stray).is_none());
        lat.check().unwrap();

        lat.insert_trans(3, 1, LatticeTransition::new(LOGP_ONE));
        assert!(lat.sort_nodes().is_err());
    }

    #[test]
    fn merge_policies_combine_weights() {
        let vocab = Vocab::new();
        let mut lat = diamond(&vocab, 0.4, 0.6);
        lat.insert_trans_merge(0, 1, LatticeTransition::new(log_of(0.1)), MergePolicy::Sum);
        assert!((lat.find_trans(0, 1).unwrap().weight - log_of(0.5)).abs() < 1e-12);
        lat.insert_trans(0, 1, LatticeTransition::new(log_of(0.2)));
        assert!((lat.find_trans(0, 1).unwrap().weight - log_of(0.5)).abs() < 1e-12);
    }

    #[test]
    fn merging_nodes_moves_transitions() {
        let vocab = Vocab::new();
        let mut lat = diamond(&vocab, 0.4, 0.6);
        lat.merge_nodes(1, 2, MergePolicy::Sum);
        assert_eq!(lat.num_nodes(), 4);
        assert!((lat.find_trans(0, 1).unwrap().weight - LOGP_ONE).abs() < 1e-12);
        assert_eq!(lat.predecessors(3).count(), 1);
        lat.check().unwrap();
    }

    #[test]
    fn compact_renumbers_in_order() {
        let vocab = Vocab::new();
        let mut lat = diamond(&vocab, 0.4, 0.6);
        lat.remove_node(2);
        let dense = lat.compact().unwrap();
        assert_eq!(dense.max_index(), 4);
        assert_eq!(dense.initial(), 0);
        assert_eq!(dense.final_node(), 3);
        assert_eq!(dense.path_words(&[0, 1, 2, 3]).len(), 2);
    }
}
