// lattice/src/edit.rs
//
// Structural edits: optional pauses between words, null-node removal,
// multiword splitting, and sequential or parallel combination of lattices.

use libngram_core::{LogP, VocabIndex, LOGP_ONE, VOCAB_NONE};

use crate::error::{LatticeError, Result};
use crate::graph::{Lattice, LatticeTransition, MergePolicy, NodeIndex, TRANS_PAUSE};

impl Lattice {
    /// Make a pause optional after every word node. Each word gets one
    /// pause node that leads to all of its successors.
    pub fn insert_pauses(&mut self, pause_weight: LogP) -> usize {
        let pause = self.vocab().pause_index();
        let words: Vec<NodeIndex> = self
            .node_indices()
            .filter(|&i| i != self.final_node() && !self.is_null(i) && self.word(i) != pause)
            .collect();
        let mut added = 0;
        for i in words {
            let succs: Vec<(NodeIndex, LatticeTransition)> = self
                .successors(i)
                .filter(|&(j, _)| self.word(j) != pause)
                .map(|(j, &t)| (j, t))
                .collect();
            if succs.is_empty() {
                continue;
            }
            let p = self.add_node(pause);
            self.insert_trans(i, p, LatticeTransition::with_flags(pause_weight, TRANS_PAUSE));
            for (j, t) in succs {
                self.insert_trans(p, j, t);
            }
            added += 1;
        }
        tracing::debug!(lattice = %self.name(), added, "inserted pauses");
        added
    }

    /// Turn pause nodes into null nodes and remove them.
    pub fn remove_pauses(&mut self) -> usize {
        let pause = self.vocab().pause_index();
        let pauses: Vec<NodeIndex> = self.node_indices().filter(|&i| self.word(i) == pause).collect();
        for &i in &pauses {
            if let Some(node) = self.node_mut(i) {
                node.word = VOCAB_NONE;
            }
        }
        self.remove_null_nodes()
    }

    /// Bypass and delete null nodes other than the end points. Each
    /// predecessor is joined to each successor with the product of the two
    /// weights; parallel paths merge under `MergePolicy::Sum`.
    pub fn remove_null_nodes(&mut self) -> usize {
        let nulls: Vec<NodeIndex> = self
            .node_indices()
            .filter(|&i| self.is_null(i) && i != self.initial() && i != self.final_node())
            .collect();
        let mut removed = 0;
        for i in nulls {
            let preds: Vec<(NodeIndex, LatticeTransition)> = self.predecessors(i).map(|(j, &t)| (j, t)).collect();
            let succs: Vec<(NodeIndex, LatticeTransition)> = self.successors(i).map(|(j, &t)| (j, t)).collect();
            if preds.iter().any(|&(p, _)| p == i) {
                continue;
            }
            self.remove_node(i);
            for &(p, tp) in &preds {
                for &(s, ts) in &succs {
                    let t = LatticeTransition::with_flags(tp.weight + ts.weight, tp.flags | ts.flags);
                    self.insert_trans_merge(p, s, t, MergePolicy::Sum);
                }
            }
            removed += 1;
        }
        tracing::debug!(lattice = %self.name(), removed, "removed null nodes");
        removed
    }

    /// Replace nodes labelled with multiwords (`a_b_c`) by chains of their
    /// components. The chain's first node keeps the incoming weights.
    pub fn split_multiwords(&mut self, delim: char) -> usize {
        let vocab = self.vocab().clone();
        let multi: Vec<NodeIndex> = self
            .node_indices()
            .filter(|&i| !self.is_null(i) && vocab.is_multiword(self.word(i), delim))
            .collect();
        for &i in &multi {
            let parts: Vec<VocabIndex> = vocab.split_multiword(self.word(i), delim);
            let Some((&first, rest)) = parts.split_first() else { continue };
            let succs: Vec<(NodeIndex, LatticeTransition)> = self.successors(i).map(|(j, &t)| (j, t)).collect();
            for &(j, _) in &succs {
                self.remove_trans(i, j);
            }
            if let Some(node) = self.node_mut(i) {
                node.word = first;
            }
            let mut last = i;
            for &w in rest {
                let next = self.add_node(w);
                self.insert_trans(last, next, LatticeTransition::new(LOGP_ONE));
                last = next;
            }
            for (j, t) in succs {
                self.insert_trans(last, j, t);
            }
            if self.final_node() == i {
                self.set_final(last);
            }
        }
        multi.len()
    }

    /// Append `other` after this lattice: the old final node is joined to
    /// the copy of `other`'s initial node.
    pub fn concat(&mut self, other: &Lattice) -> Result<()> {
        let old_final = self.final_node();
        let map = self.append(other)?;
        let (Some(start), Some(end)) = (map[other.initial()], map[other.final_node()]) else {
            return Err(LatticeError::malformed(other.name(), "missing end points"));
        };
        self.insert_trans(old_final, start, LatticeTransition::new(LOGP_ONE));
        self.set_final(end);
        Ok(())
    }

    /// Put `other` in parallel with this lattice under new null end points.
    pub fn union(&mut self, other: &Lattice) -> Result<()> {
        let (old_initial, old_final) = (self.initial(), self.final_node());
        let map = self.append(other)?;
        let (Some(start), Some(end)) = (map[other.initial()], map[other.final_node()]) else {
            return Err(LatticeError::malformed(other.name(), "missing end points"));
        };
        let initial = self.add_node(VOCAB_NONE);
        let final_node = self.add_node(VOCAB_NONE);
        for s in [old_initial, start] {
            self.insert_trans(initial, s, LatticeTransition::new(LOGP_ONE));
        }
        for e in [old_final, end] {
            self.insert_trans(e, final_node, LatticeTransition::new(LOGP_ONE));
        }
        self.set_initial(initial);
        self.set_final(final_node);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::tests::diamond;
    use crate::graph::{Lattice, LatticeTransition};
    use libngram_core::prob::log_of;
    use libngram_core::{Vocab, LOGP_ONE, VOCAB_NONE};

    #[test]
    fn pauses_are_optional_and_removable() {
        let vocab = Vocab::new();
        let mut lat = diamond(&vocab, 0.4, 0.6);
        let before = lat.num_transitions();
        let added = lat.insert_pauses(log_of(0.1));
        assert_eq!(added, 4);
        lat.check().unwrap();
        assert!(lat.node_indices().any(|i| lat.is_pause(i)));

        assert_eq!(lat.remove_pauses(), 4);
        assert!(!lat.node_indices().any(|i| lat.is_pause(i)));
        assert_eq!(lat.num_transitions(), before);
        // the bypass merged with the direct transition
        let w = lat.find_trans(1, 3).unwrap().weight;
        assert!((w - log_of(1.1)).abs() < 1e-9);
    }

    #[test]
    fn null_nodes_are_bridged() {
        let vocab = Vocab::new();
        let mut lat = Lattice::new(vocab.clone(), "nulls");
        let a = lat.add_node(vocab.add_word("a"));
        let mid = lat.add_node(VOCAB_NONE);
        let b = lat.add_node(vocab.add_word("b"));
        lat.insert_trans(lat.initial(), a, LatticeTransition::new(LOGP_ONE));
        lat.insert_trans(a, mid, LatticeTransition::new(log_of(0.5)));
        lat.insert_trans(mid, b, LatticeTransition::new(log_of(0.5)));
        lat.insert_trans(b, lat.final_node(), LatticeTransition::new(LOGP_ONE));
        assert_eq!(lat.remove_null_nodes(), 1);
        assert!((lat.find_trans(a, b).unwrap().weight - log_of(0.25)).abs() < 1e-12);
        lat.check().unwrap();
    }

    #[test]
    fn multiwords_become_chains() {
        let vocab = Vocab::new();
        let mut lat = Lattice::new(vocab.clone(), "multi");
        let ab = lat.add_node(vocab.add_word("a_b"));
        lat.insert_trans(lat.initial(), ab, LatticeTransition::new(LOGP_ONE));
        lat.insert_trans(ab, lat.final_node(), LatticeTransition::new(log_of(0.3)));
        assert_eq!(lat.split_multiwords('_'), 1);
        let order = lat.sort_nodes().unwrap();
        assert_eq!(vocab.words_of(&lat.path_words(&order)), vec!["a", "b"]);
        lat.check().unwrap();
    }

    #[test]
    fn concat_and_union() {
        let vocab = Vocab::new();
        let mut lat = diamond(&vocab, 0.4, 0.6);
        let other = diamond(&vocab, 0.5, 0.5);
        let nodes = lat.num_nodes();
        lat.concat(&other).unwrap();
        assert_eq!(lat.num_nodes(), 2 * nodes);
        lat.check().unwrap();

        let mut par = diamond(&vocab, 0.4, 0.6);
        par.union(&other).unwrap();
        assert_eq!(par.num_nodes(), 2 * nodes + 2);
        assert_eq!(par.successors(par.initial()).count(), 2);
        par.check().unwrap();

        let foreign = diamond(&Vocab::new(), 0.5, 0.5);
        assert!(par.union(&foreign).is_err());
    }
}
