// lattice/src/reduce.rs
//
// Node merging. Same-word siblings are merged when they share their
// predecessors (forward pass) or their successors (backward pass), either
// exactly or up to an overlap ratio.

use std::collections::BTreeSet;

use ahash::AHashMap;
use libngram_core::VocabIndex;

use crate::deadline::Deadline;
use crate::error::Result;
use crate::graph::{Lattice, MergePolicy, NodeIndex};

fn overlap(a: &BTreeSet<NodeIndex>, b: &BTreeSet<NodeIndex>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

impl Lattice {
    fn neighbor_set(&self, node: NodeIndex, forward: bool) -> BTreeSet<NodeIndex> {
        if forward {
            self.predecessors(node).map(|(j, _)| j).collect()
        } else {
            self.successors(node).map(|(j, _)| j).collect()
        }
    }

    fn mergeable(&self, a: NodeIndex, b: NodeIndex, forward: bool, ratio: f64) -> bool {
        let (sa, sb) = (self.neighbor_set(a, forward), self.neighbor_set(b, forward));
        if ratio <= 0.0 {
            return sa == sb;
        }
        if overlap(&sa, &sb) < ratio {
            return false;
        }
        // inexact merges must not close a cycle
        !self.reachable(a, true)[b] && !self.reachable(b, true)[a]
    }

    fn merge_pass(&mut self, forward: bool, ratio: f64, policy: MergePolicy, deadline: &Deadline) -> Result<usize> {
        let mut order = self.sort_nodes()?;
        if !forward {
            order.reverse();
        }
        let mut merged = 0;
        for i in order {
            deadline.check()?;
            if self.node(i).is_none() {
                continue;
            }
            let neighbors: Vec<NodeIndex> = if forward {
                self.successors(i).map(|(j, _)| j).collect()
            } else {
                self.predecessors(i).map(|(j, _)| j).collect()
            };
            let mut groups: AHashMap<VocabIndex, Vec<NodeIndex>> = AHashMap::new();
            for n in neighbors {
                if n != self.initial() && n != self.final_node() {
                    groups.entry(self.word(n)).or_default().push(n);
                }
            }
            let mut groups: Vec<Vec<NodeIndex>> = groups.into_values().filter(|g| g.len() > 1).collect();
            groups.sort();
            for group in groups {
                let mut kept: Vec<NodeIndex> = Vec::new();
                for n in group {
                    if self.node(n).is_none() {
                        continue;
                    }
                    match kept.iter().copied().find(|&k| self.mergeable(k, n, forward, ratio)) {
                        Some(k) => {
                            self.merge_nodes(k, n, policy);
                            merged += 1;
                        }
                        None => kept.push(n),
                    }
                }
            }
        }
        Ok(merged)
    }

    /// Merge redundant nodes until nothing changes or `max_iterations`
    /// rounds have run. `overlap_ratio` 0 requires identical neighbor sets;
    /// otherwise neighbor sets must overlap (intersection over union) by at
    /// least that much. Returns the number of merged nodes.
    pub fn reduce(
        &mut self,
        overlap_ratio: f64,
        policy: MergePolicy,
        max_iterations: usize,
        deadline: &Deadline,
    ) -> Result<usize> {
        let before = self.num_nodes();
        let mut total = 0;
        for round in 0..max_iterations.max(1) {
            let merged = self.merge_pass(true, overlap_ratio, policy, deadline)?
                + self.merge_pass(false, overlap_ratio, policy, deadline)?;
            tracing::trace!(lattice = %self.name(), round, merged, "reduction round");
            total += merged;
            if merged == 0 {
                break;
            }
        }
        tracing::debug!(
            lattice = %self.name(),
            before,
            after = self.num_nodes(),
            "reduced lattice"
        );
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use crate::deadline::Deadline;
    use crate::graph::{Lattice, LatticeTransition, MergePolicy};
    use libngram_core::prob::log_of;
    use libngram_core::{Vocab, LOGP_ONE};

    fn t(p: f64) -> LatticeTransition {
        LatticeTransition::new(log_of(p))
    }

    #[test]
    fn merges_same_word_siblings_forward() {
        let vocab = Vocab::new();
        let a = vocab.add_word("a");
        let b = vocab.add_word("b");
        let mut lat = Lattice::new(vocab.clone(), "fw");
        let (s, e) = (lat.initial(), lat.final_node());
        let a1 = lat.add_node(a);
        let a2 = lat.add_node(a);
        let b1 = lat.add_node(b);
        lat.insert_trans(s, a1, t(0.3));
        lat.insert_trans(s, a2, t(0.7));
        lat.insert_trans(a1, b1, t(1.0));
        lat.insert_trans(a2, b1, t(1.0));
        lat.insert_trans(b1, e, t(1.0));

        let merged = lat.reduce(0.0, MergePolicy::Sum, 5, &Deadline::none()).unwrap();
        assert_eq!(merged, 1);
        assert_eq!(lat.num_nodes(), 4);
        let (only, tr) = lat.successors(s).next().map(|(j, tr)| (j, *tr)).unwrap();
        assert_eq!(lat.word(only), a);
        assert!((tr.weight - LOGP_ONE).abs() < 1e-12);
        lat.check().unwrap();
    }

    #[test]
    fn merges_shared_successors_backward() {
        let vocab = Vocab::new();
        let [x, y, b] = ["x", "y", "b"].map(|w| vocab.add_word(w));
        let mut lat = Lattice::new(vocab.clone(), "bw");
        let (s, e) = (lat.initial(), lat.final_node());
        let (nx, ny) = (lat.add_node(x), lat.add_node(y));
        let (b1, b2) = (lat.add_node(b), lat.add_node(b));
        lat.insert_trans(s, nx, t(0.5));
        lat.insert_trans(s, ny, t(0.5));
        lat.insert_trans(nx, b1, t(1.0));
        lat.insert_trans(ny, b2, t(1.0));
        lat.insert_trans(b1, e, t(1.0));
        lat.insert_trans(b2, e, t(1.0));

        assert_eq!(lat.reduce(0.0, MergePolicy::Max, 5, &Deadline::none()).unwrap(), 1);
        assert_eq!(lat.num_nodes(), 5);
        lat.check().unwrap();
    }

    #[test]
    fn overlap_ratio_controls_inexact_merges() {
        let vocab = Vocab::new();
        let [p, q, a, c, d] = ["p", "q", "a", "c", "d"].map(|w| vocab.add_word(w));
        let build = || {
            let mut lat = Lattice::new(vocab.clone(), "approx");
            let (s, e) = (lat.initial(), lat.final_node());
            let (np, nq) = (lat.add_node(p), lat.add_node(q));
            let (a1, a2) = (lat.add_node(a), lat.add_node(a));
            let (nc, nd) = (lat.add_node(c), lat.add_node(d));
            lat.insert_trans(s, np, t(0.5));
            lat.insert_trans(s, nq, t(0.5));
            // a1 follows p and q, a2 follows p only
            lat.insert_trans(np, a1, t(0.5));
            lat.insert_trans(nq, a1, t(1.0));
            lat.insert_trans(np, a2, t(0.5));
            lat.insert_trans(a1, nc, t(1.0));
            lat.insert_trans(a2, nd, t(1.0));
            lat.insert_trans(nc, e, t(1.0));
            lat.insert_trans(nd, e, t(1.0));
            lat
        };
        let mut strict = build();
        strict.reduce(0.6, MergePolicy::Max, 5, &Deadline::none()).unwrap();
        assert_eq!(strict.num_nodes(), 8);
        let mut loose = build();
        loose.reduce(0.5, MergePolicy::Max, 5, &Deadline::none()).unwrap();
        assert_eq!(loose.num_nodes(), 7);
        loose.check().unwrap();
    }
}
