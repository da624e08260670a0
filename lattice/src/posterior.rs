// lattice/src/posterior.rs
//
// Forward-backward over the lattice graph, node and transition posteriors,
// and the pruning passes built on them.

use libngram_core::prob::{add_logp, log_of, prob_of};
use libngram_core::{LogP, Prob, LOGP_ONE, LOGP_ZERO};

use crate::deadline::Deadline;
use crate::error::{LatticeError, Result};
use crate::graph::{Lattice, NodeIndex};

/// Forward and backward log masses per node index.
#[derive(Debug, Clone)]
pub struct ForwardBackward {
    pub forward: Vec<LogP>,
    pub backward: Vec<LogP>,
    /// Log mass of all initial-to-final paths.
    pub total: LogP,
    scale: f64,
}

impl ForwardBackward {
    pub fn node_posterior(&self, node: NodeIndex) -> LogP {
        let (a, b) = (self.forward[node], self.backward[node]);
        if a == LOGP_ZERO || b == LOGP_ZERO {
            return LOGP_ZERO;
        }
        a + b - self.total
    }

    pub fn trans_posterior(&self, from: NodeIndex, to: NodeIndex, weight: LogP) -> LogP {
        let (a, b) = (self.forward[from], self.backward[to]);
        if a == LOGP_ZERO || b == LOGP_ZERO || weight == LOGP_ZERO {
            return LOGP_ZERO;
        }
        a + weight / self.scale + b - self.total
    }
}

impl Lattice {
    /// Forward-backward with transition weights divided by `scale`.
    pub fn forward_backward(&self, scale: f64, deadline: &Deadline) -> Result<ForwardBackward> {
        if scale <= 0.0 {
            return Err(LatticeError::Config(format!("posterior scale must be positive, got {}", scale)));
        }
        let order = self.sort_nodes()?;
        let mut forward = vec![LOGP_ZERO; self.max_index()];
        let mut backward = vec![LOGP_ZERO; self.max_index()];
        forward[self.initial()] = LOGP_ONE;
        for &i in &order {
            deadline.check()?;
            if forward[i] == LOGP_ZERO {
                continue;
            }
            for (j, t) in self.successors(i) {
                forward[j] = add_logp(forward[j], forward[i] + t.weight / scale);
            }
        }
        backward[self.final_node()] = LOGP_ONE;
        for &i in order.iter().rev() {
            deadline.check()?;
            for (j, t) in self.successors(i) {
                if backward[j] != LOGP_ZERO {
                    backward[i] = add_logp(backward[i], t.weight / scale + backward[j]);
                }
            }
        }
        let total = forward[self.final_node()];
        if total == LOGP_ZERO {
            return Err(LatticeError::malformed(self.name(), "no path with nonzero probability"));
        }
        Ok(ForwardBackward {
            forward,
            backward,
            total,
            scale,
        })
    }

    /// Store node posteriors on the nodes. Returns the total path mass.
    pub fn compute_posteriors(&mut self, scale: f64, deadline: &Deadline) -> Result<LogP> {
        let fb = self.forward_backward(scale, deadline)?;
        let nodes: Vec<NodeIndex> = self.node_indices().collect();
        for i in nodes {
            let p = fb.node_posterior(i);
            if let Some(node) = self.node_mut(i) {
                node.posterior = p;
            }
        }
        Ok(fb.total)
    }

    /// Remove nodes and transitions whose posterior falls below `threshold`.
    /// In fast mode posteriors are computed once; otherwise the pass repeats
    /// until nothing more falls below the threshold.
    pub fn prune_posteriors(&mut self, threshold: Prob, scale: f64, fast: bool, deadline: &Deadline) -> Result<usize> {
        let min = log_of(threshold);
        let mut removed = 0;
        loop {
            let fb = self.forward_backward(scale, deadline)?;
            let mut round = 0;

            let low_nodes: Vec<NodeIndex> = self
                .node_indices()
                .filter(|&i| i != self.initial() && i != self.final_node())
                .filter(|&i| fb.node_posterior(i) < min)
                .collect();
            for i in low_nodes {
                self.remove_node(i);
                round += 1;
            }

            let low_trans: Vec<(NodeIndex, NodeIndex)> = self
                .node_indices()
                .flat_map(|i| {
                    self.successors(i)
                        .filter(|(j, t)| fb.trans_posterior(i, *j, t.weight) < min)
                        .map(move |(j, _)| (i, j))
                        .collect::<Vec<_>>()
                })
                .collect();
            for (i, j) in low_trans {
                self.remove_trans(i, j);
                round += 1;
            }
            round += self.remove_useless_nodes();
            removed += round;
            deadline.check()?;
            if fast || round == 0 {
                break;
            }
        }
        if self.node(self.initial()).is_none() || self.node(self.final_node()).is_none() {
            return Err(LatticeError::malformed(self.name(), "pruning removed every path"));
        }
        self.compute_posteriors(scale, deadline)?;
        tracing::debug!(lattice = %self.name(), removed, threshold, "posterior pruning");
        Ok(removed)
    }

    /// Prune to at most `max_density` transitions per word of the best path.
    pub fn prune_density(&mut self, max_density: f64, scale: f64, fast: bool, deadline: &Deadline) -> Result<usize> {
        let words = self.best_path(deadline)?.map_or(0, |(path, _)| self.path_words(&path).len());
        let limit = ((max_density * words.max(1) as f64).ceil() as usize).max(1);
        let fb = self.forward_backward(scale, deadline)?;
        let mut posts: Vec<LogP> = self
            .node_indices()
            .flat_map(|i| {
                self.successors(i)
                    .map(|(j, t)| fb.trans_posterior(i, j, t.weight))
                    .collect::<Vec<_>>()
            })
            .collect();
        if posts.len() <= limit {
            return Ok(0);
        }
        posts.sort_by(|a, b| b.total_cmp(a));
        let threshold = prob_of(posts[limit - 1]);
        tracing::debug!(lattice = %self.name(), limit, threshold, "density pruning");
        self.prune_posteriors(threshold * (1.0 - 1e-9), scale, fast, deadline)
    }

    /// Prune to at most `max_nodes` nodes by posterior.
    pub fn prune_nodes(&mut self, max_nodes: usize, scale: f64, fast: bool, deadline: &Deadline) -> Result<usize> {
        if self.num_nodes() <= max_nodes {
            return Ok(0);
        }
        let fb = self.forward_backward(scale, deadline)?;
        let mut posts: Vec<LogP> = self.node_indices().map(|i| fb.node_posterior(i)).collect();
        posts.sort_by(|a, b| b.total_cmp(a));
        let threshold = prob_of(posts[max_nodes.max(1) - 1]);
        tracing::debug!(lattice = %self.name(), max_nodes, threshold, "node-count pruning");
        self.prune_posteriors(threshold * (1.0 - 1e-9), scale, fast, deadline)
    }
}

#[cfg(test)]
mod tests {
    use crate::deadline::Deadline;
    use crate::graph::tests::diamond;
    use libngram_core::prob::{log_of, prob_of};
    use libngram_core::Vocab;

    #[test]
    fn diamond_posteriors() {
        let vocab = Vocab::new();
        let mut lat = diamond(&vocab, 0.2, 0.6);
        let total = lat.compute_posteriors(1.0, &Deadline::none()).unwrap();
        assert!((total - log_of(0.8)).abs() < 1e-12);
        assert!((prob_of(lat.node(1).unwrap().posterior) - 0.25).abs() < 1e-9);
        assert!((prob_of(lat.node(2).unwrap().posterior) - 0.75).abs() < 1e-9);
        assert!((prob_of(lat.node(3).unwrap().posterior) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn scale_flattens_posteriors() {
        let vocab = Vocab::new();
        let lat = diamond(&vocab, 0.2, 0.8);
        let fb = lat.forward_backward(2.0, &Deadline::none()).unwrap();
        // sqrt(0.2) / (sqrt(0.2) + sqrt(0.8)) = 1/3
        assert!((prob_of(fb.node_posterior(1)) - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn pruning_drops_unlikely_branch() {
        let vocab = Vocab::new();
        let mut lat = diamond(&vocab, 0.05, 0.95);
        let removed = lat.prune_posteriors(0.1, 1.0, false, &Deadline::none()).unwrap();
        assert!(removed >= 1);
        assert!(lat.node(1).is_none());
        lat.check().unwrap();
        assert!((prob_of(lat.node(2).unwrap().posterior) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn node_count_pruning_respects_the_limit() {
        let vocab = Vocab::new();
        let mut lat = diamond(&vocab, 0.3, 0.7);
        lat.prune_nodes(4, 1.0, false, &Deadline::none()).unwrap();
        assert_eq!(lat.num_nodes(), 4);
        assert!(lat.node(2).is_some());
    }
}
