//! Time-sliced dynamic programming over an arbitrary hashable state type.
//!
//! Slice `t` maps every state reached after `t` steps to its forward
//! (summed) log probability, its best-path hypotheses with backpointers,
//! and, once a backward sweep has run, its backward log probability. A
//! state only exists in a slice if some transition reached it; updating
//! from a missing predecessor is a no-op.
//!
//! ```
//! use libngram_core::trellis::Trellis;
//! use libngram_core::prob::{log_of, prob_of};
//!
//! let mut t: Trellis<char> = Trellis::new(1);
//! t.init();
//! t.set_prob('a', 0.0);
//! t.step();
//! t.update(&'a', 'a', log_of(0.4));
//! t.update(&'a', 'b', log_of(0.6));
//! assert!((prob_of(t.sum_logp(1)) - 1.0).abs() < 1e-12);
//! assert_eq!(t.viterbi(None), Some(vec!['a', 'b']));
//! ```
use ahash::AHashMap;
use std::hash::Hash;

use crate::prob::{add_logp, LogP, LOGP_ZERO};

#[derive(Debug, Clone)]
struct Hyp<S> {
    score: LogP,
    /// Predecessor state and the rank of the hypothesis it extends.
    prev: Option<(S, usize)>,
}

#[derive(Debug, Clone)]
struct TrellisNode<S> {
    forward: LogP,
    backward: LogP,
    /// Best hypotheses, highest score first.
    hyps: Vec<Hyp<S>>,
}

impl<S> TrellisNode<S> {
    fn empty() -> Self {
        Self {
            forward: LOGP_ZERO,
            backward: LOGP_ZERO,
            hyps: Vec::new(),
        }
    }
}

fn insert_hyp<S>(hyps: &mut Vec<Hyp<S>>, hyp: Hyp<S>, keep: usize) {
    let pos = hyps.partition_point(|h| h.score >= hyp.score);
    if pos >= keep {
        return;
    }
    hyps.insert(pos, hyp);
    hyps.truncate(keep);
}

#[derive(Debug, Clone)]
pub struct Trellis<S: Hash + Eq + Clone> {
    slices: Vec<AHashMap<S, TrellisNode<S>>>,
    back_time: usize,
    nbest: usize,
}

impl<S: Hash + Eq + Clone> Trellis<S> {
    /// `nbest` hypotheses are kept per state (1 for plain Viterbi).
    pub fn new(nbest: usize) -> Self {
        Self {
            slices: vec![AHashMap::new()],
            back_time: 0,
            nbest: nbest.max(1),
        }
    }

    /// Reset to a single empty slice at time 0.
    pub fn init(&mut self) {
        self.slices.truncate(1);
        self.slices[0].clear();
        self.back_time = 0;
    }

    /// Start a new empty slice.
    pub fn step(&mut self) {
        self.slices.push(AHashMap::new());
    }

    /// Current time index.
    pub fn time(&self) -> usize {
        self.slices.len() - 1
    }

    /// Drop every slice after `time`, making it current again.
    pub fn rewind(&mut self, time: usize) {
        self.slices.truncate(time + 1);
        for node in self.slices[time].values_mut() {
            node.backward = LOGP_ZERO;
        }
    }

    /// Seed `state` in the current slice, replacing anything stored for it.
    pub fn set_prob(&mut self, state: S, logp: LogP) {
        let t = self.time();
        self.slices[t].insert(
            state,
            TrellisNode {
                forward: logp,
                backward: LOGP_ZERO,
                hyps: vec![Hyp { score: logp, prev: None }],
            },
        );
    }

    /// Extend every path ending in `old` (previous slice) to `new` (current
    /// slice) with transition probability `trans`.
    pub fn update(&mut self, old: &S, new: S, trans: LogP) {
        let t = self.time();
        if t == 0 || trans == LOGP_ZERO {
            return;
        }
        let (before, after) = self.slices.split_at_mut(t);
        let Some(prev) = before[t - 1].get(old) else {
            return;
        };
        let node = after[0].entry(new).or_insert_with(TrellisNode::empty);
        node.forward = add_logp(node.forward, prev.forward + trans);
        for (rank, h) in prev.hyps.iter().enumerate() {
            insert_hyp(
                &mut node.hyps,
                Hyp {
                    score: h.score + trans,
                    prev: Some((old.clone(), rank)),
                },
                self.nbest,
            );
        }
    }

    pub fn states(&self, time: usize) -> impl Iterator<Item = &S> + '_ {
        self.slices.get(time).into_iter().flat_map(|s| s.keys())
    }

    pub fn num_states(&self, time: usize) -> usize {
        self.slices.get(time).map_or(0, |s| s.len())
    }

    pub fn contains(&self, state: &S, time: usize) -> bool {
        self.slices.get(time).is_some_and(|s| s.contains_key(state))
    }

    /// Forward log probability of `state` at `time`.
    pub fn get_logp(&self, state: &S, time: usize) -> LogP {
        self.node(state, time).map_or(LOGP_ZERO, |n| n.forward)
    }

    /// Best-path log probability of `state` at `time`.
    pub fn get_max_logp(&self, state: &S, time: usize) -> LogP {
        self.node(state, time)
            .and_then(|n| n.hyps.first())
            .map_or(LOGP_ZERO, |h| h.score)
    }

    fn node(&self, state: &S, time: usize) -> Option<&TrellisNode<S>> {
        self.slices.get(time)?.get(state)
    }

    /// Total forward mass at `time`.
    pub fn sum_logp(&self, time: usize) -> LogP {
        self.slices
            .get(time)
            .map_or(LOGP_ZERO, |s| s.values().fold(LOGP_ZERO, |acc, n| add_logp(acc, n.forward)))
    }

    /// Best single path score at `time`.
    pub fn max_logp(&self, time: usize) -> LogP {
        self.best_state(time).map_or(LOGP_ZERO, |s| self.get_max_logp(s, time))
    }

    fn best_state(&self, time: usize) -> Option<&S> {
        self.slices
            .get(time)?
            .iter()
            .filter_map(|(s, n)| n.hyps.first().map(|h| (s, h.score)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(s, _)| s)
    }

    fn backtrace(&self, end: &S, rank: usize) -> Option<Vec<S>> {
        let mut time = self.time();
        let mut path = Vec::with_capacity(time + 1);
        let mut state = end.clone();
        let mut rank = rank;
        loop {
            let hyp = self.node(&state, time)?.hyps.get(rank)?;
            let prev = hyp.prev.clone();
            path.push(state);
            match prev {
                Some((p, r)) if time > 0 => {
                    state = p;
                    rank = r;
                    time -= 1;
                }
                None if time == 0 => break,
                _ => return None,
            }
        }
        path.reverse();
        Some(path)
    }

    /// Best state sequence from time 0 to the current time, ending in `end`
    /// or in the best final state. `None` when no complete path exists.
    pub fn viterbi(&self, end: Option<&S>) -> Option<Vec<S>> {
        let end = match end {
            Some(s) => s.clone(),
            None => self.best_state(self.time())?.clone(),
        };
        self.backtrace(&end, 0)
    }

    /// Up to `n` best complete paths with their scores, best first. Only as
    /// many as the trellis keeps per state can be recovered through any
    /// single state.
    pub fn nbest_viterbi(&self, n: usize, end: Option<&S>) -> Vec<(LogP, Vec<S>)> {
        let t = self.time();
        let mut finals: Vec<(LogP, S, usize)> = Vec::new();
        for (state, node) in &self.slices[t] {
            if end.is_some_and(|e| e != state) {
                continue;
            }
            for (rank, h) in node.hyps.iter().enumerate() {
                finals.push((h.score, state.clone(), rank));
            }
        }
        finals.sort_by(|a, b| b.0.total_cmp(&a.0));
        finals
            .into_iter()
            .filter_map(|(score, state, rank)| self.backtrace(&state, rank).map(|p| (score, p)))
            .take(n)
            .collect()
    }

    // ---- backward sweep ------------------------------------------------

    /// Start the backward sweep at `time` (normally the current time).
    pub fn init_back(&mut self, time: usize) {
        self.back_time = time.min(self.time());
        for slice in &mut self.slices[..=self.back_time] {
            for node in slice.values_mut() {
                node.backward = LOGP_ZERO;
            }
        }
    }

    pub fn back_time(&self) -> usize {
        self.back_time
    }

    /// Seed the backward probability of `state` at the backward time.
    pub fn set_back_prob(&mut self, state: &S, logp: LogP) {
        if let Some(node) = self.slices[self.back_time].get_mut(state) {
            node.backward = logp;
        }
    }

    /// Move the backward sweep one slice earlier.
    pub fn step_back(&mut self) {
        self.back_time = self.back_time.saturating_sub(1);
    }

    /// `backward(state, t) += trans + backward(next, t + 1)`, where `t` is
    /// the backward time. No-op unless both states were reached forward.
    pub fn update_back(&mut self, state: &S, next: &S, trans: LogP) {
        let t = self.back_time;
        if t + 1 >= self.slices.len() || trans == LOGP_ZERO {
            return;
        }
        let (before, after) = self.slices.split_at_mut(t + 1);
        let Some(next_node) = after[0].get(next) else {
            return;
        };
        if let Some(node) = before[t].get_mut(state) {
            node.backward = add_logp(node.backward, trans + next_node.backward);
        }
    }

    pub fn get_back_logp(&self, state: &S, time: usize) -> LogP {
        self.node(state, time).map_or(LOGP_ZERO, |n| n.backward)
    }

    /// Total mass through slice `time`; equal at every time after a full
    /// forward-backward run.
    pub fn total_logp(&self, time: usize) -> LogP {
        self.slices.get(time).map_or(LOGP_ZERO, |s| {
            s.values()
                .fold(LOGP_ZERO, |acc, n| add_logp(acc, n.forward + n.backward))
        })
    }

    /// Posterior log probability of being in `state` at `time`.
    pub fn posterior(&self, state: &S, time: usize) -> LogP {
        let total = self.total_logp(time);
        match self.node(state, time) {
            Some(n) if total != LOGP_ZERO => n.forward + n.backward - total,
            _ => LOGP_ZERO,
        }
    }
}
