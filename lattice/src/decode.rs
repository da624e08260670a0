// lattice/src/decode.rs
//
// Search over the lattice graph:
//
// - `best_path`: Viterbi over transition weights alone
// - `decode_1best`: Viterbi over (node, LM context) states scored on the
//   fly against a language model, with a beam and a per-node state limit
// - `decode_nbest`: A* over the same state space; the heuristic is the best
//   weight-plus-penalty completion, which bounds any LM-rescored completion
//   from above, so hypotheses come out best first
// - `compute_nbest_viterbi`: k-best lists per node over weights alone

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ahash::{AHashMap, AHashSet};
use libngram_core::{LanguageModel, LogP, VocabIndex, LOGP_ONE, LOGP_ZERO};

use crate::deadline::Deadline;
use crate::error::Result;
use crate::graph::{Lattice, NodeIndex};
use crate::nbest::{NBestHyp, NBestList};

/// Scoring and search limits for LM-based decoding.
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    pub lm_weight: f64,
    pub word_penalty: f64,
    /// Drop states more than this many log units below the best state at
    /// the same node.
    pub beam: Option<f64>,
    /// Keep at most this many states per node (0: unlimited).
    pub max_degree: usize,
    /// Allow hypotheses with identical word strings in N-best output.
    pub nbest_duplicates: bool,
    /// Give up after extending this many partial hypotheses.
    pub max_hyps: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            lm_weight: 1.0,
            word_penalty: 0.0,
            beam: None,
            max_degree: 0,
            nbest_duplicates: false,
            max_hyps: 100_000,
        }
    }
}

/// Backpointer chain shared by partial hypotheses.
#[derive(Debug, Clone, Copy)]
struct Trace {
    node: NodeIndex,
    prev: Option<usize>,
}

fn trace_nodes(traces: &[Trace], mut at: Option<usize>) -> Vec<NodeIndex> {
    let mut nodes = Vec::new();
    while let Some(i) = at {
        nodes.push(traces[i].node);
        at = traces[i].prev;
    }
    nodes.reverse();
    nodes
}

/// Outcome of entering a node from an LM state.
struct Step {
    lm: LogP,
    words: usize,
    context: Vec<VocabIndex>,
    ended: bool,
}

struct Scorer<'a> {
    lat: &'a Lattice,
    lm: &'a dyn LanguageModel,
    opts: &'a DecodeOptions,
}

impl Scorer<'_> {
    fn truncate(&self, mut context: Vec<VocabIndex>) -> Vec<VocabIndex> {
        let used = self.lm.context_id(None, &context).length;
        context.truncate(used);
        context
    }

    fn initial_context(&self) -> Vec<VocabIndex> {
        self.truncate(vec![self.lat.vocab().ss_index()])
    }

    /// Score entering `node`; `None` when the LM rules the word out.
    fn enter(&self, node: NodeIndex, context: &[VocabIndex], ended: bool) -> Option<Step> {
        let se = self.lat.vocab().se_index();
        let word = self.lat.word(node);
        if self.lat.is_non_word(node) || (ended && word == se) {
            return Some(Step {
                lm: LOGP_ONE,
                words: 0,
                context: context.to_vec(),
                ended,
            });
        }
        let p = self.lm.word_prob(word, context);
        if p == LOGP_ZERO {
            return None;
        }
        let mut next = Vec::with_capacity(context.len() + 1);
        next.push(word);
        next.extend_from_slice(context);
        Some(Step {
            lm: p,
            words: usize::from(word != se),
            context: self.truncate(next),
            ended: ended || word == se,
        })
    }

    /// LM score for ending the sentence, if `</s>` was not seen yet.
    fn finish(&self, context: &[VocabIndex], ended: bool) -> Option<LogP> {
        if ended {
            return Some(LOGP_ONE);
        }
        let p = self.lm.word_prob(self.lat.vocab().se_index(), context);
        (p != LOGP_ZERO).then_some(p)
    }

    fn total(&self, acoustic: LogP, lm: LogP, words: usize) -> LogP {
        acoustic + self.opts.lm_weight * lm + self.opts.word_penalty * words as f64
    }
}

#[derive(Debug, Clone)]
struct Viterbi {
    acoustic: LogP,
    lm: LogP,
    words: usize,
    trace: usize,
}

impl Lattice {
    /// Highest-weight initial-to-final path and its weight.
    pub fn best_path(&self, deadline: &Deadline) -> Result<Option<(Vec<NodeIndex>, LogP)>> {
        let order = self.sort_nodes()?;
        let mut score = vec![LOGP_ZERO; self.max_index()];
        let mut back: Vec<Option<NodeIndex>> = vec![None; self.max_index()];
        score[self.initial()] = LOGP_ONE;
        for &i in &order {
            deadline.check()?;
            if score[i] == LOGP_ZERO {
                continue;
            }
            for (j, t) in self.successors(i) {
                let s = score[i] + t.weight;
                if s > score[j] {
                    score[j] = s;
                    back[j] = Some(i);
                }
            }
        }
        if score[self.final_node()] == LOGP_ZERO {
            return Ok(None);
        }
        let mut path = vec![self.final_node()];
        let mut at = self.final_node();
        while let Some(prev) = back[at] {
            path.push(prev);
            at = prev;
        }
        path.reverse();
        Ok(Some((path, score[self.final_node()])))
    }

    /// Best hypothesis under lattice weights combined with `lm`.
    pub fn decode_1best(
        &self,
        lm: &dyn LanguageModel,
        opts: &DecodeOptions,
        deadline: &Deadline,
    ) -> Result<Option<NBestHyp>> {
        let scorer = Scorer { lat: self, lm, opts };
        let order = self.sort_nodes()?;
        let mut traces: Vec<Trace> = Vec::new();
        let mut states: Vec<AHashMap<(Vec<VocabIndex>, bool), Viterbi>> =
            (0..self.max_index()).map(|_| AHashMap::new()).collect();

        traces.push(Trace {
            node: self.initial(),
            prev: None,
        });
        states[self.initial()].insert(
            (scorer.initial_context(), false),
            Viterbi {
                acoustic: LOGP_ONE,
                lm: LOGP_ONE,
                words: 0,
                trace: 0,
            },
        );

        for &i in &order {
            deadline.check()?;
            let mut here: Vec<((Vec<VocabIndex>, bool), Viterbi)> = std::mem::take(&mut states[i]).into_iter().collect();
            here.sort_by(|a, b| {
                scorer
                    .total(b.1.acoustic, b.1.lm, b.1.words)
                    .total_cmp(&scorer.total(a.1.acoustic, a.1.lm, a.1.words))
            });
            if let (Some(beam), Some(best)) = (opts.beam, here.first()) {
                let floor = scorer.total(best.1.acoustic, best.1.lm, best.1.words) - beam;
                here.retain(|(_, v)| scorer.total(v.acoustic, v.lm, v.words) >= floor);
            }
            if opts.max_degree > 0 {
                here.truncate(opts.max_degree);
            }
            if i == self.final_node() {
                states[i] = here.into_iter().collect();
                continue;
            }
            for ((context, ended), v) in &here {
                for (j, t) in self.successors(i) {
                    if t.weight == LOGP_ZERO {
                        continue;
                    }
                    let Some(step) = scorer.enter(j, context, *ended) else { continue };
                    let cand = Viterbi {
                        acoustic: v.acoustic + t.weight,
                        lm: v.lm + step.lm,
                        words: v.words + step.words,
                        trace: 0,
                    };
                    let key = (step.context, step.ended);
                    let better = states[j].get(&key).is_none_or(|old| {
                        scorer.total(cand.acoustic, cand.lm, cand.words) > scorer.total(old.acoustic, old.lm, old.words)
                    });
                    if better {
                        traces.push(Trace {
                            node: j,
                            prev: Some(v.trace),
                        });
                        states[j].insert(key, Viterbi { trace: traces.len() - 1, ..cand });
                    }
                }
            }
        }

        let mut best: Option<(LogP, Viterbi, LogP)> = None;
        for ((context, ended), v) in &states[self.final_node()] {
            let Some(end) = scorer.finish(context, *ended) else { continue };
            let total = scorer.total(v.acoustic, v.lm + end, v.words);
            if best.as_ref().is_none_or(|(s, _, _)| total > *s) {
                best = Some((total, v.clone(), end));
            }
        }
        Ok(best.map(|(total, v, end)| {
            let nodes = trace_nodes(&traces, Some(v.trace));
            NBestHyp {
                words: self.path_words(&nodes),
                acoustic: v.acoustic,
                lm: v.lm + end,
                num_words: v.words,
                total,
                posterior: 0.0,
            }
        }))
    }

    /// Upper bound on the weight-plus-penalty score from each node to the
    /// final node.
    fn completion_bounds(&self, word_penalty: f64, order: &[NodeIndex]) -> Vec<LogP> {
        let se = self.vocab().se_index();
        let mut bound = vec![LOGP_ZERO; self.max_index()];
        bound[self.final_node()] = LOGP_ONE;
        for &i in order.iter().rev() {
            for (j, t) in self.successors(i) {
                if bound[j] == LOGP_ZERO {
                    continue;
                }
                let penalty = if self.is_non_word(j) || self.word(j) == se {
                    0.0
                } else {
                    word_penalty.max(0.0)
                };
                bound[i] = bound[i].max(t.weight + penalty + bound[j]);
            }
        }
        bound
    }

    /// The `n` best hypotheses, best first, by A* search.
    pub fn decode_nbest(
        &self,
        lm: &dyn LanguageModel,
        opts: &DecodeOptions,
        n: usize,
        deadline: &Deadline,
    ) -> Result<NBestList> {
        let scorer = Scorer { lat: self, lm, opts };
        let order = self.sort_nodes()?;
        let bound = self.completion_bounds(opts.word_penalty, &order);
        let mut list = NBestList::new(self.vocab().clone(), self.name());
        if n == 0 || bound[self.initial()] == LOGP_ZERO {
            return Ok(list);
        }

        let mut traces = vec![Trace {
            node: self.initial(),
            prev: None,
        }];
        let mut heap = BinaryHeap::new();
        heap.push(Partial {
            f: bound[self.initial()],
            acoustic: LOGP_ONE,
            lm: LOGP_ONE,
            words: 0,
            context: scorer.initial_context(),
            ended: false,
            complete: false,
            trace: 0,
        });
        let mut seen: AHashSet<Vec<VocabIndex>> = AHashSet::new();
        let mut extended = 0usize;

        while let Some(p) = heap.pop() {
            if p.complete {
                let words = self.path_words(&trace_nodes(&traces, Some(p.trace)));
                if opts.nbest_duplicates || seen.insert(words.clone()) {
                    list.push(NBestHyp {
                        words,
                        acoustic: p.acoustic,
                        lm: p.lm,
                        num_words: p.words,
                        total: p.f,
                        posterior: 0.0,
                    });
                    if list.len() >= n {
                        break;
                    }
                }
                continue;
            }
            extended += 1;
            if extended > opts.max_hyps {
                tracing::warn!(lattice = %self.name(), limit = opts.max_hyps, found = list.len(), "N-best search limit reached");
                break;
            }
            if extended % 1024 == 0 {
                deadline.check()?;
            }
            let node = traces[p.trace].node;
            if node == self.final_node() {
                if let Some(end) = scorer.finish(&p.context, p.ended) {
                    let lm = p.lm + end;
                    heap.push(Partial {
                        f: scorer.total(p.acoustic, lm, p.words),
                        lm,
                        complete: true,
                        ..p
                    });
                }
                continue;
            }
            for (j, t) in self.successors(node) {
                if t.weight == LOGP_ZERO || bound[j] == LOGP_ZERO {
                    continue;
                }
                let Some(step) = scorer.enter(j, &p.context, p.ended) else { continue };
                traces.push(Trace {
                    node: j,
                    prev: Some(p.trace),
                });
                let acoustic = p.acoustic + t.weight;
                let lm = p.lm + step.lm;
                let words = p.words + step.words;
                heap.push(Partial {
                    f: scorer.total(acoustic, lm, words) + bound[j],
                    acoustic,
                    lm,
                    words,
                    context: step.context,
                    ended: step.ended,
                    complete: false,
                    trace: traces.len() - 1,
                });
            }
        }
        tracing::debug!(lattice = %self.name(), hyps = list.len(), extended, "N-best decoding");
        Ok(list)
    }

    /// The `n` highest-weight paths by k-best Viterbi, best first.
    pub fn compute_nbest_viterbi(&self, n: usize, deadline: &Deadline) -> Result<Vec<(LogP, Vec<NodeIndex>)>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let order = self.sort_nodes()?;
        // per node: (score, predecessor, rank in predecessor's list)
        let mut lists: Vec<Vec<(LogP, Option<(NodeIndex, usize)>)>> = vec![Vec::new(); self.max_index()];
        lists[self.initial()].push((LOGP_ONE, None));
        for &j in &order {
            deadline.check()?;
            if j == self.initial() {
                continue;
            }
            let mut cands: Vec<(LogP, Option<(NodeIndex, usize)>)> = Vec::new();
            for (i, t) in self.predecessors(j) {
                for (rank, &(s, _)) in lists[i].iter().enumerate() {
                    cands.push((s + t.weight, Some((i, rank))));
                }
            }
            cands.sort_by(|a, b| b.0.total_cmp(&a.0));
            cands.truncate(n);
            lists[j] = cands;
        }

        let mut out = Vec::new();
        for rank in 0..lists[self.final_node()].len() {
            let score = lists[self.final_node()][rank].0;
            let mut path = vec![self.final_node()];
            let mut at = (self.final_node(), rank);
            while let Some(prev) = lists[at.0][at.1].1 {
                path.push(prev.0);
                at = prev;
            }
            path.reverse();
            out.push((score, path));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone)]
struct Partial {
    /// Score so far plus the completion bound; exact once complete.
    f: LogP,
    acoustic: LogP,
    lm: LogP,
    words: usize,
    context: Vec<VocabIndex>,
    ended: bool,
    complete: bool,
    trace: usize,
}

impl PartialEq for Partial {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Partial {}

impl PartialOrd for Partial {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Partial {
    // completed hypotheses first among equals, then older traces
    fn cmp(&self, other: &Self) -> Ordering {
        self.f
            .total_cmp(&other.f)
            .then(self.complete.cmp(&other.complete))
            .then(other.trace.cmp(&self.trace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::diamond;
    use crate::graph::LatticeTransition;
    use libngram_core::prob::log_of;
    use libngram_core::{NullLm, Vocab};

    #[test]
    fn best_path_follows_heavier_branch() {
        let vocab = Vocab::new();
        let lat = diamond(&vocab, 0.3, 0.7);
        let (path, score) = lat.best_path(&Deadline::none()).unwrap().unwrap();
        assert_eq!(path, vec![0, 2, 3, 4]);
        assert!((score - log_of(0.7)).abs() < 1e-12);
        assert_eq!(vocab.words_of(&lat.path_words(&path)), vec!["c", "d"]);
    }

    #[test]
    fn one_best_without_lm_matches_best_path() {
        let vocab = Vocab::new();
        let lat = diamond(&vocab, 0.3, 0.7);
        let opts = DecodeOptions {
            lm_weight: 0.0,
            ..DecodeOptions::default()
        };
        let hyp = lat
            .decode_1best(&NullLm::new(vocab.clone()), &opts, &Deadline::none())
            .unwrap()
            .unwrap();
        assert_eq!(vocab.words_of(&hyp.words), vec!["c", "d"]);
        assert!((hyp.total - log_of(0.7)).abs() < 1e-12);
        assert_eq!(hyp.num_words, 2);
    }

    #[test]
    fn word_penalty_counts_words() {
        let vocab = Vocab::new();
        let mut lat = diamond(&vocab, 0.5, 0.5);
        // shortcut that skips d
        lat.insert_trans(1, 4, LatticeTransition::new(log_of(0.5)));
        let opts = DecodeOptions {
            lm_weight: 0.0,
            word_penalty: -1.0,
            ..DecodeOptions::default()
        };
        let hyp = lat
            .decode_1best(&NullLm::new(vocab.clone()), &opts, &Deadline::none())
            .unwrap()
            .unwrap();
        assert_eq!(vocab.words_of(&hyp.words), vec!["b"]);
    }

    #[test]
    fn nbest_viterbi_enumerates_paths() {
        let vocab = Vocab::new();
        let lat = diamond(&vocab, 0.3, 0.7);
        let paths = lat.compute_nbest_viterbi(5, &Deadline::none()).unwrap();
        assert_eq!(paths.len(), 2);
        assert!((paths[0].0 - log_of(0.7)).abs() < 1e-12);
        assert_eq!(paths[1].1, vec![0, 1, 3, 4]);
    }

    #[test]
    fn astar_agrees_with_kbest_viterbi() {
        let vocab = Vocab::new();
        let lat = diamond(&vocab, 0.3, 0.7);
        let opts = DecodeOptions {
            lm_weight: 0.0,
            nbest_duplicates: true,
            ..DecodeOptions::default()
        };
        let list = lat
            .decode_nbest(&NullLm::new(vocab.clone()), &opts, 5, &Deadline::none())
            .unwrap();
        let paths = lat.compute_nbest_viterbi(5, &Deadline::none()).unwrap();
        assert_eq!(list.len(), paths.len());
        for (hyp, (score, path)) in list.hyps.iter().zip(&paths) {
            assert!((hyp.total - score).abs() < 1e-9);
            assert_eq!(hyp.words, lat.path_words(path));
        }
    }
}
