// lattice/src/expand.rs
//
// Expansion of a lattice against an n-gram model. Every node is split into
// one copy per distinct LM context it can be reached with, so that each
// outgoing transition can carry the exact conditional probability of its
// target word. The expanded graph is built on the side and replaces the
// original only when expansion succeeds.

use ahash::AHashMap;
use libngram_core::{LanguageModel, LogP, VocabIndex, LOGP_ONE, LOGP_ZERO, VOCAB_NONE};

use crate::deadline::Deadline;
use crate::error::{LatticeError, Result};
use crate::graph::{Lattice, LatticeTransition, NodeIndex, TRANS_BACKOFF};

#[derive(Debug, Clone, Default)]
pub struct ExpandOptions {
    /// Abort when the expanded lattice would exceed this many nodes
    /// (0: unlimited).
    pub max_nodes: usize,
    /// Leave backoff weights out of transition weights.
    pub no_backoff_weights: bool,
    /// Share one backoff node per (node, shortened context) instead of
    /// copying full contexts. Limited to trigrams.
    pub compact: bool,
}

struct Expansion<'a> {
    old: &'a Lattice,
    lm: &'a dyn LanguageModel,
    opts: &'a ExpandOptions,
    new: Lattice,
    copies: AHashMap<(NodeIndex, Vec<VocabIndex>), NodeIndex>,
    backoff: AHashMap<(NodeIndex, Vec<VocabIndex>), NodeIndex>,
    /// Per old node: its copies in creation order.
    by_node: Vec<Vec<(Vec<VocabIndex>, NodeIndex)>>,
}

impl<'a> Expansion<'a> {
    fn new(old: &'a Lattice, lm: &'a dyn LanguageModel, opts: &'a ExpandOptions) -> Self {
        Self {
            old,
            lm,
            opts,
            new: Lattice::empty(old.vocab().clone(), old.name()),
            copies: AHashMap::new(),
            backoff: AHashMap::new(),
            by_node: vec![Vec::new(); old.max_index()],
        }
    }

    fn add_node(&mut self, word: VocabIndex) -> Result<NodeIndex> {
        if self.opts.max_nodes > 0 && self.new.num_nodes() >= self.opts.max_nodes {
            return Err(LatticeError::NodeLimit {
                lattice: self.old.name().to_string(),
                limit: self.opts.max_nodes,
            });
        }
        Ok(self.new.add_node(word))
    }

    fn truncate(&self, mut context: Vec<VocabIndex>) -> Vec<VocabIndex> {
        let used = self.lm.context_id(None, &context).length;
        context.truncate(used);
        context
    }

    fn is_ended(&self, context: &[VocabIndex]) -> bool {
        context.first() == Some(&self.old.vocab().se_index())
    }

    /// The copy of `node` for `context`, created on first use.
    fn copy(&mut self, node: NodeIndex, context: Vec<VocabIndex>) -> Result<NodeIndex> {
        if let Some(&n) = self.copies.get(&(node, context.clone())) {
            return Ok(n);
        }
        let n = self.add_node(self.old.word(node))?;
        if let (Some(src), Some(dst)) = (self.old.node(node), self.new.node_mut(n)) {
            dst.flags = src.flags;
            dst.htk = src.htk.clone();
        }
        self.copies.insert((node, context.clone()), n);
        self.by_node[node].push((context, n));
        Ok(n)
    }

    /// LM weight of `word` after `context`, without backoff weights when
    /// so configured.
    fn word_weight(&self, word: VocabIndex, context: &[VocabIndex]) -> LogP {
        let p = self.lm.word_prob(word, context);
        if p == LOGP_ZERO || !self.opts.no_backoff_weights {
            return p;
        }
        let used = self.lm.context_id(Some(word), context).length;
        p - self.lm.context_bow(context, used)
    }

    /// Weight and successor context for moving into `node` from `context`.
    fn enter(&self, node: NodeIndex, context: &[VocabIndex]) -> Option<(LogP, Vec<VocabIndex>)> {
        if self.old.is_non_word(node) {
            return Some((LOGP_ONE, context.to_vec()));
        }
        let word = self.old.word(node);
        let p = self.word_weight(word, context);
        if p == LOGP_ZERO {
            return None;
        }
        let se = self.old.vocab().se_index();
        let next = if word == se {
            vec![se]
        } else {
            let mut next = Vec::with_capacity(context.len() + 1);
            next.push(word);
            next.extend_from_slice(context);
            self.truncate(next)
        };
        Some((p, next))
    }

    fn run(&mut self, deadline: &Deadline) -> Result<()> {
        let order = self.old.sort_nodes()?;
        let ss = self.old.vocab().ss_index();
        let start_context = self.truncate(vec![ss]);
        let initial = self.old.initial();
        let initial_word = self.old.word(initial);

        if self.old.is_non_word(initial) || initial_word == ss {
            let n = self.copy(initial, start_context)?;
            self.new.set_initial(n);
        } else {
            // the initial word needs a transition to carry its probability
            let Some((p, context)) = self.enter(initial, &start_context) else {
                return Err(LatticeError::malformed(self.old.name(), "initial word has zero probability"));
            };
            let start = self.add_node(VOCAB_NONE)?;
            let n = self.copy(initial, context)?;
            self.new.insert_trans(start, n, LatticeTransition::new(p));
            self.new.set_initial(start);
        }

        for &i in &order {
            deadline.check()?;
            let copies = self.by_node[i].clone();
            for (context, from) in copies {
                if self.opts.compact {
                    self.expand_compact(i, &context, from)?;
                } else {
                    self.expand_full(i, &context, from)?;
                }
            }
        }
        self.finish()
    }

    fn expand_full(&mut self, node: NodeIndex, context: &[VocabIndex], from: NodeIndex) -> Result<()> {
        let succs: Vec<NodeIndex> = self.old.successors(node).map(|(j, _)| j).collect();
        for j in succs {
            let Some((p, next)) = self.enter(j, context) else { continue };
            let to = self.copy(j, next)?;
            self.new.insert_trans(from, to, LatticeTransition::new(p));
        }
        Ok(())
    }

    /// Full-context copies send words without a stored n-gram through a
    /// backoff node shared by every context with the same shortened
    /// history. A word reached through the backoff node from one context
    /// is also reachable that way from the others sharing it.
    fn expand_compact(&mut self, node: NodeIndex, context: &[VocabIndex], from: NodeIndex) -> Result<()> {
        let order = self.lm.order();
        let succs: Vec<NodeIndex> = self.old.successors(node).map(|(j, _)| j).collect();
        let full = context.len() + 1 == order && !self.is_ended(context);
        let short = &context[..context.len().min(order.saturating_sub(2))];
        let mut backed_off = Vec::new();
        for &j in &succs {
            let word = self.old.word(j);
            let direct = !full
                || self.old.is_non_word(j)
                || word == self.old.vocab().se_index()
                || self.lm.context_id(Some(word), context).length == context.len();
            if !direct {
                backed_off.push(j);
                continue;
            }
            let Some((p, next)) = self.enter(j, context) else { continue };
            let to = self.copy(j, next)?;
            self.new.insert_trans(from, to, LatticeTransition::new(p));
        }
        if backed_off.is_empty() {
            return Ok(());
        }

        let key = (node, short.to_vec());
        let bo = match self.backoff.get(&key) {
            Some(&bo) => bo,
            None => {
                let bo = self.add_node(VOCAB_NONE)?;
                self.backoff.insert(key, bo);
                bo
            }
        };
        for j in backed_off {
            let Some((p, next)) = self.enter(j, short) else { continue };
            let to = self.copy(j, next)?;
            self.new.insert_trans(bo, to, LatticeTransition::new(p));
        }
        let bow = if self.opts.no_backoff_weights {
            LOGP_ONE
        } else {
            self.lm.context_bow(context, short.len())
        };
        self.new
            .insert_trans(from, bo, LatticeTransition::with_flags(bow, TRANS_BACKOFF));
        Ok(())
    }

    /// Join the copies of the old final node to a single final node,
    /// scoring the sentence end where `</s>` was not seen.
    fn finish(&mut self) -> Result<()> {
        let finals = self.by_node[self.old.final_node()].clone();
        match finals.as_slice() {
            [] => {
                return Err(LatticeError::malformed(
                    self.old.name(),
                    "final node unreachable under the language model",
                ))
            }
            [(context, n)] if self.is_ended(context) => {
                self.new.set_final(*n);
            }
            _ => {
                let end = self.add_node(VOCAB_NONE)?;
                let se = self.old.vocab().se_index();
                for (context, n) in &finals {
                    let p = if self.is_ended(context) {
                        LOGP_ONE
                    } else {
                        self.word_weight(se, context)
                    };
                    if p != LOGP_ZERO {
                        self.new.insert_trans(*n, end, LatticeTransition::new(p));
                    }
                }
                self.new.set_final(end);
            }
        }
        Ok(())
    }
}

impl Lattice {
    /// Expand against `lm`, replacing transition weights with LM
    /// probabilities. On error the lattice is left unchanged. Returns the
    /// number of nodes after expansion.
    pub fn expand_to_lm(&mut self, lm: &dyn LanguageModel, opts: &ExpandOptions, deadline: &Deadline) -> Result<usize> {
        if opts.compact && !(1..=3).contains(&lm.order()) {
            return Err(LatticeError::Config(format!(
                "compact expansion needs a model of order 1 to 3, got {}",
                lm.order()
            )));
        }
        if !lm.vocab().same_table(self.vocab()) {
            return Err(LatticeError::Config(format!(
                "lattice {} and the language model use different vocabularies",
                self.name()
            )));
        }
        let before = self.num_nodes();
        let mut expanded = {
            let mut expansion = Expansion::new(self, lm, opts);
            expansion.run(deadline)?;
            expansion.new
        };
        expanded.remove_useless_nodes();
        expanded.check()?;
        tracing::info!(
            lattice = %self.name(),
            before,
            after = expanded.num_nodes(),
            compact = opts.compact,
            "expanded lattice"
        );
        *self = expanded;
        Ok(self.num_nodes())
    }
}
