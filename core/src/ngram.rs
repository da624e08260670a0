// core/src/ngram.rs
//
// Backoff n-gram model. Contexts live in a trie keyed most-recent-word-first;
// each context node holds the conditional log probabilities of the words
// seen after it and the backoff weight applied when a word is missing.
//
// Text and binary model formats are in `ngram_io.rs`.

use ahash::{AHashMap, AHashSet};

use crate::counts::{Count, NgramCounts};
use crate::discount::Discount;
use crate::error::{LmError, Result};
use crate::lm::{ContextId, LanguageModel};
use crate::prob::{log_of, mix_logp, prob_of, LogP, Prob, LOGP_ONE, LOGP_ZERO, PROB_EPSILON};
use crate::trie::{NodeId, Trie};
use crate::vocab::{Vocab, VocabIndex};

/// Context node: backoff weight plus the explicit word probabilities.
#[derive(Debug, Clone, Default)]
pub struct BoNode {
    pub bow: LogP,
    pub probs: AHashMap<VocabIndex, LogP>,
}

/// One stored n-gram, words in sentence order. `bow` is set when the
/// n-gram is itself a context of the model.
#[derive(Debug, Clone, PartialEq)]
pub struct NgramEntry {
    pub words: Vec<VocabIndex>,
    pub prob: LogP,
    pub bow: Option<LogP>,
}

#[derive(Debug, Clone)]
pub struct Ngram {
    pub(crate) vocab: Vocab,
    pub(crate) order: usize,
    pub(crate) contexts: Trie<BoNode>,
}

impl Ngram {
    pub fn new(vocab: Vocab, order: usize) -> Self {
        Self {
            vocab,
            order: order.max(1),
            contexts: Trie::new(),
        }
    }

    /// Change the model order. Lowering it discards all longer n-grams.
    pub fn set_order(&mut self, order: usize) {
        let order = order.max(1);
        if order < self.order {
            for (_, node) in self.contexts.nodes_at_depth(order) {
                self.contexts.remove_node(node);
            }
        }
        self.order = order;
    }

    pub fn clear(&mut self) {
        self.contexts = Trie::new();
    }

    pub fn find_prob(&self, word: VocabIndex, context: &[VocabIndex]) -> Option<LogP> {
        let node = self.contexts.find(context)?;
        self.contexts.value(node).probs.get(&word).copied()
    }

    pub fn find_bow(&self, context: &[VocabIndex]) -> Option<LogP> {
        self.contexts.find(context).map(|n| self.contexts.value(n).bow)
    }

    pub fn set_prob(&mut self, word: VocabIndex, context: &[VocabIndex], logp: LogP) {
        let node = self.contexts.insert(context);
        self.contexts.value_mut(node).probs.insert(word, logp);
    }

    pub fn remove_prob(&mut self, word: VocabIndex, context: &[VocabIndex]) -> bool {
        match self.contexts.find(context) {
            Some(node) => self.contexts.value_mut(node).probs.remove(&word).is_some(),
            None => false,
        }
    }

    pub fn set_bow(&mut self, context: &[VocabIndex], bow: LogP) {
        let node = self.contexts.insert(context);
        self.contexts.value_mut(node).bow = bow;
    }

    /// Number of stored n-grams of exactly `n` words.
    pub fn num_ngrams(&self, n: usize) -> usize {
        if n == 0 || n > self.order {
            return 0;
        }
        self.contexts
            .nodes_at_depth(n - 1)
            .into_iter()
            .map(|(_, node)| self.contexts.value(node).probs.len())
            .sum()
    }

    /// Stored n-grams of exactly `n` words, ordered by context then word index.
    pub fn ngrams(&self, n: usize) -> Vec<NgramEntry> {
        let mut out = Vec::new();
        if n == 0 || n > self.order {
            return out;
        }
        for (context, node) in self.contexts.nodes_at_depth(n - 1) {
            let mut words: Vec<(VocabIndex, LogP)> =
                self.contexts.value(node).probs.iter().map(|(&w, &p)| (w, p)).collect();
            words.sort_unstable_by_key(|&(w, _)| w);
            for (w, prob) in words {
                let bow = self.contexts.child(node, w).map(|c| self.contexts.value(c).bow);
                let mut ngram: Vec<VocabIndex> = context.iter().rev().copied().collect();
                ngram.push(w);
                out.push(NgramEntry { words: ngram, prob, bow });
            }
        }
        out
    }

    /// Katz backoff lookup. Walks the context as deep as the trie allows;
    /// the deepest explicit probability wins, plus the backoff weights of
    /// every deeper context node passed on the way.
    pub fn word_prob_bo(&self, word: VocabIndex, context: &[VocabIndex]) -> LogP {
        let context = &context[..context.len().min(self.order - 1)];
        let mut node = self.contexts.root();
        let mut result = match self.contexts.value(node).probs.get(&word) {
            Some(&p) => p,
            None => return LOGP_ZERO,
        };
        let mut bows = LOGP_ONE;
        for &w in context {
            node = match self.contexts.child(node, w) {
                Some(next) => next,
                None => break,
            };
            let value = self.contexts.value(node);
            match value.probs.get(&word) {
                Some(&p) => {
                    result = p;
                    bows = LOGP_ONE;
                }
                None => bows += value.bow,
            }
        }
        result + bows
    }

    /// Deepest context node that carries information (probabilities or a
    /// non-trivial backoff weight), and its depth.
    fn used_context(&self, context: &[VocabIndex]) -> (NodeId, usize) {
        let context = &context[..context.len().min(self.order - 1)];
        let mut node = self.contexts.root();
        let mut used = (node, 0);
        for (depth, &w) in context.iter().enumerate() {
            node = match self.contexts.child(node, w) {
                Some(next) => next,
                None => break,
            };
            let value = self.contexts.value(node);
            if !value.probs.is_empty() || value.bow != LOGP_ONE {
                used = (node, depth + 1);
            }
        }
        used
    }

    /// Deepest context node holding an explicit probability for `word`,
    /// and its depth.
    fn predicting_context(&self, word: VocabIndex, context: &[VocabIndex]) -> (NodeId, usize) {
        let context = &context[..context.len().min(self.order - 1)];
        let mut node = self.contexts.root();
        let mut used = (node, 0);
        for (depth, &w) in context.iter().enumerate() {
            node = match self.contexts.child(node, w) {
                Some(next) => next,
                None => break,
            };
            if self.contexts.value(node).probs.contains_key(&word) {
                used = (node, depth + 1);
            }
        }
        used
    }

    // ---- estimation --------------------------------------------------

    /// Estimate the model from counts, one discounting strategy per order
    /// (`None` means maximum likelihood). Replaces any existing contents.
    pub fn estimate(&mut self, counts: &NgramCounts, discounts: &[Option<Box<dyn Discount>>]) -> Result<()> {
        if !counts.vocab().same_table(&self.vocab) {
            return Err(LmError::Estimation(
                "counts and model use different vocabularies".to_string(),
            ));
        }
        self.clear();
        let ss = self.vocab.ss_index();
        let se = self.vocab.se_index();
        let events = self.vocab.event_indices();
        if events.is_empty() {
            return Err(LmError::Estimation("vocabulary has no events".to_string()));
        }
        let uniform = 1.0 / events.len() as Prob;

        for n in 1..=self.order.min(counts.order()) {
            let discount: Option<&dyn Discount> = discounts.get(n - 1).and_then(|d| d.as_deref());
            let interpolate = discount.is_some_and(|d| d.interpolate());
            let mut estimated = 0usize;

            for (prefix, _) in counts.ngrams(n - 1) {
                if prefix.contains(&se) {
                    continue;
                }
                let context: Vec<VocabIndex> = prefix.iter().rev().copied().collect();
                if let Some((&last, rest)) = context.split_first() {
                    if self.find_prob(last, rest).is_none() && last != ss {
                        continue;
                    }
                }

                let followers: Vec<(VocabIndex, Count)> = counts
                    .followers(&prefix)
                    .into_iter()
                    .filter(|&(w, c)| c > 0 && !self.vocab.is_non_event(w))
                    .collect();
                let total: Count = followers.iter().map(|&(_, c)| c).sum();
                if total == 0 {
                    continue;
                }
                let observed = followers.len();
                let min2 = followers.iter().filter(|&&(_, c)| c >= 2).count();
                let min3 = followers.iter().filter(|&&(_, c)| c >= 3).count();
                let lower_weight = match discount {
                    Some(d) if interpolate => d.lower_order_weight(total, observed, min2, min3),
                    _ => 0.0,
                };

                let mut entries: Vec<(VocabIndex, Prob)> = Vec::with_capacity(observed);
                for &(w, c) in &followers {
                    let d = discount.map_or(1.0, |d| d.discount(c, total, observed));
                    if d <= 0.0 {
                        continue;
                    }
                    let mut p = d * c as Prob / total as Prob;
                    if interpolate {
                        let lower = if n == 1 {
                            uniform
                        } else {
                            prob_of(self.word_prob_bo(w, &context[..n - 2]))
                        };
                        p += lower_weight * lower;
                    }
                    entries.push((w, p));
                }
                if n == 1 {
                    complete_unigrams(&mut entries, &events, uniform, interpolate.then_some(lower_weight));
                }

                let node = self.contexts.insert(&context);
                let probs = &mut self.contexts.value_mut(node).probs;
                for (w, p) in entries {
                    probs.insert(w, log_of(p));
                }
                if n == 1 {
                    probs.insert(ss, LOGP_ZERO);
                }
                estimated += 1;
            }

            if n >= 2 {
                self.compute_bows_at(n - 1);
            }
            tracing::info!(order = n, contexts = estimated, ngrams = self.num_ngrams(n), "estimated");
        }
        Ok(())
    }

    /// Residual masses of a context: `1 - Σ p(w|ctx)` and
    /// `1 - Σ p(w|ctx shortened)` over the words stored at `ctx`.
    fn backoff_mass(&self, node: NodeId, context: &[VocabIndex]) -> (Prob, Prob) {
        let shorter = &context[..context.len().saturating_sub(1)];
        let mut numerator = 1.0;
        let mut denominator = 1.0;
        for (&w, &p) in &self.contexts.value(node).probs {
            numerator -= prob_of(p);
            denominator -= prob_of(self.word_prob_bo(w, shorter));
        }
        (numerator, denominator)
    }

    /// Recompute the backoff weight of one context. A denominator that has
    /// run out of mass yields a weight of one; any residual numerator mass
    /// is then dropped with a warning.
    fn compute_bow(&mut self, node: NodeId, context: &[VocabIndex]) {
        if context.is_empty() {
            return;
        }
        let (mut numerator, denominator) = self.backoff_mass(node, context);
        if numerator < 0.0 {
            if numerator < -PROB_EPSILON {
                tracing::warn!(
                    context = ?self.vocab.words_of(context),
                    numerator,
                    "probabilities sum above one"
                );
            }
            numerator = 0.0;
        }
        let bow = if denominator < PROB_EPSILON {
            if numerator > PROB_EPSILON {
                tracing::warn!(
                    context = ?self.vocab.words_of(context),
                    numerator,
                    denominator,
                    "no lower-order mass left, dropping backoff mass"
                );
            }
            LOGP_ONE
        } else if numerator <= 0.0 {
            LOGP_ZERO
        } else {
            numerator.log10() - denominator.log10()
        };
        self.contexts.value_mut(node).bow = bow;
    }

    fn compute_bows_at(&mut self, depth: usize) {
        for (context, node) in self.contexts.nodes_at_depth(depth) {
            self.compute_bow(node, &context);
        }
    }

    /// Re-derive every backoff weight, shortest contexts first.
    pub fn recompute_bows(&mut self) {
        for depth in 1..self.order {
            self.compute_bows_at(depth);
        }
    }

    // ---- combination ---------------------------------------------------

    /// Static interpolation `lambda * lm1 + (1 - lambda) * lm2` over the union
    /// of both models' n-grams. Both models must share a vocabulary table.
    pub fn mix(lm1: &Ngram, lm2: &Ngram, lambda: Prob) -> Result<Ngram> {
        if !lm1.vocab.same_table(&lm2.vocab) {
            return Err(LmError::Config(
                "mixed models must share a vocabulary".to_string(),
            ));
        }
        let order = lm1.order.max(lm2.order);
        let mut out = Ngram::new(lm1.vocab.clone(), order);
        for n in 1..=order {
            let mut keys: Vec<(Vec<VocabIndex>, VocabIndex)> = Vec::new();
            let mut seen: AHashSet<(Vec<VocabIndex>, VocabIndex)> = AHashSet::new();
            for lm in [lm1, lm2] {
                if n > lm.order {
                    continue;
                }
                for (context, node) in lm.contexts.nodes_at_depth(n - 1) {
                    let mut words: Vec<VocabIndex> = lm.contexts.value(node).probs.keys().copied().collect();
                    words.sort_unstable();
                    for w in words {
                        let key = (context.clone(), w);
                        if seen.insert(key.clone()) {
                            keys.push(key);
                        }
                    }
                }
            }
            for (context, w) in keys {
                let p = mix_logp(lambda, lm1.word_prob_bo(w, &context), lm2.word_prob_bo(w, &context));
                out.set_prob(w, &context, p);
            }
        }
        out.recompute_bows();
        tracing::info!(order, lambda, "mixed models");
        Ok(out)
    }

    /// In-place variant of [`Ngram::mix`] with `self` as the first model.
    pub fn mix_probs(&mut self, other: &Ngram, lambda: Prob) -> Result<()> {
        *self = Ngram::mix(self, other, lambda)?;
        Ok(())
    }

    // ---- pruning -------------------------------------------------------

    /// Entropy-based pruning: drop every n-gram whose removal raises the
    /// model's perplexity (relative change) by less than `threshold`.
    /// Orders below `max(min_order, 2)` are kept. Returns the number of
    /// n-grams removed.
    pub fn prune_probs(&mut self, threshold: f64, min_order: usize) -> usize {
        if threshold <= 0.0 {
            return 0;
        }
        let mut pruned = 0;
        for n in (min_order.max(2)..=self.order).rev() {
            for (context, node) in self.contexts.nodes_at_depth(n - 1) {
                let (numerator, denominator) = self.backoff_mass(node, &context);
                if numerator < 0.0 || denominator <= 0.0 {
                    continue;
                }
                let old_bow = self.contexts.value(node).bow;
                let context_p = prob_of(self.context_prob(&context, context.len()));
                let shorter = &context[..n - 2];

                let mut words: Vec<(VocabIndex, LogP)> =
                    self.contexts.value(node).probs.iter().map(|(&w, &p)| (w, p)).collect();
                words.sort_unstable_by_key(|&(w, _)| w);

                let mut victims = Vec::new();
                for (w, p) in words {
                    if p == LOGP_ZERO || self.contexts.child(node, w).is_some() {
                        continue;
                    }
                    let backoff = self.word_prob_bo(w, shorter);
                    let new_numerator = numerator + prob_of(p);
                    let new_denominator = denominator + prob_of(backoff);
                    let new_bow = new_numerator.log10() - new_denominator.log10();
                    let new_p = new_bow + backoff;
                    let bow_term = if numerator > 0.0 {
                        numerator * (new_bow - old_bow)
                    } else {
                        0.0
                    };
                    let delta = -context_p * (prob_of(p) * (new_p - p) + bow_term);
                    if !delta.is_finite() {
                        continue;
                    }
                    let perplexity_change = 10f64.powf(delta) - 1.0;
                    if perplexity_change < threshold {
                        victims.push(w);
                    }
                }

                if !victims.is_empty() {
                    tracing::debug!(
                        context = ?self.vocab.words_of(&context),
                        removed = victims.len(),
                        "pruned"
                    );
                    let probs = &mut self.contexts.value_mut(node).probs;
                    for w in &victims {
                        probs.remove(w);
                    }
                    pruned += victims.len();
                    self.compute_bow(node, &context);
                }
            }
            self.remove_empty_contexts(n - 1);
        }
        self.recompute_bows();
        tracing::info!(pruned, threshold, "pruned model");
        pruned
    }

    /// Drop n-grams whose explicit probability is lower than what backing
    /// off would assign them.
    pub fn prune_low_probs(&mut self, min_order: usize) -> usize {
        let mut pruned = 0;
        for n in min_order.max(2)..=self.order {
            for (context, node) in self.contexts.nodes_at_depth(n - 1) {
                let bow = self.contexts.value(node).bow;
                let shorter = &context[..n - 2];
                let victims: Vec<VocabIndex> = self
                    .contexts
                    .value(node)
                    .probs
                    .iter()
                    .filter(|&(&w, _)| self.contexts.child(node, w).is_none())
                    .filter(|&(&w, &p)| p < bow + self.word_prob_bo(w, shorter))
                    .map(|(&w, _)| w)
                    .collect();
                if victims.is_empty() {
                    continue;
                }
                let probs = &mut self.contexts.value_mut(node).probs;
                for w in &victims {
                    probs.remove(w);
                }
                pruned += victims.len();
                self.compute_bow(node, &context);
            }
        }
        self.recompute_bows();
        tracing::info!(pruned, "removed low probabilities");
        pruned
    }

    /// Context nodes with no probabilities and no extensions only carry a
    /// unit backoff weight after pruning; drop them.
    fn remove_empty_contexts(&mut self, depth: usize) {
        if depth == 0 {
            return;
        }
        for (_, node) in self.contexts.nodes_at_depth(depth) {
            if self.contexts.value(node).probs.is_empty() && self.contexts.num_children(node) == 0 {
                self.contexts.remove_node(node);
            }
        }
    }

    /// Replace every stored probability by `lm`'s estimate and renormalize.
    pub fn rescore_probs(&mut self, lm: &dyn LanguageModel) {
        for n in 1..=self.order {
            for (context, node) in self.contexts.nodes_at_depth(n - 1) {
                let words: Vec<VocabIndex> = self.contexts.value(node).probs.keys().copied().collect();
                for w in words {
                    let p = lm.word_prob(w, &context);
                    self.contexts.value_mut(node).probs.insert(w, p);
                }
            }
        }
        self.recompute_bows();
    }
}

/// Complete a unigram distribution. Interpolated estimates already hold the
/// discounted counts; unseen words get the interpolated uniform share.
/// Otherwise leftover mass is spread over unseen words, or the seen words
/// are renormalized when nothing is unseen.
fn complete_unigrams(
    entries: &mut Vec<(VocabIndex, Prob)>,
    events: &[VocabIndex],
    uniform: Prob,
    lower_weight: Option<f64>,
) {
    let seen: AHashSet<VocabIndex> = entries.iter().map(|&(w, _)| w).collect();
    let unseen: Vec<VocabIndex> = events.iter().copied().filter(|w| !seen.contains(w)).collect();

    if let Some(lower_weight) = lower_weight {
        if lower_weight > 0.0 {
            entries.extend(unseen.into_iter().map(|w| (w, lower_weight * uniform)));
        }
        return;
    }

    let total: Prob = entries.iter().map(|&(_, p)| p).sum();
    let leftover = 1.0 - total;
    if !unseen.is_empty() && leftover > PROB_EPSILON {
        let share = leftover / unseen.len() as Prob;
        entries.extend(unseen.into_iter().map(|w| (w, share)));
    } else if leftover.abs() > PROB_EPSILON && total > 0.0 {
        tracing::warn!(leftover, "unigram probabilities do not sum to one, renormalizing");
        for e in entries.iter_mut() {
            e.1 /= total;
        }
    }
}

impl LanguageModel for Ngram {
    fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    fn word_prob(&self, word: VocabIndex, context: &[VocabIndex]) -> LogP {
        self.word_prob_bo(word, context)
    }

    fn order(&self) -> usize {
        self.order
    }

    fn context_id(&self, word: Option<VocabIndex>, context: &[VocabIndex]) -> ContextId {
        let (node, length) = match word {
            Some(w) => self.predicting_context(w, context),
            None => self.used_context(context),
        };
        ContextId {
            id: u64::from(node),
            length,
        }
    }

    fn context_bow(&self, context: &[VocabIndex], length: usize) -> LogP {
        let context = &context[..context.len().min(self.order - 1)];
        let mut node = self.contexts.root();
        let mut bow = LOGP_ONE;
        for (depth, &w) in context.iter().enumerate() {
            node = match self.contexts.child(node, w) {
                Some(next) => next,
                None => break,
            };
            if depth >= length {
                bow += self.contexts.value(node).bow;
            }
        }
        bow
    }

    fn follow_words(&self, context: &[VocabIndex]) -> Vec<(VocabIndex, LogP)> {
        let mut words: Vec<(VocabIndex, LogP)> = self
            .contexts
            .value(self.contexts.root())
            .probs
            .keys()
            .map(|&w| (w, self.word_prob_bo(w, context)))
            .filter(|&(_, p)| p != LOGP_ZERO)
            .collect();
        words.sort_unstable_by_key(|&(w, _)| w);
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discount::{GoodTuring, WittenBell};

    fn counts_of(text: &[&str], order: usize) -> NgramCounts {
        let mut c = NgramCounts::new(Vocab::new(), order);
        for line in text {
            let words: Vec<&str> = line.split_whitespace().collect();
            c.count_words(&words, 1);
        }
        c
    }

    const TEXT: &[&str] = &[
        "the cat sat on the mat",
        "the dog sat on the log",
        "a cat saw the dog",
        "the cat ran",
        "a dog ran on the mat",
    ];

    fn ml_model(order: usize) -> Ngram {
        let counts = counts_of(TEXT, order);
        let mut lm = Ngram::new(counts.vocab().clone(), order);
        lm.estimate(&counts, &[]).unwrap();
        lm
    }

    fn wb_model(order: usize, interpolate: bool) -> Ngram {
        let counts = counts_of(TEXT, order);
        let discounts: Vec<Option<Box<dyn Discount>>> = (0..order)
            .map(|_| {
                let mut d = WittenBell::new(1);
                d.set_interpolate(interpolate);
                Some(Box::new(d) as Box<dyn Discount>)
            })
            .collect();
        let mut lm = Ngram::new(counts.vocab().clone(), order);
        lm.estimate(&counts, &discounts).unwrap();
        lm
    }

    fn distribution_sum(lm: &Ngram, context: &[VocabIndex]) -> f64 {
        lm.vocab()
            .event_indices()
            .into_iter()
            .map(|w| prob_of(lm.word_prob(w, context)))
            .sum()
    }

    #[test]
    fn maximum_likelihood_bigrams() {
        let lm = ml_model(2);
        let v = lm.vocab().clone();
        let the = v.get_index("the").unwrap();
        let cat = v.get_index("cat").unwrap();
        // "the" is followed by cat, mat, dog, log, dog, cat, mat: cat 2/7
        let p = prob_of(lm.word_prob(cat, &[the]));
        assert!((p - 2.0 / 7.0).abs() < 1e-9, "p = {}", p);
    }

    #[test]
    fn start_tag_is_never_predicted() {
        let lm = ml_model(2);
        let ss = lm.vocab().ss_index();
        assert_eq!(lm.find_prob(ss, &[]), Some(LOGP_ZERO));
        assert_eq!(lm.word_prob(ss, &[]), LOGP_ZERO);
    }

    #[test]
    fn discounted_distributions_normalize() {
        for interpolate in [false, true] {
            let lm = wb_model(3, interpolate);
            let v = lm.vocab().clone();
            let the = v.get_index("the").unwrap();
            let on = v.get_index("on").unwrap();
            let ss = v.ss_index();
            for context in [vec![], vec![the], vec![the, on], vec![ss], vec![on, the]] {
                let sum = distribution_sum(&lm, &context);
                assert!((sum - 1.0).abs() < 1e-6, "context {:?} sums to {}", context, sum);
            }
        }
    }

    #[test]
    fn good_turing_model_normalizes() {
        let counts = counts_of(TEXT, 2);
        let mut discounts: Vec<Option<Box<dyn Discount>>> = Vec::new();
        for n in 1..=2 {
            let mut gt = GoodTuring::new(1, 3);
            gt.estimate(&counts, n).unwrap();
            discounts.push(Some(Box::new(gt)));
        }
        let mut lm = Ngram::new(counts.vocab().clone(), 2);
        lm.estimate(&counts, &discounts).unwrap();
        let the = lm.vocab().get_index("the").unwrap();
        let sum = distribution_sum(&lm, &[the]);
        assert!((sum - 1.0).abs() < 1e-6, "sum = {}", sum);
    }

    #[test]
    fn backoff_adds_weights_of_missed_contexts() {
        let lm = wb_model(2, false);
        let v = lm.vocab().clone();
        let the = v.get_index("the").unwrap();
        let ran = v.get_index("ran").unwrap();
        assert!(lm.find_prob(ran, &[the]).is_none());
        let expected = lm.find_bow(&[the]).unwrap() + lm.find_prob(ran, &[]).unwrap();
        assert!((lm.word_prob(ran, &[the]) - expected).abs() < 1e-12);
    }

    #[test]
    fn context_ids_identify_used_context() {
        let lm = wb_model(3, false);
        let v = lm.vocab().clone();
        let the = v.get_index("the").unwrap();
        let on = v.get_index("on").unwrap();
        let saw = v.get_index("saw").unwrap();
        let zebra = v.add_word("zebra");
        let a = lm.context_id(None, &[the, on]);
        let b = lm.context_id(None, &[the, saw]);
        assert_eq!(a.length, 2);
        assert_ne!(a, b);
        // unknown history word: only "the" is used
        let c = lm.context_id(None, &[the, zebra]);
        let d = lm.context_id(None, &[the]);
        assert_eq!(c, d);
        assert_eq!(c.length, 1);
    }

    #[test]
    fn word_context_ids_stop_at_the_stored_ngram() {
        let lm = wb_model(3, false);
        let v = lm.vocab().clone();
        let the = v.get_index("the").unwrap();
        let on = v.get_index("on").unwrap();
        let zebra = v.add_word("zebra");
        let cat = v.get_index("cat").unwrap();
        assert_eq!(lm.context_id(Some(zebra), &[the, on]).length, 0);
        let id = lm.context_id(Some(cat), &[the, on]);
        let p = lm.word_prob(cat, &[the, on]);
        let short = lm.word_prob(cat, &[the, on][..id.length]);
        assert!((p - (lm.context_bow(&[the, on], id.length) + short)).abs() < 1e-12);
    }

    #[test]
    fn context_bow_sums_truncated_levels() {
        let lm = wb_model(3, false);
        let v = lm.vocab().clone();
        let the = v.get_index("the").unwrap();
        let on = v.get_index("on").unwrap();
        let full = lm.find_bow(&[the]).unwrap() + lm.find_bow(&[the, on]).unwrap();
        assert!((lm.context_bow(&[the, on], 0) - full).abs() < 1e-12);
        assert_eq!(lm.context_bow(&[the, on], 2), LOGP_ONE);
    }

    #[test]
    fn mixing_with_itself_is_identity() {
        let lm = wb_model(2, false);
        let mixed = Ngram::mix(&lm, &lm, 0.3).unwrap();
        let v = lm.vocab().clone();
        let the = v.get_index("the").unwrap();
        for w in v.event_indices() {
            let a = lm.word_prob(w, &[the]);
            let b = mixed.word_prob(w, &[the]);
            assert!((a - b).abs() < 1e-9, "word {} {} vs {}", w, a, b);
        }
    }

    #[test]
    fn mixing_needs_shared_vocabulary() {
        let a = Ngram::new(Vocab::new(), 2);
        let b = Ngram::new(Vocab::new(), 2);
        assert!(matches!(Ngram::mix(&a, &b, 0.5), Err(LmError::Config(_))));
    }

    #[test]
    fn pruning_keeps_normalization() {
        let mut lm = wb_model(3, false);
        let before = lm.num_ngrams(3) + lm.num_ngrams(2);
        let removed = lm.prune_probs(0.05, 2);
        assert!(removed > 0);
        assert_eq!(lm.num_ngrams(3) + lm.num_ngrams(2), before - removed);
        let v = lm.vocab().clone();
        let the = v.get_index("the").unwrap();
        let sum = distribution_sum(&lm, &[the]);
        assert!((sum - 1.0).abs() < 1e-6, "sum = {}", sum);
        assert_eq!(lm.num_ngrams(1), wb_model(3, false).num_ngrams(1));
    }

    #[test]
    fn lowering_order_drops_long_ngrams() {
        let mut lm = wb_model(3, false);
        lm.set_order(2);
        assert_eq!(lm.order(), 2);
        assert_eq!(lm.num_ngrams(3), 0);
        assert!(lm.num_ngrams(2) > 0);
    }

    #[test]
    fn rescoring_with_itself_changes_nothing() {
        let lm = wb_model(2, false);
        let mut copy = lm.clone();
        copy.rescore_probs(&lm);
        for e in lm.ngrams(2) {
            let (&w, prefix) = e.words.split_last().unwrap();
            let ctx: Vec<VocabIndex> = prefix.iter().rev().copied().collect();
            assert!((copy.find_prob(w, &ctx).unwrap() - e.prob).abs() < 1e-12);
        }
    }
}
