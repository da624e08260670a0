// core/src/mix.rs
//
// Mixtures evaluated at query time: the two-model Bayesian interpolation
// whose weights follow each model's belief in the current context, and a
// log-linear (geometric) combination renormalized over the vocabulary.

use std::cell::{Cell, RefCell};
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::lm::{ContextId, LanguageModel, LmHandle};
use crate::prob::{add_logp, log_of, LogP, Prob, LOGP_ZERO};
use crate::vocab::{Vocab, VocabIndex};

/// `p(w|h) = [π1(h) p1(w|h) + π2(h) p2(w|h)] / [π1(h) + π2(h)]` with
/// `πi(h) = prior_i * P_i(h)^scale`, where `P_i(h)` is model i's joint
/// probability of the last `length` context words. With `length == 0`
/// this is plain linear interpolation with weight `prior`.
pub struct BayesMix<'a> {
    lm1: LmHandle<'a>,
    lm2: LmHandle<'a>,
    prior: Prob,
    length: usize,
    scale: f64,
}

impl<'a> BayesMix<'a> {
    pub fn new(lm1: LmHandle<'a>, lm2: LmHandle<'a>, prior: Prob, length: usize, scale: f64) -> Self {
        Self {
            lm1,
            lm2,
            prior: prior.clamp(0.0, 1.0),
            length,
            scale,
        }
    }

    pub fn prior(&self) -> Prob {
        self.prior
    }

    /// Log posterior weights of the two components for `context`.
    pub fn weights(&self, context: &[VocabIndex]) -> (LogP, LogP) {
        let prior1 = log_of(self.prior);
        let prior2 = log_of(1.0 - self.prior);
        let length = self.length.min(context.len());
        let (w1, w2) = if length == 0 || self.scale == 0.0 {
            (prior1, prior2)
        } else {
            let w1 = prior1 + self.scale * self.lm1.context_prob(context, length);
            let w2 = prior2 + self.scale * self.lm2.context_prob(context, length);
            if w1 == LOGP_ZERO && w2 == LOGP_ZERO {
                // neither model believes in this context
                (prior1, prior2)
            } else {
                (w1, w2)
            }
        };
        let total = add_logp(w1, w2);
        (w1 - total, w2 - total)
    }
}

impl LanguageModel for BayesMix<'_> {
    fn vocab(&self) -> &Vocab {
        self.lm1.vocab()
    }

    fn word_prob(&self, word: VocabIndex, context: &[VocabIndex]) -> LogP {
        if self.prior >= 1.0 {
            return self.lm1.word_prob(word, context);
        }
        if self.prior <= 0.0 {
            return self.lm2.word_prob(word, context);
        }
        let (w1, w2) = self.weights(context);
        if w2 == LOGP_ZERO {
            return self.lm1.word_prob(word, context);
        }
        if w1 == LOGP_ZERO {
            return self.lm2.word_prob(word, context);
        }
        add_logp(
            w1 + self.lm1.word_prob(word, context),
            w2 + self.lm2.word_prob(word, context),
        )
    }

    fn order(&self) -> usize {
        match (self.lm1.order(), self.lm2.order()) {
            (0, _) | (_, 0) => 0,
            (a, b) => a.max(b).max(self.length + 1),
        }
    }

    fn context_id(&self, word: Option<VocabIndex>, context: &[VocabIndex]) -> ContextId {
        let a = self.lm1.context_id(word, context);
        let b = self.lm2.context_id(word, context);
        let length = a.length.max(b.length).max(self.length.min(context.len()));
        ContextId::of_words(&context[..length])
    }

    fn is_non_word(&self, word: VocabIndex) -> bool {
        self.lm1.is_non_word(word) && self.lm2.is_non_word(word)
    }

    fn set_state(&self, state: &str) -> bool {
        let a = self.lm1.set_state(state);
        let b = self.lm2.set_state(state);
        a || b
    }
}

/// Weighted geometric mixture `p(w|h) ∝ Π p_i(w|h)^λi`. The normalizer
/// sums over every event of the vocabulary, so it is cached per context.
pub struct LoglinearMix<'a> {
    vocab: Vocab,
    models: Vec<(LmHandle<'a>, f64)>,
    normalizers: RefCell<LruCache<Vec<VocabIndex>, LogP>>,
    cache_hits: Cell<usize>,
}

impl<'a> LoglinearMix<'a> {
    pub fn new(vocab: Vocab, models: Vec<(LmHandle<'a>, f64)>, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            vocab,
            models,
            normalizers: RefCell::new(LruCache::new(capacity)),
            cache_hits: Cell::new(0),
        }
    }

    pub fn cache_hits(&self) -> usize {
        self.cache_hits.get()
    }

    fn unnormalized(&self, word: VocabIndex, context: &[VocabIndex]) -> LogP {
        let mut total = 0.0;
        for (lm, lambda) in &self.models {
            if *lambda == 0.0 {
                continue;
            }
            let p = lm.word_prob(word, context);
            if p == LOGP_ZERO {
                return LOGP_ZERO;
            }
            total += lambda * p;
        }
        total
    }

    /// Context words any component can see.
    fn relevant_context<'c>(&self, context: &'c [VocabIndex]) -> &'c [VocabIndex] {
        match self.order() {
            0 => context,
            n => &context[..context.len().min(n - 1)],
        }
    }

    fn normalizer(&self, context: &[VocabIndex]) -> LogP {
        let key = self.relevant_context(context).to_vec();
        if let Some(&norm) = self.normalizers.borrow_mut().get(&key) {
            self.cache_hits.set(self.cache_hits.get() + 1);
            return norm;
        }
        let norm = self
            .vocab()
            .event_indices()
            .into_iter()
            .map(|w| self.unnormalized(w, context))
            .fold(LOGP_ZERO, add_logp);
        self.normalizers.borrow_mut().put(key, norm);
        norm
    }
}

impl LanguageModel for LoglinearMix<'_> {
    fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    fn word_prob(&self, word: VocabIndex, context: &[VocabIndex]) -> LogP {
        if self.vocab().is_non_event(word) {
            return LOGP_ZERO;
        }
        let raw = self.unnormalized(word, context);
        if raw == LOGP_ZERO {
            return LOGP_ZERO;
        }
        raw - self.normalizer(context)
    }

    fn order(&self) -> usize {
        let orders: Vec<usize> = self.models.iter().map(|(lm, _)| lm.order()).collect();
        if orders.contains(&0) {
            0
        } else {
            orders.into_iter().max().unwrap_or(0)
        }
    }

    fn set_state(&self, state: &str) -> bool {
        let mut any = false;
        for (lm, _) in &self.models {
            any |= lm.set_state(state);
        }
        if any {
            self.normalizers.borrow_mut().clear();
        }
        any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::NgramCounts;
    use crate::discount::{Discount, WittenBell};
    use crate::ngram::Ngram;
    use crate::prob::prob_of;

    fn model(vocab: &Vocab, text: &[&str]) -> Ngram {
        let mut counts = NgramCounts::new(vocab.clone(), 2);
        for line in text {
            let words: Vec<&str> = line.split_whitespace().collect();
            counts.count_words(&words, 1);
        }
        let discounts: Vec<Option<Box<dyn Discount>>> =
            vec![Some(Box::new(WittenBell::new(1))), Some(Box::new(WittenBell::new(1)))];
        let mut lm = Ngram::new(vocab.clone(), 2);
        lm.estimate(&counts, &discounts).unwrap();
        lm
    }

    fn pair() -> (Vocab, Ngram, Ngram) {
        let vocab = Vocab::new();
        vocab.add_words(&["a", "b", "c"]);
        let lm1 = model(&vocab, &["a b", "a b c", "b a"]);
        let lm2 = model(&vocab, &["c c", "c a", "b c"]);
        (vocab, lm1, lm2)
    }

    #[test]
    fn prior_one_is_the_first_model() {
        let (vocab, lm1, lm2) = pair();
        let mix = BayesMix::new(LmHandle::Borrowed(&lm1), LmHandle::Borrowed(&lm2), 1.0, 2, 1.0);
        let a = vocab.get_index("a").unwrap();
        for w in vocab.event_indices() {
            assert_eq!(mix.word_prob(w, &[a]), lm1.word_prob(w, &[a]));
        }
    }

    #[test]
    fn zero_length_is_linear_interpolation() {
        let (vocab, lm1, lm2) = pair();
        let mix = BayesMix::new(LmHandle::Borrowed(&lm1), LmHandle::Borrowed(&lm2), 0.25, 0, 1.0);
        let b = vocab.get_index("b").unwrap();
        let c = vocab.get_index("c").unwrap();
        let expected = 0.25 * prob_of(lm1.word_prob(c, &[b])) + 0.75 * prob_of(lm2.word_prob(c, &[b]));
        assert!((prob_of(mix.word_prob(c, &[b])) - expected).abs() < 1e-12);
    }

    #[test]
    fn posterior_weights_follow_context_likelihood() {
        let (vocab, lm1, lm2) = pair();
        let mix = BayesMix::new(LmHandle::Borrowed(&lm1), LmHandle::Borrowed(&lm2), 0.5, 1, 1.0);
        let a = vocab.get_index("a").unwrap();
        let c = vocab.get_index("c").unwrap();
        let (w1, w2) = mix.weights(&[a]);
        assert!((prob_of(w1) + prob_of(w2) - 1.0).abs() < 1e-12);
        // "c" is far more likely under the second model
        let (v1, v2) = mix.weights(&[c]);
        assert!(v2 > v1);
        let sum: f64 = vocab.event_indices().iter().map(|&w| prob_of(mix.word_prob(w, &[c]))).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_context_probabilities_fall_back_to_priors() {
        let (vocab, lm1, lm2) = pair();
        let mix = BayesMix::new(LmHandle::Borrowed(&lm1), LmHandle::Borrowed(&lm2), 0.3, 1, 1.0);
        // a pause is a non-event: both models give the context zero mass
        let (w1, w2) = mix.weights(&[vocab.pause_index()]);
        assert!((prob_of(w1) - 0.3).abs() < 1e-12);
        assert!((prob_of(w2) - 0.7).abs() < 1e-12);
    }

    #[test]
    fn loglinear_normalizes_and_caches() {
        let (vocab, lm1, lm2) = pair();
        let mix = LoglinearMix::new(
            vocab.clone(),
            vec![(LmHandle::Borrowed(&lm1), 0.6), (LmHandle::Borrowed(&lm2), 0.4)],
            16,
        );
        let a = vocab.get_index("a").unwrap();
        let sum: f64 = vocab.event_indices().iter().map(|&w| prob_of(mix.word_prob(w, &[a]))).sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(mix.cache_hits() >= vocab.event_indices().len() - 1);
        assert_eq!(mix.word_prob(vocab.ss_index(), &[a]), LOGP_ZERO);
    }
}
