// core/src/lm.rs
//
// The language model contract. A model only has to answer `word_prob`;
// sentence scoring, perplexity, generation and follow-word iteration are
// built here on top of it.

use ahash::AHashSet;
use rand::{Rng, RngCore};
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::io::BufRead;
use std::ops::Deref;

use crate::counts::NgramCounts;
use crate::error::Result;
use crate::file::LineReader;
use crate::prob::{prob_of, LogP, LOGP_ONE, LOGP_ZERO};
use crate::vocab::{Vocab, VocabIndex};

/// Identity of the part of a context a model actually uses. Two contexts
/// with equal ids (and lengths) give identical predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId {
    pub id: u64,
    pub length: usize,
}

impl ContextId {
    /// Id derived from the context words themselves.
    pub fn of_words(context: &[VocabIndex]) -> Self {
        let mut h = DefaultHasher::new();
        context.hash(&mut h);
        ContextId {
            id: h.finish(),
            length: context.len(),
        }
    }
}

/// How a sentence is turned into a sequence of predictions.
#[derive(Debug, Clone)]
pub struct SentenceOptions {
    pub add_start: bool,
    pub add_end: bool,
    /// Score right to left.
    pub reverse: bool,
    /// Tokens removed before scoring.
    pub noise: AHashSet<VocabIndex>,
    /// Lines beginning with this tag change the model state instead of
    /// being scored.
    pub state_tag: Option<String>,
}

impl Default for SentenceOptions {
    fn default() -> Self {
        Self {
            add_start: true,
            add_end: true,
            reverse: false,
            noise: AHashSet::new(),
            state_tag: None,
        }
    }
}

/// Running totals of a perplexity computation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextStats {
    pub num_sentences: u64,
    pub num_words: u64,
    pub num_oovs: u64,
    pub zero_probs: u64,
    pub prob: LogP,
}

impl TextStats {
    pub fn add(&mut self, other: &TextStats) {
        self.num_sentences += other.num_sentences;
        self.num_words += other.num_words;
        self.num_oovs += other.num_oovs;
        self.zero_probs += other.zero_probs;
        self.prob += other.prob;
    }

    fn scored_words(&self) -> f64 {
        self.num_words as f64 - self.num_oovs as f64 - self.zero_probs as f64
    }

    /// Perplexity counting end-of-sentence predictions.
    pub fn ppl(&self) -> f64 {
        let denom = self.scored_words() + self.num_sentences as f64;
        if denom <= 0.0 {
            return f64::NAN;
        }
        prob_of(-self.prob / denom)
    }

    /// Perplexity over words only.
    pub fn ppl1(&self) -> f64 {
        let denom = self.scored_words();
        if denom <= 0.0 {
            return f64::NAN;
        }
        prob_of(-self.prob / denom)
    }
}

impl fmt::Display for TextStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} sentences, {} words, {} OOVs",
            self.num_sentences, self.num_words, self.num_oovs
        )?;
        write!(
            f,
            "{} zeroprobs, logprob= {:.6} ppl= {:.6} ppl1= {:.6}",
            self.zero_probs,
            self.prob,
            self.ppl(),
            self.ppl1()
        )
    }
}

pub trait LanguageModel {
    fn vocab(&self) -> &Vocab;

    /// Log probability of `word` after `context` (most recent word first).
    fn word_prob(&self, word: VocabIndex, context: &[VocabIndex]) -> LogP;

    /// Longest n-gram the model distinguishes, 0 when unbounded.
    fn order(&self) -> usize {
        0
    }

    /// The portion of `context` that determines predictions (of `word`, or
    /// of any word when `None`).
    fn context_id(&self, _word: Option<VocabIndex>, context: &[VocabIndex]) -> ContextId {
        ContextId::of_words(context)
    }

    /// Backoff weight applied to predictions from `context` whose context
    /// is truncated to `length` words.
    fn context_bow(&self, _context: &[VocabIndex], _length: usize) -> LogP {
        LOGP_ONE
    }

    fn is_non_word(&self, word: VocabIndex) -> bool {
        self.vocab().is_non_event(word)
    }

    /// Switch to a named state. Returns false when the model has no states.
    fn set_state(&self, _state: &str) -> bool {
        false
    }

    /// Joint probability of the first `length` words of a context, each
    /// conditioned on the ones after it. Sentence-start tags count as certain.
    fn context_prob(&self, context: &[VocabIndex], length: usize) -> LogP {
        let ss = self.vocab().ss_index();
        let length = length.min(context.len());
        let mut total = LOGP_ONE;
        for i in 0..length {
            if context[i] == ss {
                continue;
            }
            total += self.word_prob(context[i], &context[i + 1..]);
        }
        total
    }

    /// Score one sentence, accumulating into `stats`. Returns the sentence
    /// log probability (OOVs and zero-probability words excluded).
    fn sentence_prob(&self, sentence: &[VocabIndex], opts: &SentenceOptions, stats: &mut TextStats) -> LogP {
        let vocab = self.vocab();
        let ss = vocab.ss_index();
        let se = vocab.se_index();
        let unk = vocab.unk_index();
        let unk_is_word = vocab.unk_is_word();

        let mut words: Vec<VocabIndex> = sentence.iter().copied().filter(|w| !opts.noise.contains(w)).collect();
        if opts.reverse {
            words.reverse();
        }
        if words.first() == Some(&ss) {
            words.remove(0);
        }
        if words.last() == Some(&se) {
            words.pop();
        }

        let mut history: Vec<VocabIndex> = Vec::with_capacity(words.len() + 2);
        if opts.add_start {
            history.push(ss);
        }
        let mut targets = words.clone();
        if opts.add_end {
            targets.push(se);
        }

        let max_context = match self.order() {
            0 => usize::MAX,
            n => n - 1,
        };
        let mut sent = TextStats {
            num_sentences: 1,
            num_words: words.iter().filter(|&&w| !self.is_non_word(w)).count() as u64,
            ..TextStats::default()
        };
        let mut context: Vec<VocabIndex> = Vec::with_capacity(history.len());
        for &w in &targets {
            if w == unk && !unk_is_word {
                sent.num_oovs += 1;
                history.push(w);
                continue;
            }
            if w != se && self.is_non_word(w) {
                continue;
            }
            context.clear();
            context.extend(history.iter().rev().take(max_context));
            let p = self.word_prob(w, &context);
            if p == LOGP_ZERO {
                sent.zero_probs += 1;
            } else {
                sent.prob += p;
            }
            history.push(w);
        }
        stats.add(&sent);
        sent.prob
    }

    /// Score a text, one sentence per line.
    fn ppl_text(&self, input: &mut dyn BufRead, name: &str, opts: &SentenceOptions, stats: &mut TextStats) -> Result<()> {
        let mut reader = LineReader::new(input, name);
        let vocab = self.vocab().clone();
        while let Some(line) = reader.next_line()? {
            if let Some(tag) = &opts.state_tag {
                if let Some(state) = line.strip_prefix(tag.as_str()) {
                    if !self.set_state(state.trim()) {
                        tracing::warn!(file = name, line = reader.line_no(), "model has no state to set");
                    }
                    continue;
                }
            }
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.is_empty() {
                continue;
            }
            let indices = vocab.lookup_words(&words);
            self.sentence_prob(&indices, opts, stats);
        }
        Ok(())
    }

    /// Score the n-grams of a count store: highest-order n-grams, plus
    /// lower-order ones anchored at sentence start.
    fn count_prob(&self, counts: &NgramCounts, order: usize, stats: &mut TextStats) -> LogP {
        let vocab = self.vocab();
        let ss = vocab.ss_index();
        let se = vocab.se_index();
        let unk = vocab.unk_index();
        let mut total = LOGP_ONE;
        for n in 1..=order {
            for (ngram, count) in counts.ngrams(n) {
                if n < order && ngram.first() != Some(&ss) {
                    continue;
                }
                let Some((&w, prefix)) = ngram.split_last() else { continue };
                if self.is_non_word(w) && w != se {
                    continue;
                }
                if w == se {
                    stats.num_sentences += count;
                } else {
                    stats.num_words += count;
                }
                if w == unk && !vocab.unk_is_word() {
                    stats.num_oovs += count;
                    continue;
                }
                let context: Vec<VocabIndex> = prefix.iter().rev().copied().collect();
                let p = self.word_prob(w, &context);
                if p == LOGP_ZERO {
                    stats.zero_probs += count;
                } else {
                    total += count as f64 * p;
                }
            }
        }
        stats.prob += total;
        total
    }

    /// Every predictable word with nonzero probability after `context`.
    fn follow_words(&self, context: &[VocabIndex]) -> Vec<(VocabIndex, LogP)> {
        self.vocab()
            .event_indices()
            .into_iter()
            .map(|w| (w, self.word_prob(w, context)))
            .filter(|&(_, p)| p != LOGP_ZERO)
            .collect()
    }

    /// Sample a word from the predictive distribution after `context`.
    fn generate_word(&self, context: &[VocabIndex], rng: &mut dyn RngCore) -> VocabIndex {
        let target: f64 = rng.random::<f64>();
        let mut mass = 0.0;
        let mut last = self.vocab().se_index();
        for (w, p) in self.follow_words(context) {
            mass += prob_of(p);
            last = w;
            if mass > target {
                return w;
            }
        }
        last
    }

    /// Sample a sentence (without tags) of at most `max_words` words.
    fn generate_sentence(&self, max_words: usize, rng: &mut dyn RngCore) -> Vec<VocabIndex> {
        let ss = self.vocab().ss_index();
        let se = self.vocab().se_index();
        let mut history = vec![ss];
        let mut context = Vec::new();
        while history.len() <= max_words {
            context.clear();
            context.extend(history.iter().rev());
            let w = self.generate_word(&context, rng);
            if w == se {
                break;
            }
            history.push(w);
        }
        history.remove(0);
        history
    }
}

/// A component model that is either owned by its container or borrowed
/// from a caller that outlives it.
pub enum LmHandle<'a> {
    Owned(Box<dyn LanguageModel + 'a>),
    Borrowed(&'a dyn LanguageModel),
}

impl<'a> LmHandle<'a> {
    pub fn owned(lm: impl LanguageModel + 'a) -> Self {
        LmHandle::Owned(Box::new(lm))
    }
}

impl<'a> Deref for LmHandle<'a> {
    type Target = dyn LanguageModel + 'a;

    fn deref(&self) -> &Self::Target {
        match self {
            LmHandle::Owned(lm) => lm.as_ref(),
            LmHandle::Borrowed(lm) => *lm,
        }
    }
}

impl<'a> From<&'a dyn LanguageModel> for LmHandle<'a> {
    fn from(lm: &'a dyn LanguageModel) -> Self {
        LmHandle::Borrowed(lm)
    }
}

impl<'a> From<Box<dyn LanguageModel + 'a>> for LmHandle<'a> {
    fn from(lm: Box<dyn LanguageModel + 'a>) -> Self {
        LmHandle::Owned(lm)
    }
}

/// Assigns probability one to every word.
#[derive(Debug, Clone)]
pub struct NullLm {
    vocab: Vocab,
}

impl NullLm {
    pub fn new(vocab: Vocab) -> Self {
        Self { vocab }
    }
}

impl LanguageModel for NullLm {
    fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    fn word_prob(&self, _word: VocabIndex, _context: &[VocabIndex]) -> LogP {
        LOGP_ONE
    }

    fn context_id(&self, _word: Option<VocabIndex>, _context: &[VocabIndex]) -> ContextId {
        ContextId { id: 0, length: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prob::log_of;

    /// Uniform over the events of its vocabulary.
    struct Uniform {
        vocab: Vocab,
    }

    impl LanguageModel for Uniform {
        fn vocab(&self) -> &Vocab {
            &self.vocab
        }

        fn word_prob(&self, word: VocabIndex, _context: &[VocabIndex]) -> LogP {
            if self.vocab.is_non_event(word) {
                LOGP_ZERO
            } else {
                log_of(1.0 / self.vocab.event_indices().len() as f64)
            }
        }
    }

    fn uniform(words: &[&str]) -> Uniform {
        let vocab = Vocab::new();
        vocab.add_words(words);
        Uniform { vocab }
    }

    #[test]
    fn sentence_prob_counts_words_and_oovs() {
        let lm = uniform(&["a", "b", "c"]);
        let v = lm.vocab().clone();
        let sent = vec![v.get_index("a").unwrap(), v.unk_index(), v.get_index("b").unwrap()];
        let mut stats = TextStats::default();
        let p = lm.sentence_prob(&sent, &SentenceOptions::default(), &mut stats);
        // events: </s> a b c; a, b and </s> are scored
        assert!((p - 3.0 * log_of(0.25)).abs() < 1e-12);
        assert_eq!(stats.num_words, 3);
        assert_eq!(stats.num_oovs, 1);
        assert!((stats.ppl() - 4.0).abs() < 1e-9);
        assert!((stats.ppl1() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn noise_words_are_stripped() {
        let lm = uniform(&["a", "uh"]);
        let v = lm.vocab().clone();
        let uh = v.get_index("uh").unwrap();
        let mut opts = SentenceOptions::default();
        opts.noise.insert(uh);
        let mut stats = TextStats::default();
        lm.sentence_prob(&[uh, v.get_index("a").unwrap(), uh], &opts, &mut stats);
        assert_eq!(stats.num_words, 1);
    }

    #[test]
    fn ppl_text_reads_lines() {
        let lm = uniform(&["a", "b"]);
        let mut stats = TextStats::default();
        lm.ppl_text(&mut "a b\n\nb\n".as_bytes(), "text", &SentenceOptions::default(), &mut stats)
            .unwrap();
        assert_eq!(stats.num_sentences, 2);
        assert_eq!(stats.num_words, 3);
        assert!(stats.to_string().contains("2 sentences, 3 words, 0 OOVs"));
    }

    #[test]
    fn generation_is_reproducible() {
        use rand::SeedableRng;
        let lm = uniform(&["a", "b", "c"]);
        let mut r1 = rand::rngs::StdRng::seed_from_u64(3);
        let mut r2 = rand::rngs::StdRng::seed_from_u64(3);
        let s1 = lm.generate_sentence(20, &mut r1);
        let s2 = lm.generate_sentence(20, &mut r2);
        assert_eq!(s1, s2);
        assert!(s1.len() <= 20);
        assert!(!s1.contains(&lm.vocab().se_index()));
    }

    #[test]
    fn handles_deref_to_the_model() {
        let lm = uniform(&["a"]);
        let borrowed: LmHandle<'_> = LmHandle::Borrowed(&lm);
        let owned = LmHandle::owned(NullLm::new(lm.vocab().clone()));
        let a = lm.vocab().get_index("a").unwrap();
        assert_eq!(borrowed.word_prob(a, &[]), lm.word_prob(a, &[]));
        assert_eq!(owned.word_prob(a, &[]), LOGP_ONE);
    }
}
