// core/src/hidden_ngram.rs
//
// Hidden-event n-gram model. The underlying n-gram is trained on text in
// which event tokens (sentence boundaries, punctuation, disfluency tags)
// appear between words; at query time the events are unobserved, so word
// probabilities sum over every way of placing at most one event in each
// gap. The sum runs on a trellis whose states are (n-gram context, event
// just inserted) pairs.

use std::cell::RefCell;

use ahash::AHashMap;

use crate::error::Result;
use crate::file::LineReader;
use crate::lm::{LanguageModel, LmHandle};
use crate::prob::{prob_of, LogP, Prob, LOGP_ONE, LOGP_ZERO};
use crate::trellis::Trellis;
use crate::vocab::{Vocab, VocabIndex, VOCAB_NONE};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HiddenState {
    /// Most recent token first, events included.
    pub context: Vec<VocabIndex>,
    /// Event placed before the last word, `VOCAB_NONE` if none.
    pub event: VocabIndex,
}

/// Sentence prefix a trellis currently covers.
struct PrefixCache {
    start: bool,
    words: Vec<VocabIndex>,
    trellis: Trellis<HiddenState>,
}

pub struct HiddenNgram<'a> {
    lm: LmHandle<'a>,
    events: Vec<VocabIndex>,
    cache: RefCell<Option<PrefixCache>>,
}

/// Read an event list, one token per line.
pub fn read_events<R: std::io::BufRead>(vocab: &Vocab, input: &mut LineReader<R>) -> Result<Vec<VocabIndex>> {
    let mut events = Vec::new();
    while let Some(line) = input.next_line()? {
        if let Some(word) = line.split_whitespace().next() {
            events.push(vocab.add_word(word));
        }
    }
    Ok(events)
}

impl<'a> HiddenNgram<'a> {
    pub fn new(lm: LmHandle<'a>, events: Vec<VocabIndex>) -> Self {
        Self {
            lm,
            events,
            cache: RefCell::new(None),
        }
    }

    pub fn events(&self) -> &[VocabIndex] {
        &self.events
    }

    fn max_context(&self) -> usize {
        match self.lm.order() {
            0 => usize::MAX,
            n => n - 1,
        }
    }

    fn extend(&self, tokens: &[VocabIndex], context: &[VocabIndex]) -> Vec<VocabIndex> {
        let mut out: Vec<VocabIndex> = tokens.to_vec();
        out.extend_from_slice(context);
        out.truncate(self.max_context());
        out
    }

    fn initial_state(&self, start: bool) -> HiddenState {
        let context = if start {
            self.extend(&[self.lm.vocab().ss_index()], &[])
        } else {
            Vec::new()
        };
        HiddenState {
            context,
            event: VOCAB_NONE,
        }
    }

    /// States reachable from `state` by observing `word`, with their
    /// transition log probabilities.
    fn transitions(&self, state: &HiddenState, word: VocabIndex) -> Vec<(HiddenState, LogP)> {
        let mut out = Vec::with_capacity(self.events.len() + 1);
        let plain = self.lm.word_prob(word, &state.context);
        if plain != LOGP_ZERO {
            out.push((
                HiddenState {
                    context: self.extend(&[word], &state.context),
                    event: VOCAB_NONE,
                },
                plain,
            ));
        }
        for &event in &self.events {
            let pe = self.lm.word_prob(event, &state.context);
            if pe == LOGP_ZERO {
                continue;
            }
            let after_event = self.extend(&[event], &state.context);
            let pw = self.lm.word_prob(word, &after_event);
            if pw == LOGP_ZERO {
                continue;
            }
            out.push((
                HiddenState {
                    context: self.extend(&[word, event], &state.context),
                    event,
                },
                pe + pw,
            ));
        }
        out
    }

    fn advance(&self, trellis: &mut Trellis<HiddenState>, word: VocabIndex) {
        let previous: Vec<HiddenState> = trellis.states(trellis.time()).cloned().collect();
        trellis.step();
        for state in &previous {
            for (next, p) in self.transitions(state, word) {
                trellis.update(state, next, p);
            }
        }
    }

    fn run(&self, words: &[VocabIndex], start: bool) -> Trellis<HiddenState> {
        let mut trellis = Trellis::new(1);
        trellis.init();
        trellis.set_prob(self.initial_state(start), LOGP_ONE);
        for &w in words {
            self.advance(&mut trellis, w);
        }
        trellis
    }

    fn with_end(&self, words: &[VocabIndex]) -> Vec<VocabIndex> {
        let mut all = words.to_vec();
        all.push(self.lm.vocab().se_index());
        all
    }

    /// Most likely event placement for a sentence (without tags). Returns
    /// the event before each word and before `</s>` (`VOCAB_NONE` for
    /// none) and the joint log probability, or `None` when the sentence
    /// has zero probability.
    pub fn tag(&self, words: &[VocabIndex]) -> Option<(Vec<VocabIndex>, LogP)> {
        let trellis = self.run(&self.with_end(words), true);
        let path = trellis.viterbi(None)?;
        let score = trellis.max_logp(trellis.time());
        Some((path[1..].iter().map(|s| s.event).collect(), score))
    }

    /// Posterior distribution over events in every gap (before each word
    /// and before `</s>`). `VOCAB_NONE` stands for "no event".
    pub fn event_posteriors(&self, words: &[VocabIndex]) -> Vec<Vec<(VocabIndex, Prob)>> {
        let all = self.with_end(words);
        let mut trellis = self.run(&all, true);
        let last = trellis.time();
        trellis.init_back(last);
        let finals: Vec<HiddenState> = trellis.states(last).cloned().collect();
        for s in &finals {
            trellis.set_back_prob(s, LOGP_ONE);
        }
        for t in (0..last).rev() {
            trellis.step_back();
            let states: Vec<HiddenState> = trellis.states(t).cloned().collect();
            for s in &states {
                for (next, p) in self.transitions(s, all[t]) {
                    trellis.update_back(s, &next, p);
                }
            }
        }

        (1..=last)
            .map(|t| {
                let mut by_event: AHashMap<VocabIndex, Prob> = AHashMap::new();
                for s in trellis.states(t) {
                    *by_event.entry(s.event).or_default() += prob_of(trellis.posterior(s, t));
                }
                let mut dist: Vec<(VocabIndex, Prob)> = by_event.into_iter().collect();
                dist.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                dist
            })
            .collect()
    }

    /// Interleave words with the events chosen for them.
    pub fn tagged_words(&self, words: &[VocabIndex], events: &[VocabIndex]) -> Vec<VocabIndex> {
        let mut out = Vec::with_capacity(words.len() * 2);
        for (i, &e) in events.iter().enumerate() {
            if e != VOCAB_NONE {
                out.push(e);
            }
            if let Some(&w) = words.get(i) {
                out.push(w);
            }
        }
        out
    }
}

impl LanguageModel for HiddenNgram<'_> {
    fn vocab(&self) -> &Vocab {
        self.lm.vocab()
    }

    /// Prefix probability ratio `P(h w) / P(h)` with events summed out.
    /// The trellis for the last history is kept, so scoring a sentence
    /// left to right costs one trellis step per word.
    fn word_prob(&self, word: VocabIndex, context: &[VocabIndex]) -> LogP {
        let ss = self.lm.vocab().ss_index();
        let mut history: Vec<VocabIndex> = context.iter().rev().copied().collect();
        let start = history.first() == Some(&ss);
        if start {
            history.remove(0);
        }

        let mut cache = self.cache.borrow_mut();
        let reusable = cache.as_ref().is_some_and(|c| c.start == start);
        if !reusable {
            *cache = Some(PrefixCache {
                start,
                words: Vec::new(),
                trellis: self.run(&[], start),
            });
        }
        let Some(prefix) = cache.as_mut() else {
            return LOGP_ZERO;
        };

        let common = prefix
            .words
            .iter()
            .zip(&history)
            .take_while(|(a, b)| a == b)
            .count();
        if common < prefix.words.len() {
            prefix.trellis.rewind(common);
            prefix.words.truncate(common);
        }
        for &w in &history[common..] {
            self.advance(&mut prefix.trellis, w);
            prefix.words.push(w);
        }

        let before = prefix.trellis.sum_logp(prefix.trellis.time());
        self.advance(&mut prefix.trellis, word);
        prefix.words.push(word);
        let after = prefix.trellis.sum_logp(prefix.trellis.time());
        if before == LOGP_ZERO || after == LOGP_ZERO {
            LOGP_ZERO
        } else {
            after - before
        }
    }

    fn set_state(&self, state: &str) -> bool {
        self.cache.borrow_mut().take();
        self.lm.set_state(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::NgramCounts;
    use crate::lm::{SentenceOptions, TextStats};
    use crate::ngram::Ngram;
    use crate::prob::log_of;

    fn model(text: &[&str]) -> Ngram {
        let mut counts = NgramCounts::new(Vocab::new(), 2);
        for line in text {
            let words: Vec<&str> = line.split_whitespace().collect();
            counts.count_words(&words, 1);
        }
        let mut lm = Ngram::new(counts.vocab().clone(), 2);
        lm.estimate(&counts, &[]).unwrap();
        lm
    }

    const TEXT: &[&str] = &["a <c> b", "a <c> b", "a b", "b <c> a"];

    #[test]
    fn tags_the_likely_event() {
        let lm = model(TEXT);
        let v = lm.vocab().clone();
        let comma = v.get_index("<c>").unwrap();
        let a = v.get_index("a").unwrap();
        let b = v.get_index("b").unwrap();
        let hidden = HiddenNgram::new(LmHandle::Borrowed(&lm), vec![comma]);
        let (events, score) = hidden.tag(&[a, b]).unwrap();
        assert_eq!(events, vec![VOCAB_NONE, comma, VOCAB_NONE]);
        assert!(score < 0.0);
        assert_eq!(hidden.tagged_words(&[a, b], &events), vec![a, comma, b]);
    }

    #[test]
    fn posteriors_split_the_gap() {
        let lm = model(TEXT);
        let v = lm.vocab().clone();
        let comma = v.get_index("<c>").unwrap();
        let a = v.get_index("a").unwrap();
        let b = v.get_index("b").unwrap();
        let hidden = HiddenNgram::new(LmHandle::Borrowed(&lm), vec![comma]);
        let post = hidden.event_posteriors(&[a, b]);
        assert_eq!(post.len(), 3);
        // via <c>: 2/4 * 2/3 against 1/4 directly
        assert_eq!(post[1][0].0, comma);
        assert!((post[1][0].1 - 4.0 / 7.0).abs() < 1e-9);
        assert_eq!(post[0].len(), 1);
        assert_eq!(post[0][0].0, VOCAB_NONE);
        for gap in &post {
            let total: f64 = gap.iter().map(|&(_, p)| p).sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn word_probabilities_marginalize_events() {
        let lm = model(TEXT);
        let v = lm.vocab().clone();
        let comma = v.get_index("<c>").unwrap();
        let a = v.get_index("a").unwrap();
        let b = v.get_index("b").unwrap();
        let hidden = HiddenNgram::new(LmHandle::Borrowed(&lm), vec![comma]);
        let p = hidden.word_prob(b, &[a, v.ss_index()]);
        // direct 1/4, or via <c>: 2/4 * 2/3
        assert!((p - log_of(0.25 + 0.5 * 2.0 / 3.0)).abs() < 1e-9);

        let visible: Vec<VocabIndex> = v.event_indices().into_iter().filter(|&w| w != comma).collect();
        let total: f64 = visible.iter().map(|&w| prob_of(hidden.word_prob(w, &[a, v.ss_index()]))).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn sentence_scores_match_forward_sum() {
        let lm = model(TEXT);
        let v = lm.vocab().clone();
        let comma = v.get_index("<c>").unwrap();
        let a = v.get_index("a").unwrap();
        let b = v.get_index("b").unwrap();
        let hidden = HiddenNgram::new(LmHandle::Borrowed(&lm), vec![comma]);
        let mut stats = TextStats::default();
        let total = hidden.sentence_prob(&[a, b], &SentenceOptions::default(), &mut stats);
        let trellis = hidden.run(&[a, b, v.se_index()], true);
        assert!((total - trellis.sum_logp(3)).abs() < 1e-9);
    }
}
