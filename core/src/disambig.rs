// core/src/disambig.rs
//
// Disambiguation of observed words into hidden tokens. A vocabulary map
// lists, for each observed word, its hidden alternatives with probabilities
// p(word | hidden); an n-gram over the hidden vocabulary scores hidden
// sequences. The best sequence (or the per-position posteriors) comes from
// a trellis over hidden contexts.

use std::io::{BufRead, Write};

use ahash::AHashMap;

use crate::error::Result;
use crate::file::LineReader;
use crate::lm::{LanguageModel, LmHandle};
use crate::prob::{log_of, prob_of, LogP, Prob, LOGP_ONE, LOGP_ZERO};
use crate::trellis::Trellis;
use crate::vocab::{Vocab, VocabIndex};

/// Observed word → hidden alternatives with `p(observed | hidden)`.
#[derive(Debug, Clone)]
pub struct VocabMap {
    observed: Vocab,
    hidden: Vocab,
    map: AHashMap<VocabIndex, Vec<(VocabIndex, Prob)>>,
}

impl VocabMap {
    pub fn new(observed: Vocab, hidden: Vocab) -> Self {
        Self {
            observed,
            hidden,
            map: AHashMap::new(),
        }
    }

    pub fn observed(&self) -> &Vocab {
        &self.observed
    }

    pub fn hidden(&self) -> &Vocab {
        &self.hidden
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Set `p(word | hidden)`, replacing an earlier entry for the pair.
    pub fn insert(&mut self, word: VocabIndex, hidden: VocabIndex, prob: Prob) {
        let entry = self.map.entry(word).or_default();
        match entry.iter_mut().find(|(h, _)| *h == hidden) {
            Some(slot) => slot.1 = prob,
            None => entry.push((hidden, prob)),
        }
    }

    pub fn get(&self, word: VocabIndex) -> &[(VocabIndex, Prob)] {
        self.map.get(&word).map_or(&[], |v| v.as_slice())
    }

    /// Read lines `word hidden1 [prob1] hidden2 [prob2] …`. A missing
    /// probability defaults to one.
    pub fn read<R: BufRead>(&mut self, input: &mut LineReader<R>) -> Result<usize> {
        let mut entries = 0;
        while let Some(line) = input.next_line()? {
            let mut fields = line.split_whitespace().peekable();
            let Some(word) = fields.next() else { continue };
            let word = self.observed.add_word(word);
            let mut seen = false;
            while let Some(hidden) = fields.next() {
                if hidden.parse::<f64>().is_ok() {
                    return Err(input.error(format!("probability '{}' without a hidden word", hidden)));
                }
                let hidden = self.hidden.add_word(hidden);
                let prob = match fields.peek().and_then(|t| t.parse::<f64>().ok()) {
                    Some(p) => {
                        fields.next();
                        p
                    }
                    None => 1.0,
                };
                if prob < 0.0 {
                    return Err(input.error(format!("negative map probability {}", prob)));
                }
                self.insert(word, hidden, prob);
                entries += 1;
                seen = true;
            }
            if !seen {
                tracing::warn!(file = input.name(), line = input.line_no(), "map entry without hidden words");
            }
        }
        tracing::info!(file = input.name(), entries, "read vocabulary map");
        Ok(entries)
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut words: Vec<&VocabIndex> = self.map.keys().collect();
        words.sort_by(|a, b| self.observed.compare(**a, **b));
        for &word in words {
            write!(out, "{}", self.observed.display_word(word))?;
            for &(hidden, prob) in self.get(word) {
                write!(out, " {} {}", self.hidden.display_word(hidden), prob)?;
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DisambigState {
    pub hidden: VocabIndex,
    /// Hidden context for the next prediction, most recent first.
    pub context: Vec<VocabIndex>,
}

pub struct Disambiguator<'a> {
    map: &'a VocabMap,
    lm: LmHandle<'a>,
    lm_weight: f64,
    map_weight: f64,
}

impl<'a> Disambiguator<'a> {
    pub fn new(map: &'a VocabMap, lm: LmHandle<'a>) -> Self {
        Self {
            map,
            lm,
            lm_weight: 1.0,
            map_weight: 1.0,
        }
    }

    pub fn with_weights(mut self, lm_weight: f64, map_weight: f64) -> Self {
        self.lm_weight = lm_weight;
        self.map_weight = map_weight;
        self
    }

    fn max_context(&self) -> usize {
        match self.lm.order() {
            0 => usize::MAX,
            n => n - 1,
        }
    }

    fn extend(&self, hidden: VocabIndex, context: &[VocabIndex]) -> Vec<VocabIndex> {
        let mut out = Vec::with_capacity(context.len() + 1);
        out.push(hidden);
        out.extend_from_slice(context);
        out.truncate(self.max_context());
        out
    }

    /// Hidden alternatives of an observed word. Unmapped words stand for
    /// the hidden word of the same spelling, or `<unk>`.
    fn alternatives(&self, word: VocabIndex) -> Vec<(VocabIndex, Prob)> {
        let mapped = self.map.get(word);
        if !mapped.is_empty() {
            return mapped.to_vec();
        }
        let hidden = self.map.hidden();
        let spelled = self
            .map
            .observed()
            .get_word(word)
            .and_then(|w| hidden.get_index(&w))
            .unwrap_or_else(|| hidden.unk_index());
        vec![(spelled, 1.0)]
    }

    fn transitions(&self, state: &DisambigState, word: Option<VocabIndex>) -> Vec<(DisambigState, LogP)> {
        let Some(word) = word else {
            let se = self.map.hidden().se_index();
            let p = self.lm.word_prob(se, &state.context);
            if p == LOGP_ZERO {
                return Vec::new();
            }
            return vec![(
                DisambigState {
                    hidden: se,
                    context: Vec::new(),
                },
                self.lm_weight * p,
            )];
        };
        self.alternatives(word)
            .into_iter()
            .filter(|&(_, prob)| prob > 0.0)
            .filter_map(|(hidden, prob)| {
                let p = self.lm.word_prob(hidden, &state.context);
                (p != LOGP_ZERO).then(|| {
                    (
                        DisambigState {
                            hidden,
                            context: self.extend(hidden, &state.context),
                        },
                        self.lm_weight * p + self.map_weight * log_of(prob),
                    )
                })
            })
            .collect()
    }

    fn run(&self, words: &[VocabIndex], nbest: usize) -> Trellis<DisambigState> {
        let ss = self.map.hidden().ss_index();
        let mut trellis = Trellis::new(nbest);
        trellis.init();
        trellis.set_prob(
            DisambigState {
                hidden: ss,
                context: self.extend(ss, &[]),
            },
            LOGP_ONE,
        );
        let steps = words.iter().map(|&w| Some(w)).chain(std::iter::once(None));
        for word in steps {
            let previous: Vec<DisambigState> = trellis.states(trellis.time()).cloned().collect();
            trellis.step();
            for state in &previous {
                for (next, p) in self.transitions(state, word) {
                    trellis.update(state, next, p);
                }
            }
        }
        trellis
    }

    /// Most likely hidden sequence with its score.
    pub fn disambiguate(&self, words: &[VocabIndex]) -> Option<(Vec<VocabIndex>, LogP)> {
        self.nbest(words, 1).into_iter().next().map(|(score, hidden)| (hidden, score))
    }

    /// The `n` best hidden sequences, best first.
    pub fn nbest(&self, words: &[VocabIndex], n: usize) -> Vec<(LogP, Vec<VocabIndex>)> {
        let trellis = self.run(words, n.max(1));
        trellis
            .nbest_viterbi(n, None)
            .into_iter()
            .map(|(score, path)| (score, path[1..=words.len()].iter().map(|s| s.hidden).collect()))
            .collect()
    }

    /// Posterior distribution over hidden alternatives at each position,
    /// most probable first.
    pub fn posteriors(&self, words: &[VocabIndex]) -> Vec<Vec<(VocabIndex, Prob)>> {
        let mut trellis = self.run(words, 1);
        let last = trellis.time();
        trellis.init_back(last);
        let finals: Vec<DisambigState> = trellis.states(last).cloned().collect();
        for s in &finals {
            trellis.set_back_prob(s, LOGP_ONE);
        }
        for t in (0..last).rev() {
            trellis.step_back();
            let word = words.get(t).copied();
            let states: Vec<DisambigState> = trellis.states(t).cloned().collect();
            for s in &states {
                for (next, p) in self.transitions(s, word) {
                    trellis.update_back(s, &next, p);
                }
            }
        }

        (1..=words.len())
            .map(|t| {
                let mut by_word: AHashMap<VocabIndex, Prob> = AHashMap::new();
                for s in trellis.states(t) {
                    *by_word.entry(s.hidden).or_default() += prob_of(trellis.posterior(s, t));
                }
                let mut dist: Vec<(VocabIndex, Prob)> = by_word.into_iter().collect();
                dist.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                dist
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counts::NgramCounts;
    use crate::ngram::Ngram;
    use std::io::Cursor;

    fn setup() -> (VocabMap, Ngram) {
        let mut map = VocabMap::new(Vocab::new(), Vocab::new());
        let mut input = LineReader::new(Cursor::new("a A1 0.5 A2 0.5\nb B1\n"), "test.map");
        assert_eq!(map.read(&mut input).unwrap(), 3);

        let mut counts = NgramCounts::new(map.hidden().clone(), 2);
        for line in ["A2 B1", "A2 B1", "A1"] {
            let words: Vec<&str> = line.split_whitespace().collect();
            counts.count_words(&words, 1);
        }
        let mut lm = Ngram::new(map.hidden().clone(), 2);
        lm.estimate(&counts, &[]).unwrap();
        (map, lm)
    }

    #[test]
    fn picks_the_consistent_sequence() {
        let (map, lm) = setup();
        let d = Disambiguator::new(&map, LmHandle::Borrowed(&lm));
        let words = map.observed().lookup_words(&["a", "b"]);
        let (hidden, score) = d.disambiguate(&words).unwrap();
        assert_eq!(map.hidden().words_of(&hidden), vec!["A2", "B1"]);
        assert!((score - log_of(2.0 / 3.0 * 0.5)).abs() < 1e-9);

        let alone = map.observed().lookup_words(&["a"]);
        let (hidden, _) = d.disambiguate(&alone).unwrap();
        assert_eq!(map.hidden().words_of(&hidden), vec!["A1"]);
    }

    #[test]
    fn posteriors_are_distributions() {
        let (map, lm) = setup();
        let d = Disambiguator::new(&map, LmHandle::Borrowed(&lm));
        let words = map.observed().lookup_words(&["a", "b"]);
        let post = d.posteriors(&words);
        assert_eq!(post.len(), 2);
        assert_eq!(map.hidden().display_word(post[0][0].0), "A2");
        assert!((post[0][0].1 - 1.0).abs() < 1e-9);
        for slot in &post {
            let total: f64 = slot.iter().map(|&(_, p)| p).sum();
            assert!((total - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn nbest_is_sorted() {
        let (map, lm) = setup();
        let d = Disambiguator::new(&map, LmHandle::Borrowed(&lm)).with_weights(1.0, 0.0);
        let words = map.observed().lookup_words(&["a"]);
        let list = d.nbest(&words, 5);
        assert_eq!(list.len(), 1);
        assert!(list.windows(2).all(|w| w[0].0 >= w[1].0));
    }

    #[test]
    fn map_writes_sorted_entries() {
        let (map, _) = setup();
        let mut out = Vec::new();
        map.write(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "a A1 0.5 A2 0.5\nb B1 1\n");
    }
}
