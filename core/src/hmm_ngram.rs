// core/src/hmm_ngram.rs
//
// An HMM whose states each generate whole sentence segments from their own
// n-gram model. A segment ends with the state model's `</s>`, after which
// the HMM moves to a successor state that starts a new segment at `<s>`.
// Definitions are read from a text file:
//
//     INITIAL  -        topic1 0.5 topic2 0.5
//     topic1   t1.lm    topic1 0.2 topic2 0.3 FINAL 0.5
//     topic2   t2.lm    FINAL 1
//
// Every line names a state, its model file (`-` for none) and pairs of
// successor state and transition probability.

use std::cell::RefCell;
use std::io::{BufRead, Write};

use ahash::AHashMap;

use crate::error::{LmError, Result};
use crate::file::LineReader;
use crate::lm::{LanguageModel, LmHandle};
use crate::prob::{log_of, LogP, Prob, LOGP_ONE, LOGP_ZERO};
use crate::trellis::Trellis;
use crate::vocab::{Vocab, VocabIndex};

pub const INITIAL_STATE: &str = "INITIAL";
pub const FINAL_STATE: &str = "FINAL";

struct HmmState<'a> {
    name: String,
    model_file: String,
    lm: Option<LmHandle<'a>>,
    next: Vec<(usize, Prob)>,
}

/// Trellis state: an HMM state plus the n-gram context inside its current
/// segment (most recent word first).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HmmPosition {
    pub state: usize,
    pub context: Vec<VocabIndex>,
}

struct PrefixCache {
    words: Vec<VocabIndex>,
    trellis: Trellis<HmmPosition>,
}

pub struct HmmOfNgrams<'a> {
    vocab: Vocab,
    states: Vec<HmmState<'a>>,
    by_name: AHashMap<String, usize>,
    cache: RefCell<Option<PrefixCache>>,
}

impl<'a> HmmOfNgrams<'a> {
    pub fn new(vocab: Vocab) -> Self {
        let mut hmm = Self {
            vocab,
            states: Vec::new(),
            by_name: AHashMap::new(),
            cache: RefCell::new(None),
        };
        hmm.state_index(INITIAL_STATE);
        hmm.state_index(FINAL_STATE);
        hmm
    }

    fn state_index(&mut self, name: &str) -> usize {
        if let Some(&i) = self.by_name.get(name) {
            return i;
        }
        let i = self.states.len();
        self.states.push(HmmState {
            name: name.to_string(),
            model_file: "-".to_string(),
            lm: None,
            next: Vec::new(),
        });
        self.by_name.insert(name.to_string(), i);
        i
    }

    fn initial(&self) -> usize {
        0
    }

    fn final_state(&self) -> usize {
        1
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn state_name(&self, state: usize) -> Option<&str> {
        self.states.get(state).map(|s| s.name.as_str())
    }

    /// Read an HMM definition. `loader` turns a model file name into the
    /// state's n-gram.
    pub fn read<R, F>(&mut self, input: &mut LineReader<R>, mut loader: F) -> Result<()>
    where
        R: BufRead,
        F: FnMut(&str) -> Result<LmHandle<'a>>,
    {
        let mut models: AHashMap<String, usize> = AHashMap::new();
        while let Some(line) = input.next_line()? {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() < 2 || fields.len() % 2 != 0 {
                return Err(input.error("expected state, model file and successor/probability pairs"));
            }
            let state = self.state_index(fields[0]);
            if state == self.final_state() && fields.len() > 2 {
                return Err(input.error("FINAL state cannot have successors"));
            }

            let model_file = fields[1];
            if model_file != "-" {
                if state == self.initial() || state == self.final_state() {
                    return Err(input.error(format!("{} state cannot carry a model", fields[0])));
                }
                if let Some(&other) = models.get(model_file) {
                    tracing::debug!(file = model_file, shared_with = %self.states[other].name, "loading model again");
                }
                let lm = loader(model_file)?;
                if !lm.vocab().same_table(&self.vocab) {
                    return Err(input.error(format!("model {} uses a different vocabulary", model_file)));
                }
                self.states[state].lm = Some(lm);
                self.states[state].model_file = model_file.to_string();
                models.insert(model_file.to_string(), state);
            }

            let mut next = Vec::with_capacity(fields.len() / 2 - 1);
            for pair in fields[2..].chunks(2) {
                let prob: f64 = pair[1]
                    .parse()
                    .map_err(|_| input.error(format!("bad transition probability '{}'", pair[1])))?;
                if !(0.0..=1.0).contains(&prob) {
                    return Err(input.error(format!("transition probability {} out of range", prob)));
                }
                next.push((self.state_index(pair[0]), prob));
            }
            let total: f64 = next.iter().map(|&(_, p)| p).sum();
            if !next.is_empty() && (total - 1.0).abs() > 1e-6 {
                tracing::warn!(state = fields[0], total, "transition probabilities do not sum to one");
            }
            self.states[state].next = next;
        }

        for (i, s) in self.states.iter().enumerate() {
            if i != self.initial() && i != self.final_state() && s.lm.is_none() {
                return Err(LmError::Config(format!("HMM state {} has no model", s.name)));
            }
        }
        tracing::info!(file = input.name(), states = self.states.len(), "read HMM of n-grams");
        self.cache.borrow_mut().take();
        Ok(())
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        for s in &self.states {
            if s.lm.is_none() && s.next.is_empty() {
                continue;
            }
            write!(out, "{} {}", s.name, s.model_file)?;
            for &(next, p) in &s.next {
                write!(out, " {} {}", self.states[next].name, p)?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    fn max_context(lm: &dyn LanguageModel) -> usize {
        match lm.order() {
            0 => usize::MAX,
            n => n - 1,
        }
    }

    fn extend(lm: &dyn LanguageModel, word: VocabIndex, context: &[VocabIndex]) -> Vec<VocabIndex> {
        let mut out = Vec::with_capacity(context.len() + 1);
        out.push(word);
        out.extend_from_slice(context);
        out.truncate(Self::max_context(lm));
        out
    }

    /// Log probability of closing the current segment of `pos`.
    fn end_segment(&self, pos: &HmmPosition) -> LogP {
        match &self.states[pos.state].lm {
            Some(lm) => lm.word_prob(self.vocab.se_index(), &pos.context),
            None if pos.state == self.initial() => LOGP_ONE,
            None => LOGP_ZERO,
        }
    }

    fn transitions(&self, pos: &HmmPosition, word: VocabIndex) -> Vec<(HmmPosition, LogP)> {
        let mut out = Vec::new();
        let current = &self.states[pos.state];
        let end = self.end_segment(pos);

        if word == self.vocab.se_index() {
            for &(next, a) in &current.next {
                if next == self.final_state() && end != LOGP_ZERO && a > 0.0 {
                    out.push((
                        HmmPosition {
                            state: next,
                            context: Vec::new(),
                        },
                        end + log_of(a),
                    ));
                }
            }
            return out;
        }

        if let Some(lm) = &current.lm {
            let p = lm.word_prob(word, &pos.context);
            if p != LOGP_ZERO {
                out.push((
                    HmmPosition {
                        state: pos.state,
                        context: Self::extend(&**lm, word, &pos.context),
                    },
                    p,
                ));
            }
        }

        if end == LOGP_ZERO {
            return out;
        }
        let ss = self.vocab.ss_index();
        for &(next, a) in &current.next {
            let Some(lm) = &self.states[next].lm else { continue };
            if a <= 0.0 {
                continue;
            }
            let start = Self::extend(&**lm, ss, &[]);
            let p = lm.word_prob(word, &start);
            if p == LOGP_ZERO {
                continue;
            }
            out.push((
                HmmPosition {
                    state: next,
                    context: Self::extend(&**lm, word, &start),
                },
                end + log_of(a) + p,
            ));
        }
        out
    }

    fn advance(&self, trellis: &mut Trellis<HmmPosition>, word: VocabIndex) {
        let previous: Vec<HmmPosition> = trellis.states(trellis.time()).cloned().collect();
        trellis.step();
        for pos in &previous {
            for (next, p) in self.transitions(pos, word) {
                trellis.update(pos, next, p);
            }
        }
    }

    fn run(&self, words: &[VocabIndex]) -> Trellis<HmmPosition> {
        let mut trellis = Trellis::new(1);
        trellis.init();
        trellis.set_prob(
            HmmPosition {
                state: self.initial(),
                context: Vec::new(),
            },
            LOGP_ONE,
        );
        for &w in words {
            self.advance(&mut trellis, w);
        }
        trellis
    }

    /// Most likely HMM state for each word of a sentence (without tags),
    /// with the joint log probability of the sentence along that path.
    pub fn segment(&self, words: &[VocabIndex]) -> Option<(Vec<usize>, LogP)> {
        let mut all = words.to_vec();
        all.push(self.vocab.se_index());
        let trellis = self.run(&all);
        let path = trellis.viterbi(None)?;
        let score = trellis.max_logp(trellis.time());
        Some((path[1..=words.len()].iter().map(|p| p.state).collect(), score))
    }
}

impl LanguageModel for HmmOfNgrams<'_> {
    fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    /// Ratio of forward sums, `P(h w) / P(h)`. Histories are always taken
    /// as sentence prefixes; the trellis of the last one is reused.
    fn word_prob(&self, word: VocabIndex, context: &[VocabIndex]) -> LogP {
        let ss = self.vocab.ss_index();
        let history: Vec<VocabIndex> = context.iter().rev().copied().filter(|&w| w != ss).collect();

        let mut cache = self.cache.borrow_mut();
        let prefix = cache.get_or_insert_with(|| PrefixCache {
            words: Vec::new(),
            trellis: self.run(&[]),
        });
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
        let mut any = false;
        for s in &self.states {
            if let Some(lm) = &s.lm {
                any |= lm.set_state(state);
            }
        }
        any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::{SentenceOptions, TextStats};
    use std::io::Cursor;

    /// Context-free distribution over a fixed word set.
    struct Table {
        vocab: Vocab,
        probs: Vec<(VocabIndex, f64)>,
    }

    impl LanguageModel for Table {
        fn vocab(&self) -> &Vocab {
            &self.vocab
        }

        fn word_prob(&self, word: VocabIndex, _context: &[VocabIndex]) -> LogP {
            self.probs
                .iter()
                .find(|&&(w, _)| w == word)
                .map_or(LOGP_ZERO, |&(_, p)| log_of(p))
        }

        fn order(&self) -> usize {
            1
        }
    }

    const DEFINITION: &str = "INITIAL - X 0.5 Y 0.5\nX x.lm X 0.2 Y 0.3 FINAL 0.5\nY y.lm FINAL 1\n";

    fn hmm(vocab: &Vocab) -> HmmOfNgrams<'static> {
        let x = vocab.add_word("x");
        let y = vocab.add_word("y");
        let se = vocab.se_index();
        let mut hmm = HmmOfNgrams::new(vocab.clone());
        let mut input = LineReader::new(Cursor::new(DEFINITION), "test.hmm");
        let v = vocab.clone();
        hmm.read(&mut input, move |file: &str| -> Result<LmHandle<'static>> {
            let word = if file == "x.lm" { x } else { y };
            Ok(LmHandle::owned(Table {
                vocab: v.clone(),
                probs: vec![(word, 0.5), (se, 0.5)],
            }))
        })
        .unwrap();
        hmm
    }

    #[test]
    fn segments_by_state() {
        let vocab = Vocab::new();
        let hmm = hmm(&vocab);
        let words = vocab.lookup_words(&["x", "y"]);
        let (states, score) = hmm.segment(&words).unwrap();
        let names: Vec<&str> = states.iter().filter_map(|&s| hmm.state_name(s)).collect();
        assert_eq!(names, vec!["X", "Y"]);
        // 0.5*0.5, then 0.5*0.3*0.5, then 0.5*1
        assert!((score - log_of(0.25 * 0.075 * 0.5)).abs() < 1e-9);
    }

    #[test]
    fn prefix_probabilities_chain() {
        let vocab = Vocab::new();
        let hmm = hmm(&vocab);
        let x = vocab.get_index("x").unwrap();
        let y = vocab.get_index("y").unwrap();
        let ss = vocab.ss_index();
        assert!((hmm.word_prob(x, &[ss]) - log_of(0.25)).abs() < 1e-9);
        assert!((hmm.word_prob(y, &[x, ss]) - log_of(0.075)).abs() < 1e-9);
        assert_eq!(hmm.word_prob(x, &[y, x, ss]), LOGP_ZERO);

        let mut stats = TextStats::default();
        let total = hmm.sentence_prob(&[x, y], &SentenceOptions::default(), &mut stats);
        assert!((total - log_of(0.25 * 0.075 * 0.5)).abs() < 1e-9);
    }

    #[test]
    fn definitions_round_trip() {
        let vocab = Vocab::new();
        let hmm = hmm(&vocab);
        let mut out = Vec::new();
        hmm.write(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("X x.lm X 0.2"));
        assert!(text.lines().any(|l| l.starts_with("Y y.lm FINAL 1")));
    }

    #[test]
    fn rejects_bad_definitions() {
        let vocab = Vocab::new();
        let mut hmm = HmmOfNgrams::new(vocab.clone());
        let mut input = LineReader::new(Cursor::new("INITIAL - X\n"), "bad.hmm");
        let err = hmm
            .read(&mut input, |_: &str| -> Result<LmHandle<'static>> { unreachable!() })
            .unwrap_err();
        assert!(err.to_string().contains("bad.hmm:1"));
    }
}
