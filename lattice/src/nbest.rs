// lattice/src/nbest.rs
//
// N-best hypothesis lists. The text form is one hypothesis per line:
//
//   ACOUSTIC LM NUM_WORDS w1 w2 ...
//
// with base-10 log scores. Lists can also be written as JSON lines.

use std::io::{BufRead, Write};

use ahash::AHashSet;
use libngram_core::prob::{add_logp, prob_of};
use libngram_core::{LanguageModel, LineReader, LogP, Prob, SentenceOptions, TextStats, Vocab, VocabIndex, LOGP_ZERO};
use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct NBestHyp {
    pub words: Vec<VocabIndex>,
    /// Acoustic (or lattice) score.
    pub acoustic: LogP,
    pub lm: LogP,
    pub num_words: usize,
    /// Combined score used for ranking.
    pub total: LogP,
    pub posterior: Prob,
}

impl NBestHyp {
    pub fn new(words: Vec<VocabIndex>, acoustic: LogP, lm: LogP) -> Self {
        let num_words = words.len();
        Self {
            words,
            acoustic,
            lm,
            num_words,
            total: acoustic + lm,
            posterior: 0.0,
        }
    }

    pub fn combine(&mut self, lm_weight: f64, word_penalty: f64) {
        self.total = self.acoustic + lm_weight * self.lm + word_penalty * self.num_words as f64;
    }
}

#[derive(Serialize)]
struct JsonHyp<'a> {
    id: &'a str,
    rank: usize,
    words: Vec<String>,
    acoustic: LogP,
    lm: LogP,
    num_words: usize,
    total: LogP,
    posterior: Prob,
}

#[derive(Debug, Clone)]
pub struct NBestList {
    pub id: String,
    vocab: Vocab,
    pub hyps: Vec<NBestHyp>,
}

impl NBestList {
    pub fn new(vocab: Vocab, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vocab,
            hyps: Vec::new(),
        }
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn len(&self) -> usize {
        self.hyps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hyps.is_empty()
    }

    pub fn push(&mut self, hyp: NBestHyp) {
        self.hyps.push(hyp);
    }

    /// Best first; ties keep their order.
    pub fn sort(&mut self) {
        self.hyps.sort_by(|a, b| b.total.total_cmp(&a.total));
    }

    /// Drop hypotheses whose word string already appeared higher up.
    pub fn dedupe(&mut self) -> usize {
        let before = self.hyps.len();
        let mut seen: AHashSet<Vec<VocabIndex>> = AHashSet::new();
        self.hyps.retain(|h| seen.insert(h.words.clone()));
        before - self.hyps.len()
    }

    /// Recombine scores and normalize `total / scale` into posteriors.
    pub fn compute_posteriors(&mut self, lm_weight: f64, word_penalty: f64, scale: f64) {
        let mut norm = LOGP_ZERO;
        for h in &mut self.hyps {
            h.combine(lm_weight, word_penalty);
            norm = add_logp(norm, h.total / scale);
        }
        for h in &mut self.hyps {
            h.posterior = if norm == LOGP_ZERO {
                0.0
            } else {
                prob_of(h.total / scale - norm)
            };
        }
    }

    /// Replace LM scores with `lm`'s sentence probabilities.
    pub fn rescore(&mut self, lm: &dyn LanguageModel) {
        let opts = SentenceOptions::default();
        for h in &mut self.hyps {
            let mut stats = TextStats::default();
            h.lm = lm.sentence_prob(&h.words, &opts, &mut stats);
            h.num_words = h.words.iter().filter(|&&w| !lm.is_non_word(w)).count();
        }
        tracing::debug!(id = %self.id, hyps = self.hyps.len(), "rescored N-best list");
    }

    pub fn write_text<W: Write>(&self, out: &mut W) -> Result<()> {
        for h in &self.hyps {
            write!(out, "{} {} {}", h.acoustic, h.lm, h.num_words)?;
            for &w in &h.words {
                write!(out, " {}", self.vocab.display_word(w))?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    pub fn write_json<W: Write>(&self, out: &mut W) -> Result<()> {
        for (rank, h) in self.hyps.iter().enumerate() {
            let record = JsonHyp {
                id: &self.id,
                rank: rank + 1,
                words: self.vocab.words_of(&h.words),
                acoustic: h.acoustic,
                lm: h.lm,
                num_words: h.num_words,
                total: h.total,
                posterior: h.posterior,
            };
            serde_json::to_writer(&mut *out, &record)?;
            writeln!(out)?;
        }
        Ok(())
    }

    pub fn read_text<R: BufRead>(vocab: &Vocab, input: &mut LineReader<R>, id: impl Into<String>) -> Result<Self> {
        let mut list = NBestList::new(vocab.clone(), id);
        while let Some(line) = input.next_nonblank()? {
            let mut fields = line.split_whitespace();
            let mut score = |what: &str| -> Result<f64> {
                fields
                    .next()
                    .and_then(libngram_core::prob::parse_logp)
                    .ok_or_else(|| input.error(format!("missing or bad {} score", what)).into())
            };
            let acoustic = score("acoustic")?;
            let lm = score("language model")?;
            let num_words = score("word count")?;
            let words: Vec<VocabIndex> = fields.map(|w| vocab.add_word(w)).collect();
            let mut hyp = NBestHyp::new(words, acoustic, lm);
            hyp.num_words = num_words.max(0.0) as usize;
            list.push(hyp);
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libngram_core::NullLm;
    use std::io::Cursor;

    fn list(vocab: &Vocab) -> NBestList {
        let text = "-10 -2 2 a b\n-11 -1 2 a c\n-10 -2 2 a b\n";
        let mut input = LineReader::new(Cursor::new(text), "test.nbest");
        NBestList::read_text(vocab, &mut input, "utt").unwrap()
    }

    #[test]
    fn reads_sorts_and_dedupes() {
        let vocab = Vocab::new();
        let mut nb = list(&vocab);
        assert_eq!(nb.len(), 3);
        nb.compute_posteriors(2.0, 0.0, 1.0);
        nb.sort();
        assert_eq!(vocab.words_of(&nb.hyps[0].words), vec!["a", "c"]);
        assert_eq!(nb.dedupe(), 1);
        assert_eq!(nb.len(), 2);
    }

    #[test]
    fn posteriors_sum_to_one() {
        let vocab = Vocab::new();
        let mut nb = list(&vocab);
        nb.compute_posteriors(1.0, 0.5, 10.0);
        let total: f64 = nb.hyps.iter().map(|h| h.posterior).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((nb.hyps[0].posterior - nb.hyps[2].posterior).abs() < 1e-12);
    }

    #[test]
    fn text_and_json_output() {
        let vocab = Vocab::new();
        let mut nb = list(&vocab);
        nb.rescore(&NullLm::new(vocab.clone()));
        assert_eq!(nb.hyps[0].lm, 0.0);
        let mut text = Vec::new();
        nb.write_text(&mut text).unwrap();
        assert!(String::from_utf8(text).unwrap().starts_with("-10 0 2 a b\n"));

        let mut json = Vec::new();
        nb.write_json(&mut json).unwrap();
        let json = String::from_utf8(json).unwrap();
        let first: serde_json::Value = serde_json::from_str(json.lines().next().unwrap()).unwrap();
        assert_eq!(first["rank"], 1);
        assert_eq!(first["words"][1], "b");
    }

    #[test]
    fn bad_scores_are_positioned() {
        let vocab = Vocab::new();
        let mut input = LineReader::new(Cursor::new("-1 -2 2 a b\n-1 x\n"), "bad.nbest");
        let err = NBestList::read_text(&vocab, &mut input, "bad").unwrap_err();
        assert!(err.to_string().contains("bad.nbest:2"));
    }
}
