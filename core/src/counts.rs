// core/src/counts.rs
//
// N-gram count store. Keys are in sentence order (oldest word first), up to
// a fixed maximum order; every stored n-gram implies its prefixes.

use std::io::{BufRead, Write};

use crate::error::Result;
use crate::file::LineReader;
use crate::trie::Trie;
use crate::vocab::{Vocab, VocabIndex};

pub type Count = u64;

#[derive(Debug, Clone)]
pub struct NgramCounts {
    vocab: Vocab,
    order: usize,
    counts: Trie<Count>,
}

impl NgramCounts {
    pub fn new(vocab: Vocab, order: usize) -> Self {
        Self {
            vocab,
            order: order.max(1),
            counts: Trie::new(),
        }
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn get(&self, ngram: &[VocabIndex]) -> Option<Count> {
        self.counts.find(ngram).map(|n| *self.counts.value(n))
    }

    pub fn set(&mut self, ngram: &[VocabIndex], count: Count) {
        let node = self.counts.insert(ngram);
        *self.counts.value_mut(node) = count;
    }

    pub fn add(&mut self, ngram: &[VocabIndex], count: Count) -> Count {
        let node = self.counts.insert(ngram);
        let c = self.counts.value_mut(node);
        *c += count;
        *c
    }

    /// Remove an n-gram together with all its extensions.
    pub fn remove(&mut self, ngram: &[VocabIndex]) -> bool {
        self.counts.remove(ngram)
    }

    /// Count every n-gram (up to the store's order) of a sentence. Start and
    /// end tags are added unless already present.
    pub fn count_sentence(&mut self, words: &[VocabIndex], factor: Count) -> usize {
        let ss = self.vocab.ss_index();
        let se = self.vocab.se_index();
        let mut sentence = Vec::with_capacity(words.len() + 2);
        if words.first() != Some(&ss) {
            sentence.push(ss);
        }
        sentence.extend_from_slice(words);
        if sentence.last() != Some(&se) {
            sentence.push(se);
        }

        for start in 0..sentence.len() {
            let mut node = self.counts.root();
            for &w in sentence[start..].iter().take(self.order) {
                node = self.counts.insert_child(node, w);
                *self.counts.value_mut(node) += factor;
            }
        }
        sentence.len()
    }

    /// Count a whitespace-tokenized sentence, adding new words to the vocabulary.
    pub fn count_words(&mut self, words: &[&str], factor: Count) -> usize {
        let indices = self.vocab.add_words(words);
        self.count_sentence(&indices, factor)
    }

    /// Count one sentence per line; returns the number of sentences.
    pub fn count_text<R: BufRead>(&mut self, input: &mut LineReader<R>) -> Result<usize> {
        let mut sentences = 0;
        while let Some(line) = input.next_line()? {
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.is_empty() {
                continue;
            }
            self.count_words(&words, 1);
            sentences += 1;
        }
        tracing::info!(sentences, file = input.name(), "counted text");
        Ok(sentences)
    }

    /// All n-grams of exactly `n` words with their counts, in index order.
    pub fn ngrams(&self, n: usize) -> Vec<(Vec<VocabIndex>, Count)> {
        self.counts
            .nodes_at_depth(n)
            .into_iter()
            .map(|(path, node)| (path, *self.counts.value(node)))
            .collect()
    }

    /// Words following `context` (in sentence order) with their counts.
    pub fn followers(&self, context: &[VocabIndex]) -> Vec<(VocabIndex, Count)> {
        match self.counts.find(context) {
            Some(node) => self
                .counts
                .sorted_children(node)
                .into_iter()
                .map(|(w, n)| (w, *self.counts.value(n)))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Histogram of counts of `n`-grams: `result[c]` is the number of
    /// n-grams seen exactly `c` times, for `c <= max_count`. N-grams ending
    /// in a non-event are not counted.
    pub fn count_of_counts(&self, n: usize, max_count: usize) -> Vec<Count> {
        let mut hist = vec![0; max_count + 1];
        for (ngram, count) in self.ngrams(n) {
            if ngram.last().is_some_and(|&w| self.vocab.is_non_event(w)) {
                continue;
            }
            if (count as usize) <= max_count {
                hist[count as usize] += 1;
            }
        }
        hist
    }

    pub fn merge(&mut self, other: &NgramCounts) {
        for n in 1..=other.order.min(self.order) {
            for (ngram, count) in other.ngrams(n) {
                let words: Vec<String> = other.vocab.words_of(&ngram);
                let mapped: Vec<VocabIndex> = words.iter().map(|w| self.vocab.add_word(w)).collect();
                self.add(&mapped, count);
            }
        }
    }

    /// Read `w1 ... wn<TAB>count` lines. N-grams longer than the store's
    /// order are ignored.
    pub fn read<R: BufRead>(&mut self, input: &mut LineReader<R>) -> Result<usize> {
        let mut n = 0;
        while let Some(line) = input.next_line()? {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            let (count_field, words) = match fields.split_last() {
                Some((c, w)) if !w.is_empty() => (c, w),
                _ => return Err(input.error("count line needs words and a count")),
            };
            let count: Count = count_field
                .parse()
                .map_err(|_| input.error(format!("bad count '{}'", count_field)))?;
            if words.len() > self.order {
                continue;
            }
            let indices = self.vocab.add_words(words);
            self.add(&indices, count);
            n += 1;
        }
        Ok(n)
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        for n in 1..=self.order {
            for (ngram, count) in self.ngrams(n) {
                writeln!(out, "{}\t{}", self.vocab.words_of(&ngram).join(" "), count)?;
            }
        }
        Ok(())
    }

    /// Replace counts of order `n < order` by continuation counts: the number
    /// of distinct words seen before each n-gram. N-grams starting with
    /// `<s>` keep their raw counts since nothing can precede them.
    pub fn make_continuation_counts(&mut self, n: usize) {
        if n == 0 || n >= self.order {
            return;
        }
        let ss = self.vocab.ss_index();
        let mut continuation: std::collections::BTreeMap<Vec<VocabIndex>, Count> = Default::default();
        for (ngram, count) in self.ngrams(n + 1) {
            if count > 0 {
                *continuation.entry(ngram[1..].to_vec()).or_default() += 1;
            }
        }
        for (ngram, _) in self.ngrams(n) {
            if ngram.first() == Some(&ss) {
                continue;
            }
            let c = continuation.get(&ngram).copied().unwrap_or(0);
            self.set(&ngram, c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts_of(text: &[&str], order: usize) -> NgramCounts {
        let mut c = NgramCounts::new(Vocab::new(), order);
        for line in text {
            let words: Vec<&str> = line.split_whitespace().collect();
            c.count_words(&words, 1);
        }
        c
    }

    #[test]
    fn counts_sentences_with_tags() {
        let c = counts_of(&["a b", "a c"], 3);
        let v = c.vocab().clone();
        let a = v.get_index("a").unwrap();
        let b = v.get_index("b").unwrap();
        assert_eq!(c.get(&[a]), Some(2));
        assert_eq!(c.get(&[v.ss_index(), a]), Some(2));
        assert_eq!(c.get(&[v.ss_index(), a, b]), Some(1));
        assert_eq!(c.get(&[b, v.se_index()]), Some(1));
        assert_eq!(c.get(&[v.se_index()]), Some(2));
    }

    #[test]
    fn count_of_counts_skips_non_events() {
        let c = counts_of(&["a b", "a c"], 2);
        let hist = c.count_of_counts(1, 3);
        // a:2 b:1 c:1 </s>:2, <s> excluded
        assert_eq!(hist, vec![0, 2, 2, 0]);
    }

    #[test]
    fn text_format_round_trip() {
        let c = counts_of(&["x y z"], 2);
        let mut buf = Vec::new();
        c.write(&mut buf).unwrap();
        let mut back = NgramCounts::new(Vocab::new(), 2);
        back.read(&mut LineReader::new(&buf[..], "counts")).unwrap();
        let v = back.vocab().clone();
        let x = v.get_index("x").unwrap();
        let y = v.get_index("y").unwrap();
        assert_eq!(back.get(&[x, y]), Some(1));
        assert_eq!(back.ngrams(1).len(), c.ngrams(1).len());
    }

    #[test]
    fn rejects_malformed_count() {
        let mut c = NgramCounts::new(Vocab::new(), 2);
        let err = c
            .read(&mut LineReader::new("a b\tmany\n".as_bytes(), "bad.counts"))
            .unwrap_err();
        assert!(err.to_string().starts_with("bad.counts:1:"));
    }

    #[test]
    fn continuation_counts() {
        let mut c = counts_of(&["a x", "b x", "a x"], 2);
        let v = c.vocab().clone();
        let x = v.get_index("x").unwrap();
        assert_eq!(c.get(&[x]), Some(3));
        c.make_continuation_counts(1);
        // x is preceded by a and b
        assert_eq!(c.get(&[x]), Some(2));
    }
}
