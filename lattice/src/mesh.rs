// lattice/src/mesh.rs
//
// Word meshes ("sausages"): a sequence of columns, each a distribution over
// alternative words including the empty word. Hypotheses are aligned into
// the mesh one at a time by dynamic programming against the column
// distributions accumulated so far.
//
// Text form:
//
//   name NAME
//   numaligns N
//   posterior TOTAL
//   align K w1 p1 w2 p2 ...

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use libngram_core::prob::{add_logp, log_of, prob_of};
use libngram_core::{LineReader, LogP, Prob, Vocab, VocabIndex, LOGP_ZERO, VOCAB_NONE};

use crate::deadline::Deadline;
use crate::error::Result;
use crate::graph::{Lattice, LatticeTransition, NodeIndex};

/// Spelling of the empty word in mesh files.
pub const DELETE_WORD: &str = "*DELETE*";

#[derive(Debug, Clone)]
pub struct WordMesh {
    name: String,
    vocab: Vocab,
    columns: Vec<BTreeMap<VocabIndex, Prob>>,
    total_weight: Prob,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Move {
    Match,
    Skip,
    Insert,
}

impl WordMesh {
    pub fn new(vocab: Vocab, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vocab,
            columns: Vec::new(),
            total_weight: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn total_weight(&self) -> Prob {
        self.total_weight
    }

    /// Normalized distribution of column `i`.
    pub fn column(&self, i: usize) -> Vec<(VocabIndex, Prob)> {
        let Some(col) = self.columns.get(i) else { return Vec::new() };
        let norm = if self.total_weight > 0.0 { self.total_weight } else { 1.0 };
        col.iter().map(|(&w, &p)| (w, p / norm)).collect()
    }

    fn share(&self, col: usize, word: VocabIndex) -> Prob {
        if self.total_weight <= 0.0 {
            return 0.0;
        }
        self.columns[col].get(&word).copied().unwrap_or(0.0) / self.total_weight
    }

    /// Align `words` into the mesh with weight `weight`.
    pub fn align_words(&mut self, words: &[VocabIndex], weight: Prob) {
        let n = self.columns.len();
        let m = words.len();
        let mut cost = vec![vec![f64::INFINITY; m + 1]; n + 1];
        let mut back = vec![vec![Move::Match; m + 1]; n + 1];
        cost[0][0] = 0.0;
        for i in 0..=n {
            for j in 0..=m {
                if i == 0 && j == 0 {
                    continue;
                }
                let mut best = (f64::INFINITY, Move::Match);
                if i > 0 && j > 0 {
                    let c = cost[i - 1][j - 1] + 1.0 - self.share(i - 1, words[j - 1]);
                    best = (c, Move::Match);
                }
                if i > 0 {
                    let c = cost[i - 1][j] + 1.0 - self.share(i - 1, VOCAB_NONE);
                    if c < best.0 {
                        best = (c, Move::Skip);
                    }
                }
                if j > 0 {
                    let c = cost[i][j - 1] + 1.0;
                    if c < best.0 {
                        best = (c, Move::Insert);
                    }
                }
                cost[i][j] = best.0;
                back[i][j] = best.1;
            }
        }

        let mut moves = Vec::with_capacity(n + m);
        let (mut i, mut j) = (n, m);
        while i > 0 || j > 0 {
            let mv = back[i][j];
            moves.push(mv);
            match mv {
                Move::Match => {
                    i -= 1;
                    j -= 1;
                }
                Move::Skip => i -= 1,
                Move::Insert => j -= 1,
            }
        }
        moves.reverse();

        let prior = self.total_weight;
        let mut columns = Vec::with_capacity(n + m);
        let mut old = std::mem::take(&mut self.columns).into_iter();
        let mut w = words.iter();
        for mv in moves {
            match mv {
                Move::Match => {
                    let (Some(mut col), Some(&word)) = (old.next(), w.next()) else { break };
                    *col.entry(word).or_default() += weight;
                    columns.push(col);
                }
                Move::Skip => {
                    let Some(mut col) = old.next() else { break };
                    *col.entry(VOCAB_NONE).or_default() += weight;
                    columns.push(col);
                }
                Move::Insert => {
                    let Some(&word) = w.next() else { break };
                    let mut col = BTreeMap::new();
                    col.insert(word, weight);
                    if prior > 0.0 {
                        col.insert(VOCAB_NONE, prior);
                    }
                    columns.push(col);
                }
            }
        }
        self.columns = columns;
        self.total_weight += weight;
    }

    /// Minimum Bayes risk hypothesis: the most probable entry of every
    /// column, with empty words dropped. Returns the words and their
    /// posteriors.
    pub fn mbr_words(&self) -> Vec<(VocabIndex, Prob)> {
        (0..self.columns.len())
            .filter_map(|i| {
                self.column(i)
                    .into_iter()
                    .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)))
                    .filter(|&(w, _)| w != VOCAB_NONE)
            })
            .collect()
    }

    /// Expected number of word errors of the MBR hypothesis.
    pub fn expected_errors(&self) -> f64 {
        (0..self.columns.len())
            .map(|i| {
                let best = self.column(i).into_iter().map(|(_, p)| p).fold(0.0, f64::max);
                1.0 - best
            })
            .sum()
    }

    /// Build a mesh from the `nbest` best lattice paths, each weighted by
    /// its posterior under `scale`. Posteriors are renormalized over those
    /// paths only, so column probabilities (and the MBR words read from
    /// them) approximate the full lattice posteriors whenever the lattice
    /// holds more than `nbest` paths.
    pub fn from_lattice(lat: &Lattice, nbest: usize, scale: f64, deadline: &Deadline) -> Result<Self> {
        let paths = lat.compute_nbest_viterbi(nbest, deadline)?;
        let norm = paths.iter().fold(LOGP_ZERO, |acc, (s, _)| add_logp(acc, s / scale));
        let mut mesh = WordMesh::new(lat.vocab().clone(), lat.name());
        for (score, path) in &paths {
            deadline.check()?;
            let weight = prob_of(score / scale - norm);
            mesh.align_words(&lat.path_words(path), weight);
        }
        tracing::debug!(lattice = %lat.name(), paths = paths.len(), columns = mesh.len(), "built word mesh");
        Ok(mesh)
    }

    /// A lattice with one null node between columns and one word node per
    /// column entry; deletions become direct transitions.
    pub fn to_lattice(&self) -> Lattice {
        let mut lat = Lattice::new(self.vocab.clone(), self.name.clone());
        let mut prev: NodeIndex = lat.initial();
        for i in 0..self.columns.len() {
            let next = if i + 1 == self.columns.len() {
                lat.final_node()
            } else {
                lat.add_node(VOCAB_NONE)
            };
            for (w, p) in self.column(i) {
                let weight: LogP = log_of(p);
                if w == VOCAB_NONE {
                    lat.insert_trans(prev, next, LatticeTransition::new(weight));
                } else {
                    let node = lat.add_node(w);
                    lat.insert_trans(prev, node, LatticeTransition::new(weight));
                    lat.insert_trans(node, next, LatticeTransition::new(libngram_core::LOGP_ONE));
                }
            }
            prev = next;
        }
        if self.columns.is_empty() {
            lat.insert_trans(lat.initial(), lat.final_node(), LatticeTransition::new(libngram_core::LOGP_ONE));
        }
        lat
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "name {}", self.name)?;
        writeln!(out, "numaligns {}", self.columns.len())?;
        writeln!(out, "posterior {}", self.total_weight)?;
        for (i, col) in self.columns.iter().enumerate() {
            write!(out, "align {}", i)?;
            for (&w, &p) in col {
                match w {
                    VOCAB_NONE => write!(out, " {} {}", DELETE_WORD, p)?,
                    _ => write!(out, " {} {}", self.vocab.display_word(w), p)?,
                }
            }
            writeln!(out)?;
        }
        Ok(())
    }

    pub fn read<R: BufRead>(vocab: &Vocab, input: &mut LineReader<R>) -> Result<Self> {
        let mut mesh = WordMesh::new(vocab.clone(), input.name());
        let mut declared: Option<usize> = None;
        while let Some(line) = input.next_nonblank()? {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields[0] {
                "name" => mesh.name = fields[1..].join(" "),
                "numaligns" => {
                    declared = Some(
                        fields
                            .get(1)
                            .and_then(|n| n.parse().ok())
                            .ok_or_else(|| input.error("bad numaligns"))?,
                    );
                }
                "posterior" => {
                    mesh.total_weight = fields
                        .get(1)
                        .and_then(|n| n.parse().ok())
                        .ok_or_else(|| input.error("bad posterior"))?;
                }
                "align" => {
                    let k: usize = fields
                        .get(1)
                        .and_then(|n| n.parse().ok())
                        .ok_or_else(|| input.error("bad alignment position"))?;
                    if k != mesh.columns.len() {
                        return Err(input.error(format!("alignment {} out of sequence", k)).into());
                    }
                    if fields.len() % 2 != 0 {
                        return Err(input.error("alignment needs word/posterior pairs").into());
                    }
                    let mut col = BTreeMap::new();
                    for pair in fields[2..].chunks(2) {
                        let w = match pair[0] {
                            DELETE_WORD => VOCAB_NONE,
                            word => vocab.add_word(word),
                        };
                        let p: Prob = pair[1]
                            .parse()
                            .map_err(|_| input.error(format!("bad posterior '{}'", pair[1])))?;
                        *col.entry(w).or_default() += p;
                    }
                    mesh.columns.push(col);
                }
                other => {
                    tracing::debug!(file = input.name(), line = input.line_no(), key = other, "ignored mesh field");
                }
            }
        }
        if let Some(n) = declared {
            if n != mesh.columns.len() {
                return Err(input
                    .error(format!("{} alignments declared, {} found", n, mesh.columns.len()))
                    .into());
            }
        }
        Ok(mesh)
    }
}

/// Substitutions, insertions and deletions turning `reference` into
/// `hyp` at minimum total cost.
pub fn word_errors(hyp: &[VocabIndex], reference: &[VocabIndex]) -> (usize, usize, usize) {
    let (n, m) = (reference.len(), hyp.len());
    // (cost, subs, ins, dels)
    let mut table = vec![vec![(0usize, 0usize, 0usize, 0usize); m + 1]; n + 1];
    for i in 1..=n {
        table[i][0] = (i, 0, 0, i);
    }
    for j in 1..=m {
        table[0][j] = (j, 0, j, 0);
    }
    for i in 1..=n {
        for j in 1..=m {
            let (c, s, ins, d) = table[i - 1][j - 1];
            let same = reference[i - 1] == hyp[j - 1];
            let mut best = if same { (c, s, ins, d) } else { (c + 1, s + 1, ins, d) };
            let (c, s, ins, d) = table[i - 1][j];
            if c + 1 < best.0 {
                best = (c + 1, s, ins, d + 1);
            }
            let (c, s, ins, d) = table[i][j - 1];
            if c + 1 < best.0 {
                best = (c + 1, s, ins + 1, d);
            }
            table[i][j] = best;
        }
    }
    let (_, s, i, d) = table[n][m];
    (s, i, d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::diamond;
    use std::io::Cursor;

    fn ids(vocab: &Vocab, text: &str) -> Vec<VocabIndex> {
        text.split_whitespace().map(|w| vocab.add_word(w)).collect()
    }

    #[test]
    fn aligns_substitutions_and_deletions() {
        let vocab = Vocab::new();
        let mut mesh = WordMesh::new(vocab.clone(), "m");
        mesh.align_words(&ids(&vocab, "a b c"), 0.6);
        mesh.align_words(&ids(&vocab, "a x c"), 0.3);
        mesh.align_words(&ids(&vocab, "a c"), 0.1);
        assert_eq!(mesh.len(), 3);
        let b = vocab.get_index("b").unwrap();
        let col = mesh.column(1);
        let pb = col.iter().find(|(w, _)| *w == b).unwrap().1;
        let pdel = col.iter().find(|(w, _)| *w == VOCAB_NONE).unwrap().1;
        assert!((pb - 0.6).abs() < 1e-12);
        assert!((pdel - 0.1).abs() < 1e-12);
        let words: Vec<VocabIndex> = mesh.mbr_words().into_iter().map(|(w, _)| w).collect();
        assert_eq!(words, ids(&vocab, "a b c"));
        assert!((mesh.expected_errors() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn insertions_open_new_columns() {
        let vocab = Vocab::new();
        let mut mesh = WordMesh::new(vocab.clone(), "m");
        mesh.align_words(&ids(&vocab, "a c"), 0.5);
        mesh.align_words(&ids(&vocab, "a b c"), 0.5);
        assert_eq!(mesh.len(), 3);
        let col = mesh.column(1);
        assert!(col.iter().any(|&(w, p)| w == VOCAB_NONE && (p - 0.5).abs() < 1e-12));
    }

    #[test]
    fn lattice_to_mesh_and_back() {
        let vocab = Vocab::new();
        let lat = diamond(&vocab, 0.3, 0.7);
        let mesh = WordMesh::from_lattice(&lat, 10, 1.0, &Deadline::none()).unwrap();
        assert_eq!(mesh.len(), 2);
        let mbr: Vec<VocabIndex> = mesh.mbr_words().into_iter().map(|(w, _)| w).collect();
        assert_eq!(mbr, ids(&vocab, "c d"));
        let back = mesh.to_lattice();
        back.check().unwrap();
        let total = back.forward_backward(1.0, &Deadline::none()).unwrap().total;
        assert!(total.abs() < 1e-9);
    }

    #[test]
    fn truncated_path_list_renormalizes_posteriors() {
        let vocab = Vocab::new();
        let lat = diamond(&vocab, 0.3, 0.7);
        let c = vocab.get_index("c").unwrap();
        let full = WordMesh::from_lattice(&lat, 10, 1.0, &Deadline::none()).unwrap();
        let pc = full.column(0).into_iter().find(|&(w, _)| w == c).unwrap().1;
        assert!((pc - 0.7).abs() < 1e-9);

        let one = WordMesh::from_lattice(&lat, 1, 1.0, &Deadline::none()).unwrap();
        assert_eq!(one.column(0).len(), 1);
        let pc = one.column(0).into_iter().find(|&(w, _)| w == c).unwrap().1;
        assert!((pc - 1.0).abs() < 1e-9);
    }

    #[test]
    fn file_round_trip() {
        let vocab = Vocab::new();
        let mut mesh = WordMesh::new(vocab.clone(), "utt");
        mesh.align_words(&ids(&vocab, "a b"), 0.75);
        mesh.align_words(&ids(&vocab, "a"), 0.25);
        let mut out = Vec::new();
        mesh.write(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(DELETE_WORD));
        let mut input = LineReader::new(Cursor::new(text), "utt.mesh");
        let copy = WordMesh::read(&vocab, &mut input).unwrap();
        assert_eq!(copy.name(), "utt");
        assert_eq!(copy.len(), 2);
        assert_eq!(copy.column(1), mesh.column(1));
    }

    #[test]
    fn counts_word_errors() {
        let vocab = Vocab::new();
        let reference = ids(&vocab, "the cat sat on the mat");
        let hyp = ids(&vocab, "the cat sat in the the mat");
        assert_eq!(word_errors(&hyp, &reference), (1, 1, 0));
        assert_eq!(word_errors(&[], &reference), (0, 0, 6));
    }
}
