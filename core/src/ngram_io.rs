// core/src/ngram_io.rs
//
// Model files. The ARPA text layout is the interchange format; the binary
// layout is a bincode header followed by a bincode body holding the
// model's vocabulary as an fst map and the n-gram records per order, with
// probabilities optionally packed into 8-bit codebooks.

use fst::{Map, Streamer};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;

use ahash::AHashMap;

use crate::error::{LmError, Result};
use crate::file::LineReader;
use crate::ngram::Ngram;
use crate::prob::{parse_logp, LogP, LogPQuantizer, LOGP_PSEUDO_ZERO, LOGP_ZERO};
use crate::vocab::{Vocab, VocabIndex};

pub const BINARY_MAGIC: &str = "NGRAM-BIN";
pub const BINARY_VERSION: u32 = 1;

/// Self-describing prefix of a binary model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryHeader {
    pub magic: String,
    pub version: u32,
    pub order: u32,
    /// Number of n-grams per order, unigrams first.
    pub counts: Vec<u64>,
    pub quantized: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
enum PackedLogP {
    Exact(LogP),
    Code(u8),
}

#[derive(Debug, Serialize, Deserialize)]
struct BinaryRecord {
    /// Sentence order, indices into the embedded vocabulary.
    words: Vec<u32>,
    prob: PackedLogP,
    bow: Option<PackedLogP>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BinaryBody {
    vocab: Vec<u8>,
    prob_codebook: Option<LogPQuantizer>,
    bow_codebook: Option<LogPQuantizer>,
    orders: Vec<Vec<BinaryRecord>>,
}

fn pack(logp: LogP, codebook: Option<&LogPQuantizer>) -> PackedLogP {
    match codebook {
        Some(q) => PackedLogP::Code(q.encode(logp)),
        None => PackedLogP::Exact(logp),
    }
}

fn unpack(packed: PackedLogP, codebook: Option<&LogPQuantizer>, name: &str) -> Result<LogP> {
    match (packed, codebook) {
        (PackedLogP::Exact(p), _) => Ok(p),
        (PackedLogP::Code(c), Some(q)) => Ok(q.decode(c)),
        (PackedLogP::Code(_), None) => Err(LmError::format(name, 0, "quantized value without codebook")),
    }
}

/// ARPA files encode zero probability as -99 (or anything below it).
fn from_arpa_logp(p: LogP) -> LogP {
    if p <= LOGP_PSEUDO_ZERO {
        LOGP_ZERO
    } else {
        p
    }
}

fn fmt_arpa_logp(p: LogP) -> String {
    if p == LOGP_ZERO {
        format!("{}", LOGP_PSEUDO_ZERO)
    } else {
        format!("{}", p)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    Preamble,
    Data,
    Grams(usize),
}

impl Ngram {
    /// Read an ARPA model into a fresh model over `vocab`. With
    /// `limit_vocab`, n-grams containing words unknown to `vocab` are
    /// skipped instead of extending it. Words are added to `vocab` only once
    /// the whole file has parsed; a failed read leaves `vocab` untouched.
    pub fn read_arpa<R: std::io::BufRead>(
        vocab: &Vocab,
        input: &mut LineReader<R>,
        limit_vocab: bool,
    ) -> Result<Ngram> {
        let mut lm = Ngram::new(vocab.clone(), 1);
        let mut declared: Vec<usize> = Vec::new();
        let mut seen: Vec<usize> = Vec::new();
        let mut skipped = 0usize;
        let mut section = Section::Preamble;
        let mut finished = false;
        // Words are numbered locally until the file is known to be good.
        let mut local_ids: AHashMap<String, usize> = AHashMap::new();
        let mut local_words: Vec<String> = Vec::new();
        let mut staged: Vec<(Vec<usize>, LogP, Option<LogP>)> = Vec::new();

        while let Some(line) = input.next_line()? {
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            if text == "\\data\\" {
                if section != Section::Preamble {
                    return Err(input.error("unexpected \\data\\ marker"));
                }
                section = Section::Data;
                continue;
            }
            if text == "\\end\\" {
                if section == Section::Preamble {
                    return Err(input.error("\\end\\ before \\data\\"));
                }
                finished = true;
                break;
            }
            if let Some(marker) = text.strip_prefix('\\') {
                if section == Section::Preamble {
                    continue;
                }
                let n: usize = marker
                    .strip_suffix("-grams:")
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(|| input.error(format!("unknown section '{}'", text)))?;
                if n == 0 || n > declared.len() {
                    return Err(input.error(format!("no count declared for {}-grams", n)));
                }
                section = Section::Grams(n);
                continue;
            }

            match section {
                Section::Preamble => {}
                Section::Data => {
                    let (n, count) = text
                        .strip_prefix("ngram ")
                        .and_then(|rest| rest.split_once('='))
                        .and_then(|(n, c)| Some((n.trim().parse::<usize>().ok()?, c.trim().parse::<usize>().ok()?)))
                        .ok_or_else(|| input.error(format!("expected 'ngram N=count', got '{}'", text)))?;
                    if n == 0 {
                        return Err(input.error("n-gram order 0"));
                    }
                    if declared.len() < n {
                        declared.resize(n, 0);
                        seen.resize(n, 0);
                    }
                    declared[n - 1] = count;
                    lm.order = declared.len();
                }
                Section::Grams(n) => {
                    let mut fields = text.split_whitespace();
                    let prob = fields
                        .next()
                        .and_then(parse_logp)
                        .ok_or_else(|| input.error("bad probability"))?;
                    let rest: Vec<&str> = fields.collect();
                    if rest.len() != n && rest.len() != n + 1 {
                        return Err(input.error(format!("expected {} words, found {} fields", n, rest.len())));
                    }
                    let bow = match rest.get(n) {
                        Some(tok) => Some(parse_logp(tok).ok_or_else(|| input.error(format!("bad backoff weight '{}'", tok)))?),
                        None => None,
                    };
                    if limit_vocab && rest[..n].iter().any(|w| vocab.get_index(w).is_none()) {
                        skipped += 1;
                        continue;
                    }
                    let words: Vec<usize> = rest[..n]
                        .iter()
                        .map(|&w| {
                            *local_ids.entry(w.to_string()).or_insert_with(|| {
                                local_words.push(w.to_string());
                                local_words.len() - 1
                            })
                        })
                        .collect();
                    staged.push((words, from_arpa_logp(prob), bow.map(from_arpa_logp)));
                    seen[n - 1] += 1;
                }
            }
        }

        if !finished {
            return Err(input.error("missing \\end\\ marker"));
        }
        if declared.is_empty() {
            return Err(input.error("no n-gram counts declared"));
        }

        let index: Vec<VocabIndex> = local_words.iter().map(|w| vocab.add_word(w)).collect();
        for (local, prob, bow) in staged {
            let words: Vec<VocabIndex> = local.iter().map(|&i| index[i]).collect();
            let Some((&word, prefix)) = words.split_last() else { continue };
            let context: Vec<VocabIndex> = prefix.iter().rev().copied().collect();
            lm.set_prob(word, &context, prob);
            if let Some(bow) = bow {
                let mut path = Vec::with_capacity(words.len());
                path.push(word);
                path.extend_from_slice(&context);
                lm.set_bow(&path, bow);
            }
        }
        for (i, (&want, &got)) in declared.iter().zip(&seen).enumerate() {
            if want != got && !(limit_vocab && got + skipped >= want) {
                tracing::warn!(file = input.name(), order = i + 1, declared = want, read = got, "n-gram count mismatch");
            }
        }
        tracing::info!(file = input.name(), order = lm.order, skipped, "read model");
        Ok(lm)
    }

    pub fn write_arpa<W: Write>(&self, out: &mut W) -> Result<()> {
        writeln!(out, "\n\\data\\")?;
        for n in 1..=self.order {
            writeln!(out, "ngram {}={}", n, self.num_ngrams(n))?;
        }
        for n in 1..=self.order {
            writeln!(out, "\n\\{}-grams:", n)?;
            for entry in self.ngrams(n) {
                write!(out, "{}\t{}", fmt_arpa_logp(entry.prob), self.vocab.words_of(&entry.words).join(" "))?;
                if n < self.order {
                    if let Some(bow) = entry.bow {
                        write!(out, "\t{}", fmt_arpa_logp(bow))?;
                    }
                }
                writeln!(out)?;
            }
        }
        writeln!(out, "\n\\end\\")?;
        Ok(())
    }

    pub fn write_binary<W: Write>(&self, mut out: W, quantize: bool) -> Result<()> {
        let entries: Vec<_> = (1..=self.order).map(|n| self.ngrams(n)).collect();
        let (prob_codebook, bow_codebook) = if quantize {
            let probs: Vec<LogP> = entries.iter().flatten().map(|e| e.prob).collect();
            let bows: Vec<LogP> = entries.iter().flatten().filter_map(|e| e.bow).collect();
            (Some(LogPQuantizer::build(&probs)), Some(LogPQuantizer::build(&bows)))
        } else {
            (None, None)
        };

        let header = BinaryHeader {
            magic: BINARY_MAGIC.to_string(),
            version: BINARY_VERSION,
            order: self.order as u32,
            counts: entries.iter().map(|e| e.len() as u64).collect(),
            quantized: quantize,
        };
        let orders: Vec<Vec<BinaryRecord>> = entries
            .into_iter()
            .map(|order| {
                order
                    .into_iter()
                    .map(|e| BinaryRecord {
                        words: e.words,
                        prob: pack(e.prob, prob_codebook.as_ref()),
                        bow: e.bow.map(|b| pack(b, bow_codebook.as_ref())),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        let body = BinaryBody {
            vocab: self.vocab.to_fst()?.as_fst().as_bytes().to_vec(),
            prob_codebook,
            bow_codebook,
            orders,
        };

        bincode::serialize_into(&mut out, &header)?;
        bincode::serialize_into(&mut out, &body)?;
        out.flush()?;
        Ok(())
    }

    /// Read a binary model. `name` labels errors.
    pub fn read_binary<R: Read>(vocab: &Vocab, mut input: R, name: &str, limit_vocab: bool) -> Result<Ngram> {
        let header: BinaryHeader = bincode::deserialize_from(&mut input)?;
        if header.magic != BINARY_MAGIC {
            return Err(LmError::format(name, 0, "not a binary n-gram model"));
        }
        if header.version != BINARY_VERSION {
            return Err(LmError::format(name, 0, format!("unsupported binary version {}", header.version)));
        }
        let body: BinaryBody = bincode::deserialize_from(&mut input)?;
        if body.orders.len() != header.order as usize || header.counts.len() != body.orders.len() {
            return Err(LmError::format(name, 0, "header does not match model body"));
        }
        if header.quantized != body.prob_codebook.is_some() {
            return Err(LmError::format(name, 0, "quantization flag does not match codebooks"));
        }

        for (i, records) in body.orders.iter().enumerate() {
            if records.len() as u64 != header.counts[i] {
                return Err(LmError::format(name, 0, format!("order {} holds {} records, header says {}", i + 1, records.len(), header.counts[i])));
            }
        }
        let mut staged = Vec::with_capacity(header.counts.iter().sum::<u64>() as usize);
        for record in body.orders.iter().flatten() {
            if record.words.is_empty() {
                return Err(LmError::format(name, 0, "empty n-gram record"));
            }
            let prob = unpack(record.prob, body.prob_codebook.as_ref(), name)?;
            let bow = match record.bow {
                Some(b) => Some(unpack(b, body.bow_codebook.as_ref(), name)?),
                None => None,
            };
            staged.push((&record.words, prob, bow));
        }

        // The fst is merged into `vocab` only after every record decoded.
        let map = Map::new(body.vocab)?;
        let translation: AHashMap<u64, VocabIndex> = if limit_vocab {
            let mut translation = AHashMap::with_capacity(map.len());
            let mut stream = map.stream();
            while let Some((key, value)) = stream.next() {
                if let Some(index) = vocab.get_index(&String::from_utf8_lossy(key)) {
                    translation.insert(value, index);
                }
            }
            translation
        } else {
            vocab.merge_fst(&map)
        };

        let mut lm = Ngram::new(vocab.clone(), header.order as usize);
        for (record_words, prob, bow) in staged {
            let words: Option<Vec<VocabIndex>> =
                record_words.iter().map(|w| translation.get(&u64::from(*w)).copied()).collect();
            let Some(words) = words else { continue };
            let Some((&word, prefix)) = words.split_last() else { continue };
            let context: Vec<VocabIndex> = prefix.iter().rev().copied().collect();
            lm.set_prob(word, &context, prob);
            if let Some(bow) = bow {
                let mut path = Vec::with_capacity(words.len());
                path.push(word);
                path.extend_from_slice(&context);
                lm.set_bow(&path, bow);
            }
        }
        tracing::info!(file = name, order = lm.order, quantized = header.quantized, "read binary model");
        Ok(lm)
    }

    /// Load a model file, detecting the binary layout by its header.
    pub fn load<P: AsRef<Path>>(path: P, vocab: &Vocab, limit_vocab: bool) -> Result<Ngram> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;

        let is_binary = bincode::deserialize::<BinaryHeader>(&bytes)
            .map(|h| h.magic == BINARY_MAGIC)
            .unwrap_or(false);
        if is_binary {
            Ngram::read_binary(vocab, Cursor::new(bytes), &name, limit_vocab)
        } else {
            let mut reader = LineReader::new(Cursor::new(bytes), name);
            Ngram::read_arpa(vocab, &mut reader, limit_vocab)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P, binary: bool, quantize: bool) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        if binary {
            self.write_binary(&mut writer, quantize)?;
        } else {
            self.write_arpa(&mut writer)?;
            writer.flush()?;
        }
        tracing::info!(file = %path.as_ref().display(), binary, "wrote model");
        Ok(())
    }

    /// Read an ARPA model from a file path.
    pub fn read_arpa_file<P: AsRef<Path>>(path: P, vocab: &Vocab, limit_vocab: bool) -> Result<Ngram> {
        let file = File::open(path.as_ref())?;
        let mut reader = LineReader::new(BufReader::new(file), path.as_ref().display().to_string());
        Ngram::read_arpa(vocab, &mut reader, limit_vocab)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lm::LanguageModel;

    const ARPA: &str = "
\\data\\
ngram 1=5
ngram 2=3

\\1-grams:
-99\t<s>\t-0.30103
-0.5228787\t</s>
-0.69897\ta\t-0.1760913
-0.39794\tb\t-0.2
-1.0\tc

\\2-grams:
-0.1249387\t<s> a
-0.30103\ta b
-0.0457575\tb </s>

\\end\\
";

    fn read(text: &str, vocab: &Vocab, limit: bool) -> Result<Ngram> {
        Ngram::read_arpa(vocab, &mut LineReader::new(text.as_bytes(), "test.lm"), limit)
    }

    fn probe(lm: &Ngram) -> Vec<LogP> {
        let v = lm.vocab();
        let words: Vec<VocabIndex> = ["a", "b", "c", "</s>"].iter().map(|w| v.get_index(w).unwrap()).collect();
        let mut out = Vec::new();
        for &w in &words {
            for &ctx in &words {
                out.push(lm.word_prob(w, &[ctx]));
            }
            out.push(lm.word_prob(w, &[v.ss_index()]));
        }
        out
    }

    #[test]
    fn reads_arpa_with_backoff() {
        let v = Vocab::new();
        let lm = read(ARPA, &v, false).unwrap();
        assert_eq!(lm.order(), 2);
        assert_eq!(lm.num_ngrams(1), 5);
        assert_eq!(lm.num_ngrams(2), 3);
        let a = v.get_index("a").unwrap();
        let c = v.get_index("c").unwrap();
        assert_eq!(lm.find_prob(v.ss_index(), &[]), Some(LOGP_ZERO));
        // c after a backs off: bow(a) + p(c)
        assert!((lm.word_prob(c, &[a]) - (-0.1760913 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn arpa_round_trip_preserves_probabilities() {
        let v = Vocab::new();
        let lm = read(ARPA, &v, false).unwrap();
        let mut buf = Vec::new();
        lm.write_arpa(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("-99\t<s>"));
        let again = read(&text, &v, false).unwrap();
        assert_eq!(probe(&lm), probe(&again));
    }

    #[test]
    fn limit_vocab_skips_unknown_ngrams() {
        let v = Vocab::new();
        v.add_words(&["a", "b"]);
        let lm = read(ARPA, &v, true).unwrap();
        assert!(v.get_index("c").is_none());
        assert_eq!(lm.num_ngrams(1), 4);
        assert_eq!(lm.num_ngrams(2), 3);
    }

    #[test]
    fn format_errors_carry_positions() {
        let bad = "\\data\\\nngram 1=1\n\n\\1-grams:\nhigh a\n\\end\\\n";
        let err = read(bad, &Vocab::new(), false).unwrap_err();
        assert_eq!(err.to_string(), "test.lm:5: bad probability");

        let truncated = "\\data\\\nngram 1=1\n\\1-grams:\n-1 a\n";
        assert!(read(truncated, &Vocab::new(), false).is_err());

        let undeclared = "\\data\\\nngram 1=1\n\\2-grams:\n-1 a b\n\\end\\\n";
        let err = read(undeclared, &Vocab::new(), false).unwrap_err();
        assert!(err.to_string().starts_with("test.lm:3:"));
    }

    #[test]
    fn failed_read_leaves_vocabulary_alone() {
        let v = Vocab::new();
        let before = v.len();
        let truncated = "\\data\\\nngram 1=2\n\\1-grams:\n-1 apple\n-1 pear\n";
        assert!(read(truncated, &v, false).is_err());
        assert_eq!(v.len(), before);
        assert!(v.get_index("apple").is_none());

        let lm = read(ARPA, &v, false).unwrap();
        assert_eq!(lm.num_ngrams(1), 5);
        assert!(v.get_index("c").is_some());
    }

    #[test]
    fn binary_round_trip_is_exact() {
        let v = Vocab::new();
        let lm = read(ARPA, &v, false).unwrap();
        let mut buf = Vec::new();
        lm.write_binary(&mut buf, false).unwrap();

        let fresh = Vocab::new();
        fresh.add_word("unrelated");
        let back = Ngram::read_binary(&fresh, &buf[..], "mem", false).unwrap();
        assert_eq!(back.order(), 2);
        assert_eq!(probe(&lm), probe(&back));
    }

    #[test]
    fn quantized_binary_is_close() {
        let v = Vocab::new();
        let lm = read(ARPA, &v, false).unwrap();
        let mut buf = Vec::new();
        lm.write_binary(&mut buf, true).unwrap();
        let back = Ngram::read_binary(&Vocab::new(), &buf[..], "mem", false).unwrap();
        // fewer distinct values than codes: lossless
        for (a, b) in probe(&lm).into_iter().zip(probe(&back)) {
            assert!((a - b).abs() < 1e-9, "{} vs {}", a, b);
        }
    }

    #[test]
    fn load_detects_format() {
        let v = Vocab::new();
        let lm = read(ARPA, &v, false).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let text_path = dir.path().join("model.arpa");
        let bin_path = dir.path().join("model.bin");
        lm.save(&text_path, false, false).unwrap();
        lm.save(&bin_path, true, false).unwrap();

        let from_text = Ngram::load(&text_path, &Vocab::new(), false).unwrap();
        let from_bin = Ngram::load(&bin_path, &Vocab::new(), false).unwrap();
        assert_eq!(probe(&from_text), probe(&from_bin));
    }
}
