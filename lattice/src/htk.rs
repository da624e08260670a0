// lattice/src/htk.rs
//
// HTK Standard Lattice Format. Scores in the file are logs in the header's
// base (e by default); they are stored on nodes converted to base 10 and
// combined into transition weights with the header scales:
//
//   weight = (acscale*a + lmscale*l + ngscale*n + prscale*r + duscale*ds
//             + sum(xscale_i * x_i) + wdpenalty) * log10(base)
//
// Words may sit on nodes (node scores then count on every incoming link)
// or on links (each link becomes a node of its own).

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use libngram_core::{LineReader, LogP, Vocab, LOGP_ONE, VOCAB_NONE};
use serde::{Deserialize, Serialize};

use crate::error::{LatticeError, Result};
use crate::graph::{HtkWordInfo, Lattice, LatticeTransition, NodeIndex};

pub const HTK_NULL_WORD: &str = "!NULL";
pub const NUM_X_SCORES: usize = 9;

/// Header parameters: score scales, word penalty and log base.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HtkHeader {
    pub acscale: f64,
    pub lmscale: f64,
    pub ngscale: f64,
    pub prscale: f64,
    pub duscale: f64,
    pub wdpenalty: f64,
    pub xscales: [f64; NUM_X_SCORES],
    pub logbase: f64,
}

impl Default for HtkHeader {
    fn default() -> Self {
        Self {
            acscale: 1.0,
            lmscale: 1.0,
            ngscale: 0.0,
            prscale: 0.0,
            duscale: 0.0,
            wdpenalty: 0.0,
            xscales: [0.0; NUM_X_SCORES],
            logbase: std::f64::consts::E,
        }
    }
}

impl HtkHeader {
    fn log10_base(&self) -> f64 {
        self.logbase.log10()
    }

    /// Combined base-10 weight of a set of scores already in base 10.
    pub fn combine(&self, info: &HtkWordInfo, is_word: bool) -> LogP {
        let mut total = self.acscale * info.acoustic.unwrap_or(0.0)
            + self.lmscale * info.language.unwrap_or(0.0)
            + self.ngscale * info.ngram.unwrap_or(0.0)
            + self.prscale * info.pron.unwrap_or(0.0)
            + self.duscale * info.duration.unwrap_or(0.0);
        for (scale, x) in self.xscales.iter().zip(info.x_scores.iter()) {
            total += scale * x.unwrap_or(0.0);
        }
        if is_word {
            total += self.wdpenalty * self.log10_base();
        }
        total
    }
}

/// Which score field receives the transition weight on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HtkScoreMapping {
    /// Write the scores kept on the nodes and ignore transition weights.
    None,
    Acoustic,
    Ngram,
    #[default]
    Language,
}

/// Fields of one `key=value` line.
fn fields(line: &str) -> Vec<(&str, &str)> {
    line.split_whitespace()
        .filter_map(|f| f.split_once('='))
        .map(|(k, v)| (k, v.trim_matches('"')))
        .collect()
}

fn parse_f64<R: BufRead>(input: &LineReader<R>, key: &str, value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .map_err(|_| input.error(format!("bad value '{}' for {}", value, key)).into())
}

fn parse_index<R: BufRead>(input: &LineReader<R>, key: &str, value: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .map_err(|_| input.error(format!("bad index '{}' for {}", value, key)).into())
}

/// Fill a score field from `key=value`. Returns false for unknown keys.
fn set_score(info: &mut HtkWordInfo, key: &str, value: f64, to_base10: f64) -> bool {
    let slot = match key {
        "a" => &mut info.acoustic,
        "l" => &mut info.language,
        "n" => &mut info.ngram,
        "r" => &mut info.pron,
        "ds" => &mut info.duration,
        "p" => {
            info.posterior = Some(value);
            return true;
        }
        "t" => {
            info.time = Some(value);
            return true;
        }
        _ => match key.strip_prefix('x').and_then(|n| n.parse::<usize>().ok()) {
            Some(n) if (1..=NUM_X_SCORES).contains(&n) => &mut info.x_scores[n - 1],
            _ => return false,
        },
    };
    *slot = Some(value * to_base10);
    true
}

struct HtkLink {
    start: Option<usize>,
    end: Option<usize>,
    word: Option<String>,
    info: HtkWordInfo,
}

fn header_value<R: BufRead>(input: &LineReader<R>, header: &mut HtkHeader, key: &str, value: &str) -> Result<bool> {
    let slot = match key {
        "acscale" => &mut header.acscale,
        "lmscale" => &mut header.lmscale,
        "ngscale" => &mut header.ngscale,
        "prscale" => &mut header.prscale,
        "duscale" => &mut header.duscale,
        "wdpenalty" => &mut header.wdpenalty,
        "base" => &mut header.logbase,
        _ => match key
            .strip_prefix('x')
            .and_then(|k| k.strip_suffix("scale"))
            .and_then(|n| n.parse::<usize>().ok())
        {
            Some(n) if (1..=NUM_X_SCORES).contains(&n) => &mut header.xscales[n - 1],
            _ => return Ok(false),
        },
    };
    *slot = parse_f64(input, key, value)?;
    Ok(true)
}

/// Read one HTK lattice. Header values in the file replace those in
/// `defaults`; the effective header is returned with the lattice.
pub fn read_htk<R: BufRead>(
    vocab: &Vocab,
    input: &mut LineReader<R>,
    defaults: &HtkHeader,
) -> Result<(Lattice, HtkHeader)> {
    let mut header = *defaults;
    let mut name = input.name().to_string();
    let mut start: Option<usize> = None;
    let mut end: Option<usize> = None;
    let mut num_nodes: Option<usize> = None;
    let mut num_links: Option<usize> = None;
    let mut nodes: BTreeMap<usize, (Option<String>, HtkWordInfo)> = BTreeMap::new();
    let mut links: Vec<HtkLink> = Vec::new();

    while let Some(line) = input.next_line()? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let kv = fields(line);
        let Some(&(first, first_value)) = kv.first() else {
            return Err(input.error(format!("unparseable line '{}'", line)).into());
        };
        match first {
            "I" => {
                let id = parse_index(input, first, first_value)?;
                let mut word = None;
                let mut info = HtkWordInfo::default();
                for &(k, v) in &kv[1..] {
                    match k {
                        "W" => word = Some(v.to_string()),
                        "v" | "s" | "L" | "d" => {}
                        _ => {
                            let value = parse_f64(input, k, v)?;
                            if !set_score(&mut info, k, value, header.log10_base()) {
                                tracing::debug!(file = input.name(), line = input.line_no(), key = k, "ignored node field");
                            }
                        }
                    }
                }
                nodes.insert(id, (word, info));
            }
            "J" => {
                let mut link = HtkLink {
                    start: None,
                    end: None,
                    word: None,
                    info: HtkWordInfo::default(),
                };
                for &(k, v) in &kv[1..] {
                    match k {
                        "S" => link.start = Some(parse_index(input, k, v)?),
                        "E" => link.end = Some(parse_index(input, k, v)?),
                        "W" => link.word = Some(v.to_string()),
                        "v" | "d" => {}
                        _ => {
                            let value = parse_f64(input, k, v)?;
                            if !set_score(&mut link.info, k, value, header.log10_base()) {
                                tracing::debug!(file = input.name(), line = input.line_no(), key = k, "ignored link field");
                            }
                        }
                    }
                }
                if link.start.is_none() || link.end.is_none() {
                    return Err(input.error("link without S= or E=").into());
                }
                links.push(link);
            }
            _ => {
                for &(k, v) in &kv {
                    match k {
                        "UTTERANCE" => name = v.to_string(),
                        "start" => start = Some(parse_index(input, k, v)?),
                        "end" => end = Some(parse_index(input, k, v)?),
                        "N" => num_nodes = Some(parse_index(input, k, v)?),
                        "L" => num_links = Some(parse_index(input, k, v)?),
                        "VERSION" | "lmname" | "vocab" | "hmms" => {}
                        _ => {
                            if !header_value(input, &mut header, k, v)? {
                                tracing::debug!(file = input.name(), key = k, "ignored header field");
                            }
                        }
                    }
                }
                if header.logbase <= 0.0 || header.logbase == 1.0 {
                    return Err(input.error(format!("unsupported log base {}", header.logbase)).into());
                }
            }
        }
    }

    if let Some(n) = num_nodes {
        if n != nodes.len() {
            tracing::warn!(file = input.name(), declared = n, found = nodes.len(), "node count mismatch");
        }
    }
    if let Some(l) = num_links {
        if l != links.len() {
            tracing::warn!(file = input.name(), declared = l, found = links.len(), "link count mismatch");
        }
    }
    for link in &links {
        if let (Some(s), Some(e)) = (link.start, link.end) {
            if !nodes.contains_key(&s) || !nodes.contains_key(&e) {
                return Err(LatticeError::malformed(
                    &name,
                    format!("link {} -> {} refers to an undefined node", s, e),
                ));
            }
        }
    }
    for (what, id) in [("start", start), ("end", end)] {
        if let Some(id) = id.filter(|id| !nodes.contains_key(id)) {
            return Err(LatticeError::malformed(&name, format!("{} node {} is not defined", what, id)));
        }
    }

    let lat = build(vocab, name, &header, &nodes, &links, start, end)?;
    tracing::debug!(
        lattice = %lat.name(),
        nodes = lat.num_nodes(),
        transitions = lat.num_transitions(),
        "read HTK lattice"
    );
    Ok((lat, header))
}

fn word_index(vocab: &Vocab, word: Option<&str>) -> libngram_core::VocabIndex {
    match word {
        None | Some(HTK_NULL_WORD) => VOCAB_NONE,
        Some(w) => vocab.add_word(w),
    }
}

fn build(
    vocab: &Vocab,
    name: String,
    header: &HtkHeader,
    nodes: &BTreeMap<usize, (Option<String>, HtkWordInfo)>,
    links: &[HtkLink],
    start: Option<usize>,
    end: Option<usize>,
) -> Result<Lattice> {
    let words_on_links = links.iter().any(|l| l.word.is_some());
    let mut lat = Lattice::empty(vocab.clone(), name);
    // SLF ids may be sparse; nodes are numbered densely in id order.
    let mut index: BTreeMap<usize, NodeIndex> = BTreeMap::new();
    for (&id, (word, info)) in nodes {
        let word = if words_on_links {
            VOCAB_NONE
        } else {
            word_index(vocab, word.as_deref())
        };
        let i = lat.add_node(word);
        if let Some(node) = lat.node_mut(i) {
            node.htk = Some(Box::new(*info));
        }
        index.insert(id, i);
    }
    let lat_name = lat.name().to_string();
    let node_of = |id: Option<usize>| -> Result<NodeIndex> {
        id.and_then(|id| index.get(&id).copied())
            .ok_or_else(|| LatticeError::malformed(&lat_name, "reference to an undefined node"))
    };

    for link in links {
        let (from, to) = (node_of(link.start)?, node_of(link.end)?);
        let (target_word, target_info) = link
            .end
            .and_then(|e| nodes.get(&e))
            .map(|(w, i)| (w.as_deref(), *i))
            .unwrap_or((None, HtkWordInfo::default()));
        if words_on_links {
            let word = word_index(vocab, link.word.as_deref());
            let mid = lat.add_node(word);
            let mut info = link.info;
            info.time = info.time.or(target_info.time);
            let weight = header.combine(&link.info, word != VOCAB_NONE) + header.combine(&target_info, false);
            if let Some(node) = lat.node_mut(mid) {
                node.htk = Some(Box::new(info));
            }
            lat.insert_trans(from, mid, LatticeTransition::new(weight));
            lat.insert_trans(mid, to, LatticeTransition::new(LOGP_ONE));
        } else {
            let is_word = !matches!(target_word, None | Some(HTK_NULL_WORD));
            let weight = header.combine(&link.info, false) + header.combine(&target_info, is_word);
            lat.insert_trans(from, to, LatticeTransition::new(weight));
        }
    }

    let initial = match start {
        Some(_) => node_of(start)?,
        None => end_point(&mut lat, true)?,
    };
    let final_node = match end {
        Some(_) => node_of(end)?,
        None => end_point(&mut lat, false)?,
    };
    lat.set_initial(initial);
    lat.set_final(final_node);
    Ok(lat)
}

/// The unique node without predecessors (or successors), or a new null
/// node joined to all of them.
fn end_point(lat: &mut Lattice, initial: bool) -> Result<NodeIndex> {
    let candidates: Vec<NodeIndex> = lat
        .node_indices()
        .filter(|&i| {
            lat.node(i)
                .is_some_and(|n| if initial { n.in_degree() == 0 } else { n.out_degree() == 0 })
        })
        .collect();
    match candidates.as_slice() {
        [] => Err(LatticeError::malformed(
            lat.name(),
            if initial { "no start node" } else { "no end node" },
        )),
        [one] => Ok(*one),
        many => {
            let joined = lat.add_node(VOCAB_NONE);
            for &i in many {
                if initial {
                    lat.insert_trans(joined, i, LatticeTransition::new(LOGP_ONE));
                } else {
                    lat.insert_trans(i, joined, LatticeTransition::new(LOGP_ONE));
                }
            }
            Ok(joined)
        }
    }
}

fn score_field(key: &str, value: Option<f64>, out: &mut String) {
    if let Some(v) = value {
        out.push_str(&format!(" {}={}", key, v));
    }
}

/// Write a lattice in HTK format with words on nodes and base-10 scores.
pub fn write_htk<W: Write>(lat: &Lattice, header: &HtkHeader, mapping: HtkScoreMapping, out: &mut W) -> Result<()> {
    let mut map = vec![0usize; lat.max_index()];
    let live: Vec<NodeIndex> = lat.node_indices().collect();
    for (new, &old) in live.iter().enumerate() {
        map[old] = new;
    }

    writeln!(out, "VERSION=1.1")?;
    writeln!(out, "UTTERANCE={}", lat.name())?;
    writeln!(out, "base=10")?;
    write!(
        out,
        "acscale={} lmscale={} ngscale={} prscale={} duscale={} wdpenalty={}",
        header.acscale,
        header.lmscale,
        header.ngscale,
        header.prscale,
        header.duscale,
        header.wdpenalty * header.logbase.log10()
    )?;
    for (i, x) in header.xscales.iter().enumerate() {
        if *x != 0.0 {
            write!(out, " x{}scale={}", i + 1, x)?;
        }
    }
    writeln!(out)?;
    writeln!(out, "start={} end={}", map[lat.initial()], map[lat.final_node()])?;
    writeln!(out, "N={} L={}", live.len(), lat.num_transitions())?;

    for &i in &live {
        let mut line = format!("I={}", map[i]);
        let info = lat.node(i).and_then(|n| n.htk.as_deref()).copied().unwrap_or_default();
        score_field("t", info.time, &mut line);
        match lat.word(i) {
            VOCAB_NONE => line.push_str(&format!(" W={}", HTK_NULL_WORD)),
            w => line.push_str(&format!(" W={}", lat.vocab().display_word(w))),
        }
        writeln!(out, "{}", line)?;
    }

    let mut link = 0usize;
    for &i in &live {
        for (j, t) in lat.successors(i) {
            let mut line = format!("J={} S={} E={}", link, map[i], map[j]);
            let target = lat.node(j).and_then(|n| n.htk.as_deref()).copied().unwrap_or_default();
            match mapping {
                HtkScoreMapping::None => {
                    score_field("a", target.acoustic, &mut line);
                    score_field("n", target.ngram, &mut line);
                    score_field("l", target.language, &mut line);
                    score_field("r", target.pron, &mut line);
                    score_field("ds", target.duration, &mut line);
                    for (k, x) in target.x_scores.iter().enumerate() {
                        score_field(&format!("x{}", k + 1), *x, &mut line);
                    }
                }
                HtkScoreMapping::Acoustic => score_field("a", Some(t.weight), &mut line),
                HtkScoreMapping::Ngram => score_field("n", Some(t.weight), &mut line),
                HtkScoreMapping::Language => score_field("l", Some(t.weight), &mut line),
            }
            score_field("p", lat.node(j).map(|n| n.posterior), &mut line);
            writeln!(out, "{}", line)?;
            link += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SLF: &str = "VERSION=1.0
UTTERANCE=utt1
lmscale=10.0 wdpenalty=0.0
N=4 L=4
I=0 t=0.00 W=!NULL
I=1 t=0.50 W=hello
I=2 t=0.60 W=yellow
I=3 t=1.00 W=!NULL
J=0 S=0 E=1 a=-100.0 l=-2.0
J=1 S=0 E=2 a=-110.0 l=-3.0
J=2 S=1 E=3 a=0 l=0
J=3 S=2 E=3 a=0 l=0
";

    #[test]
    fn combines_scores_into_weights() {
        let vocab = Vocab::new();
        let mut input = LineReader::new(Cursor::new(SLF), "utt1.slf");
        let (lat, header) = read_htk(&vocab, &mut input, &HtkHeader::default()).unwrap();
        assert_eq!(lat.name(), "utt1");
        assert_eq!(header.lmscale, 10.0);
        assert_eq!(lat.initial(), 0);
        assert_eq!(lat.final_node(), 3);
        let expected = (-100.0 + 10.0 * -2.0) * std::f64::consts::E.log10();
        assert!((lat.find_trans(0, 1).unwrap().weight - expected).abs() < 1e-9);
        assert_eq!(lat.node(1).unwrap().htk.as_ref().unwrap().time, Some(0.5));
        lat.check().unwrap();
    }

    #[test]
    fn words_on_links_become_nodes() {
        let text = "UTTERANCE=links\nN=2 L=2\nI=0\nI=1\nJ=0 S=0 E=1 W=a l=-1\nJ=1 S=0 E=1 W=b l=-2\n";
        let vocab = Vocab::new();
        let mut input = LineReader::new(Cursor::new(text), "links.slf");
        let (lat, _) = read_htk(&vocab, &mut input, &HtkHeader::default()).unwrap();
        assert_eq!(lat.num_nodes(), 4);
        assert!(lat.is_null(lat.initial()));
        let words: Vec<String> = lat
            .successors(lat.initial())
            .map(|(j, _)| vocab.display_word(lat.word(j)))
            .collect();
        assert_eq!(words, vec!["a", "b"]);
        lat.check().unwrap();
    }

    #[test]
    fn written_weights_read_back() {
        let vocab = Vocab::new();
        let mut input = LineReader::new(Cursor::new(SLF), "utt1.slf");
        let (lat, _) = read_htk(&vocab, &mut input, &HtkHeader::default()).unwrap();
        let mut out = Vec::new();
        let plain = HtkHeader {
            acscale: 0.0,
            ..HtkHeader::default()
        };
        write_htk(&lat, &plain, HtkScoreMapping::Language, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("W=hello"));
        let mut again = LineReader::new(Cursor::new(text), "copy.slf");
        let (copy, _) = read_htk(&vocab, &mut again, &HtkHeader::default()).unwrap();
        for i in lat.node_indices() {
            for (j, t) in lat.successors(i) {
                let w = copy.find_trans(i, j).unwrap().weight;
                assert!((w - t.weight).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn undefined_link_targets_are_rejected() {
        let text = "N=1 L=1\nI=0 W=a\nJ=0 S=0 E=7\n";
        let mut input = LineReader::new(Cursor::new(text), "bad.slf");
        assert!(read_htk(&Vocab::new(), &mut input, &HtkHeader::default()).is_err());
    }

    #[test]
    fn huge_node_ids_do_not_size_the_arena() {
        let text = "N=2 L=1\nI=0 W=a\nI=18446744073709551614 W=b\nJ=0 S=0 E=18446744073709551614\n";
        let mut input = LineReader::new(Cursor::new(text), "huge.slf");
        let (lat, _) = read_htk(&Vocab::new(), &mut input, &HtkHeader::default()).unwrap();
        assert_eq!(lat.max_index(), 2);
        assert_eq!((lat.initial(), lat.final_node()), (0, 1));

        let text = "N=1 L=1\nI=0 W=a\nJ=0 S=0 E=300000000\n";
        let mut input = LineReader::new(Cursor::new(text), "far.slf");
        assert!(read_htk(&Vocab::new(), &mut input, &HtkHeader::default()).is_err());

        let text = "start=5\nN=1 L=0\nI=0 W=a\n";
        let mut input = LineReader::new(Cursor::new(text), "start.slf");
        assert!(read_htk(&Vocab::new(), &mut input, &HtkHeader::default()).is_err());
    }

    #[test]
    fn sparse_node_ids_are_numbered_densely() {
        let text = "N=3 L=2\nI=10 W=!NULL\nI=20 W=a\nI=30 W=!NULL\nJ=0 S=10 E=20 l=-1\nJ=1 S=20 E=30\n";
        let vocab = Vocab::new();
        let mut input = LineReader::new(Cursor::new(text), "sparse.slf");
        let (lat, _) = read_htk(&vocab, &mut input, &HtkHeader::default()).unwrap();
        assert_eq!(lat.num_nodes(), 3);
        assert_eq!((lat.initial(), lat.final_node()), (0, 2));
        assert_eq!(vocab.display_word(lat.word(1)), "a");
        assert!(lat.find_trans(0, 1).is_some());
        lat.check().unwrap();
    }

    #[test]
    fn link_naming_the_largest_id_is_an_undefined_node() {
        let text = "N=1 L=1\nI=0 W=a\nJ=0 S=0 E=18446744073709551615\n";
        let mut input = LineReader::new(Cursor::new(text), "max.slf");
        let err = read_htk(&Vocab::new(), &mut input, &HtkHeader::default()).unwrap_err();
        assert!(err.to_string().contains("undefined node"));
    }
}
