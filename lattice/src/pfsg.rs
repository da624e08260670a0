// lattice/src/pfsg.rs
//
// PFSG text format:
//
//   name NAME
//   nodes N w0 w1 ... w(N-1)
//   initial I
//   final F
//   transitions T
//   FROM TO WEIGHT
//   ...
//
// Weights are integer logs (base 1.0001). Null nodes are spelled `NULL`.

use std::io::{BufRead, Write};

use libngram_core::prob::{intlog_to_logp, logp_to_intlog};
use libngram_core::{LineReader, Vocab, LOGP_ONE, VOCAB_NONE};

use crate::error::Result;
use crate::graph::{Lattice, LatticeTransition};

pub const NULL_WORD: &str = "NULL";

fn keyword<'l, R: BufRead>(input: &LineReader<R>, line: &'l str, key: &str) -> Result<Vec<&'l str>> {
    let mut fields = line.split_whitespace();
    match fields.next() {
        Some(k) if k == key => Ok(fields.collect()),
        _ => Err(input.error(format!("expected '{}'", key)).into()),
    }
}

fn number<R: BufRead>(input: &LineReader<R>, token: Option<&&str>, what: &str) -> Result<usize> {
    token
        .and_then(|t| t.parse::<usize>().ok())
        .ok_or_else(|| input.error(format!("bad {}", what)).into())
}

fn required<R: BufRead>(input: &mut LineReader<R>, what: &str) -> Result<String> {
    input
        .next_nonblank()?
        .ok_or_else(|| input.error(format!("unexpected end of file, expected '{}'", what)).into())
}

/// Read one PFSG. Returns `None` at end of input.
pub fn read_pfsg<R: BufRead>(vocab: &Vocab, input: &mut LineReader<R>) -> Result<Option<Lattice>> {
    let Some(line) = input.next_nonblank()? else {
        return Ok(None);
    };
    let name = keyword(input, &line, "name")?.join(" ");
    let mut lat = Lattice::empty(vocab.clone(), name);

    let line = required(input, "nodes")?;
    let fields = keyword(input, &line, "nodes")?;
    let num_nodes = number(input, fields.first(), "node count")?;
    if fields.len() - 1 != num_nodes {
        return Err(input
            .error(format!("{} node names for {} nodes", fields.len() - 1, num_nodes))
            .into());
    }
    for (i, &word) in fields[1..].iter().enumerate() {
        let index = if word == NULL_WORD { VOCAB_NONE } else { vocab.add_word(word) };
        lat.ensure_node(i, index);
    }

    let line = required(input, "initial")?;
    let initial = number(input, keyword(input, &line, "initial")?.first(), "initial node")?;
    let line = required(input, "final")?;
    let final_node = number(input, keyword(input, &line, "final")?.first(), "final node")?;
    if initial >= num_nodes || final_node >= num_nodes {
        return Err(input.error("initial or final node out of range").into());
    }
    lat.set_initial(initial);
    lat.set_final(final_node);

    let line = required(input, "transitions")?;
    let num_trans = number(input, keyword(input, &line, "transitions")?.first(), "transition count")?;
    for _ in 0..num_trans {
        let line = required(input, "transition")?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 || fields.len() > 3 {
            return Err(input.error("transition needs FROM TO [WEIGHT]").into());
        }
        let from = number(input, fields.first(), "transition source")?;
        let to = number(input, fields.get(1), "transition target")?;
        let weight = match fields.get(2) {
            Some(w) => intlog_to_logp(
                w.parse::<i64>()
                    .map_err(|_| input.error(format!("bad transition weight '{}'", w)))?,
            ),
            None => LOGP_ONE,
        };
        if !lat.insert_trans(from, to, LatticeTransition::new(weight)) {
            return Err(input.error(format!("transition {} -> {} out of range", from, to)).into());
        }
    }
    tracing::debug!(
        lattice = %lat.name(),
        nodes = num_nodes,
        transitions = num_trans,
        "read PFSG"
    );
    Ok(Some(lat))
}

/// Write a lattice as a PFSG. Node indices are renumbered densely.
pub fn write_pfsg<W: Write>(lat: &Lattice, out: &mut W) -> Result<()> {
    let mut map = vec![0usize; lat.max_index()];
    let live: Vec<usize> = lat.node_indices().collect();
    for (new, &old) in live.iter().enumerate() {
        map[old] = new;
    }
    writeln!(out, "name {}", lat.name())?;
    write!(out, "nodes {}", live.len())?;
    for &i in &live {
        match lat.word(i) {
            VOCAB_NONE => write!(out, " {}", NULL_WORD)?,
            w => write!(out, " {}", lat.vocab().display_word(w))?,
        }
    }
    writeln!(out)?;
    writeln!(out, "initial {}", map[lat.initial()])?;
    writeln!(out, "final {}", map[lat.final_node()])?;
    writeln!(out, "transitions {}", lat.num_transitions())?;
    for &i in &live {
        for (j, t) in lat.successors(i) {
            writeln!(out, "{} {} {}", map[i], map[j], logp_to_intlog(t.weight))?;
        }
    }
    writeln!(out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libngram_core::prob::log_of;
    use std::io::Cursor;

    const GRAMMAR: &str = "name g1
nodes 4 NULL a b NULL
initial 0
final 3
transitions 4
0 1 0
0 2 -6931
1 3
2 3 0
";

    #[test]
    fn reads_grammar() {
        let vocab = Vocab::new();
        let mut input = LineReader::new(Cursor::new(GRAMMAR), "g1.pfsg");
        let lat = read_pfsg(&vocab, &mut input).unwrap().unwrap();
        assert_eq!(lat.name(), "g1");
        assert_eq!(lat.num_nodes(), 4);
        assert!(lat.is_null(0));
        assert_eq!(vocab.display_word(lat.word(2)), "b");
        let w = lat.find_trans(0, 2).unwrap().weight;
        assert!((w - log_of(0.5)).abs() < 1e-4);
        assert_eq!(lat.find_trans(1, 3).unwrap().weight, LOGP_ONE);
        lat.check().unwrap();
        assert!(read_pfsg(&vocab, &mut input).unwrap().is_none());
    }

    #[test]
    fn round_trips() {
        let vocab = Vocab::new();
        let mut input = LineReader::new(Cursor::new(GRAMMAR), "g1.pfsg");
        let lat = read_pfsg(&vocab, &mut input).unwrap().unwrap();
        let mut out = Vec::new();
        write_pfsg(&lat, &mut out).unwrap();
        let mut again = LineReader::new(Cursor::new(out), "copy.pfsg");
        let copy = read_pfsg(&vocab, &mut again).unwrap().unwrap();
        assert_eq!(copy.num_transitions(), 4);
        assert_eq!(
            logp_to_intlog(copy.find_trans(0, 2).unwrap().weight),
            logp_to_intlog(lat.find_trans(0, 2).unwrap().weight)
        );
    }

    #[test]
    fn reports_bad_transitions_with_position() {
        let vocab = Vocab::new();
        let text = "name bad\nnodes 2 a b\ninitial 0\nfinal 1\ntransitions 1\n0 5 0\n";
        let mut input = LineReader::new(Cursor::new(text), "bad.pfsg");
        let err = read_pfsg(&vocab, &mut input).unwrap_err();
        assert!(err.to_string().contains("bad.pfsg:6"), "{}", err);
    }
}
