//! Shared plumbing for the command-line drivers: logging setup, input and
//! output streams (`-` is stdin/stdout), configuration and model loading.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use libngram_core::{Config, LineReader, Ngram, Vocab, VocabIndex};
use tracing_subscriber::EnvFilter;

/// Install a stderr subscriber filtered by `directive` (`warn`, `info`,
/// `liblattice=debug`, ...). `RUST_LOG` wins when set.
pub fn init_logging(directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

pub fn open_input(path: &Path) -> Result<LineReader<Box<dyn BufRead>>> {
    if path.as_os_str() == "-" {
        return Ok(LineReader::new(Box::new(BufReader::new(io::stdin())) as Box<dyn BufRead>, "-"));
    }
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    Ok(LineReader::new(
        Box::new(BufReader::new(file)) as Box<dyn BufRead>,
        path.display().to_string(),
    ))
}

pub fn open_output(path: &Path) -> Result<Box<dyn Write>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(BufWriter::new(io::stdout())));
    }
    let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    Ok(Box::new(BufWriter::new(file)))
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(p) => Config::load_toml(p).with_context(|| format!("reading configuration {}", p.display())),
        None => Ok(Config::default()),
    }
}

/// Read an ARPA or binary model, with `order` overriding the file's order
/// when nonzero.
pub fn load_lm(path: &Path, vocab: &Vocab, limit_vocab: bool, order: usize) -> Result<Ngram> {
    let mut lm = Ngram::load(path, vocab, limit_vocab).with_context(|| format!("reading model {}", path.display()))?;
    if order > 0 {
        lm.set_order(order);
    }
    Ok(lm)
}

/// Words of a text line as vocabulary indices; unknown words map to
/// `<unk>`.
pub fn line_words(vocab: &Vocab, line: &str) -> Vec<VocabIndex> {
    line.split_whitespace().map(|w| vocab.index_or_unk(w)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_files_and_reports_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("text");
        std::fs::write(&path, "a b\n").unwrap();
        let mut input = open_input(&path).unwrap();
        assert_eq!(input.next_line().unwrap().as_deref(), Some("a b"));
        let err = open_input(&dir.path().join("missing")).err().unwrap();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn missing_config_path_gives_defaults() {
        assert_eq!(load_config(None).unwrap(), Config::default());
    }

    #[test]
    fn unknown_words_become_unk() {
        let vocab = Vocab::new();
        vocab.add_word("a");
        let words = line_words(&vocab, "a zzz");
        assert_eq!(words[1], vocab.unk_index());
    }
}
