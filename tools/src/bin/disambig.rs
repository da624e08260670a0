use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use libngram_core::{Disambiguator, LmHandle, Vocab, VocabMap};
use lm_tools::{init_logging, line_words, load_config, load_lm, open_input, open_output};

/// Map observed words to hidden tokens through a vocabulary map, choosing
/// the sequence a hidden-token model likes best.
#[derive(Parser)]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,

    /// Map file: `word hidden [prob] hidden [prob] ...`
    #[arg(long)]
    map: PathBuf,

    /// Model over hidden tokens
    #[arg(long)]
    lm: PathBuf,

    #[arg(long, default_value = "-")]
    text: PathBuf,

    #[arg(long, default_value = "-")]
    output: PathBuf,

    /// Print this many alternatives per line
    #[arg(long, default_value_t = 1)]
    nbest: usize,

    /// Print per-position posteriors instead of sequences
    #[arg(long)]
    posteriors: bool,

    #[arg(long, default_value_t = 1.0)]
    lm_weight: f64,

    #[arg(long, default_value_t = 1.0)]
    map_weight: f64,

    #[arg(long)]
    order: Option<usize>,

    #[arg(long)]
    debug: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    if let Some(debug) = &args.debug {
        config.debug = debug.clone();
    }
    init_logging(&config.debug);

    let observed = Vocab::new();
    let hidden = config.make_vocab();
    let mut map = VocabMap::new(observed.clone(), hidden.clone());
    let entries = map
        .read(&mut open_input(&args.map)?)
        .with_context(|| format!("reading map {}", args.map.display()))?;
    tracing::info!(entries, file = %args.map.display(), "read vocabulary map");
    let lm = load_lm(&args.lm, &hidden, false, args.order.unwrap_or(0))?;
    let disambig = Disambiguator::new(&map, LmHandle::Borrowed(&lm)).with_weights(args.lm_weight, args.map_weight);

    let mut input = open_input(&args.text)?;
    let mut out = open_output(&args.output)?;
    while let Some(line) = input.next_line()? {
        let words = line_words(&observed, &line);
        if args.posteriors {
            for (pos, dist) in disambig.posteriors(&words).iter().enumerate() {
                write!(out, "{}", pos)?;
                for &(h, p) in dist {
                    write!(out, " {} {:.6}", hidden.display_word(h), p)?;
                }
                writeln!(out)?;
            }
            continue;
        }
        let hyps = disambig.nbest(&words, args.nbest.max(1));
        if hyps.is_empty() {
            tracing::warn!(file = input.name(), line = input.line_no(), "no hidden sequence");
            writeln!(out)?;
            continue;
        }
        for (score, seq) in hyps {
            if args.nbest > 1 {
                write!(out, "{:.4} ", score)?;
            }
            writeln!(out, "{}", hidden.words_of(&seq).join(" "))?;
        }
    }
    out.flush()?;
    Ok(())
}
