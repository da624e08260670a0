use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use libngram_core::hidden_ngram::read_events;
use libngram_core::{HiddenNgram, LmHandle, VOCAB_NONE};
use lm_tools::{init_logging, line_words, load_config, load_lm, open_input, open_output};

/// Insert hidden events (sentence boundaries, disfluencies, ...) between
/// the words of a text.
#[derive(Parser)]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model over words and events
    #[arg(long)]
    lm: PathBuf,

    /// Event vocabulary, one token per line
    #[arg(long)]
    hidden_vocab: PathBuf,

    /// Input text, one segment per line
    #[arg(long, default_value = "-")]
    text: PathBuf,

    #[arg(long, default_value = "-")]
    output: PathBuf,

    /// Print event posteriors for every gap instead of the tagged text
    #[arg(long)]
    posteriors: bool,

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

    let vocab = config.make_vocab();
    let events = read_events(&vocab, &mut open_input(&args.hidden_vocab)?)?;
    if events.is_empty() {
        bail!("{} lists no events", args.hidden_vocab.display());
    }
    let lm = load_lm(&args.lm, &vocab, false, args.order.unwrap_or(0))?;
    let tagger = HiddenNgram::new(LmHandle::Borrowed(&lm), events);

    let mut input = open_input(&args.text)?;
    let mut out = open_output(&args.output)?;
    let mut failed = 0usize;
    while let Some(line) = input.next_line()? {
        let words = line_words(&vocab, &line);
        if words.is_empty() {
            writeln!(out)?;
            continue;
        }
        if args.posteriors {
            for (gap, dist) in tagger.event_posteriors(&words).iter().enumerate() {
                write!(out, "{}", gap)?;
                for &(event, p) in dist {
                    let name = match event {
                        VOCAB_NONE => "*noevent*".to_string(),
                        e => vocab.display_word(e),
                    };
                    write!(out, " {} {:.6}", name, p)?;
                }
                writeln!(out)?;
            }
            continue;
        }
        match tagger.tag(&words) {
            Some((tags, _)) => {
                let tagged = tagger.tagged_words(&words, &tags);
                writeln!(out, "{}", vocab.words_of(&tagged).join(" "))?;
            }
            None => {
                tracing::warn!(file = input.name(), line = input.line_no(), "no tagging with nonzero probability");
                failed += 1;
                writeln!(out, "{}", line.trim())?;
            }
        }
    }
    out.flush()?;
    if failed > 0 {
        tracing::warn!(failed, "segments left untagged");
    }
    Ok(())
}
