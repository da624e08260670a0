use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use libngram_core::{estimate_discounts, DiscountConfig, Ngram, NgramCounts};
use lm_tools::{init_logging, load_config, open_input, open_output};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Method {
    GoodTuring,
    WittenBell,
    KneserNey,
    ModifiedKneserNey,
    Constant,
    Natural,
    None,
}

/// Count n-grams in text and estimate a backoff language model.
#[derive(Parser)]
struct Args {
    /// TOML configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Text files, one sentence per line
    #[arg(long, num_args = 1..)]
    text: Vec<PathBuf>,

    /// Count files to merge in (`w1 ... wn<TAB>count`)
    #[arg(long = "read", num_args = 1..)]
    read_counts: Vec<PathBuf>,

    /// Write the merged counts here
    #[arg(long = "write")]
    write_counts: Option<PathBuf>,

    /// Estimate a model and write it here
    #[arg(long)]
    lm: Option<PathBuf>,

    #[arg(long)]
    order: Option<usize>,

    /// Vocabulary file; words are added before counting
    #[arg(long)]
    vocab: Option<PathBuf>,

    /// Discounting method for every order
    #[arg(long, value_enum)]
    discount: Option<Method>,

    /// Discount amount for `--discount constant`
    #[arg(long, default_value_t = 0.5)]
    cdiscount: f64,

    /// Minimum count kept by the discounting method
    #[arg(long, default_value_t = 1)]
    min_count: u64,

    /// Good-Turing maximum count
    #[arg(long, default_value_t = 7)]
    gt_max: u64,

    #[arg(long)]
    interpolate: bool,

    /// Relative entropy pruning threshold
    #[arg(long)]
    prune: Option<f64>,

    #[arg(long)]
    unk: bool,

    #[arg(long)]
    tolower: bool,

    /// Write the model in the binary format
    #[arg(long)]
    binary: bool,

    /// Quantize binary model scores to 8 bits
    #[arg(long)]
    quantize: bool,

    /// Log filter (`warn`, `info`, `debug`, ...)
    #[arg(long)]
    debug: Option<String>,
}

fn discount_config(method: Method, args: &Args) -> DiscountConfig {
    let min_count = args.min_count;
    match method {
        Method::GoodTuring => DiscountConfig::GoodTuring {
            min_count,
            max_count: args.gt_max,
        },
        Method::WittenBell => DiscountConfig::WittenBell { min_count },
        Method::KneserNey => DiscountConfig::KneserNey {
            min_count,
            modified: false,
        },
        Method::ModifiedKneserNey => DiscountConfig::KneserNey {
            min_count,
            modified: true,
        },
        Method::Constant => DiscountConfig::Constant {
            discount: args.cdiscount,
            min_count,
        },
        Method::Natural => DiscountConfig::Natural { min_count },
        Method::None => DiscountConfig::None,
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    if let Some(order) = args.order {
        config.order = order;
    }
    if let Some(method) = args.discount {
        config.discounts = vec![discount_config(method, &args); config.order];
    }
    if let Some(prune) = args.prune {
        config.prune_threshold = prune;
    }
    if let Some(debug) = &args.debug {
        config.debug = debug.clone();
    }
    config.interpolate |= args.interpolate;
    config.unk_is_word |= args.unk;
    config.to_lower |= args.tolower;
    init_logging(&config.debug);

    if config.order == 0 {
        bail!("order must be at least 1");
    }
    if args.text.is_empty() && args.read_counts.is_empty() {
        bail!("nothing to count: give --text or --read");
    }

    let vocab = config.make_vocab();
    if let Some(path) = &args.vocab {
        let n = vocab.read(&mut open_input(path)?)?;
        tracing::info!(words = n, file = %path.display(), "read vocabulary");
    }

    let mut counts = NgramCounts::new(vocab.clone(), config.order);
    for path in &args.text {
        counts
            .count_text(&mut open_input(path)?)
            .with_context(|| format!("counting {}", path.display()))?;
    }
    for path in &args.read_counts {
        counts
            .read(&mut open_input(path)?)
            .with_context(|| format!("reading counts {}", path.display()))?;
    }

    if let Some(path) = &args.write_counts {
        let mut out = open_output(path)?;
        counts.write(&mut out)?;
        out.flush()?;
    }

    let Some(lm_path) = &args.lm else { return Ok(()) };
    let mut discounts = config.build_discounts();
    estimate_discounts(&mut counts, &mut discounts)?;
    let mut lm = Ngram::new(vocab, config.order);
    lm.estimate(&counts, &discounts)?;
    if config.prune_threshold > 0.0 {
        let pruned = lm.prune_probs(config.prune_threshold, config.min_prune_order);
        tracing::info!(pruned, threshold = config.prune_threshold, "pruned model");
    }
    lm.save(lm_path, args.binary, args.quantize)
        .with_context(|| format!("writing model {}", lm_path.display()))?;
    for n in 1..=config.order {
        tracing::info!(order = n, ngrams = lm.num_ngrams(n), "estimated");
    }
    Ok(())
}
