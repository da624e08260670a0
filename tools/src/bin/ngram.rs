use std::io::Write;
use std::net::TcpListener;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use libngram_core::remote::serve;
use libngram_core::{BayesMix, LanguageModel, LmHandle, Ngram, NgramCounts, RemoteLm, SentenceOptions, TextStats};
use lm_tools::{init_logging, load_config, load_lm, open_input, open_output};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Read, combine, evaluate and serve n-gram models.
#[derive(Parser)]
struct Args {
    /// TOML configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Main model (ARPA or binary)
    #[arg(long)]
    lm: Option<PathBuf>,

    /// Further models mixed with the main one
    #[arg(long = "mix-lm", num_args = 1..=8)]
    mix_lms: Vec<PathBuf>,

    /// Mixture weights, main model first; the rest of the mass is spread
    /// evenly over components without a weight
    #[arg(long = "lambda", num_args = 1..=9)]
    lambdas: Vec<f64>,

    /// Context length for posterior mixture weights; 0 mixes statically
    #[arg(long)]
    bayes: Option<usize>,

    #[arg(long)]
    bayes_scale: Option<f64>,

    /// Query a model server at HOST:PORT instead of reading a model
    #[arg(long)]
    use_server: Option<String>,

    #[arg(long)]
    order: Option<usize>,

    /// Skip n-grams with words outside the vocabulary file
    #[arg(long)]
    limit_vocab: bool,

    #[arg(long)]
    vocab: Option<PathBuf>,

    #[arg(long)]
    unk: bool,

    #[arg(long)]
    tolower: bool,

    /// Relative entropy pruning threshold
    #[arg(long)]
    prune: Option<f64>,

    /// Drop n-grams no more likely than their backoff estimate
    #[arg(long)]
    prune_lowprobs: bool,

    /// Replace the model's probabilities with this model's estimates
    #[arg(long)]
    rescore_lm: Option<PathBuf>,

    /// Compute perplexity of a text file
    #[arg(long)]
    ppl: Option<PathBuf>,

    /// Compute perplexity of a count file
    #[arg(long)]
    counts: Option<PathBuf>,

    /// Generate this many random sentences
    #[arg(long)]
    gen: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Write the (possibly mixed or pruned) model here
    #[arg(long)]
    write_lm: Option<PathBuf>,

    #[arg(long)]
    binary: bool,

    #[arg(long)]
    quantize: bool,

    /// Serve the model on this port
    #[arg(long)]
    server_port: Option<u16>,

    /// Stop serving after this many clients
    #[arg(long)]
    server_maxclients: Option<usize>,

    /// Log filter (`warn`, `info`, `debug`, ...)
    #[arg(long)]
    debug: Option<String>,
}

/// Complete `given` weights for `n` components.
fn mixture_weights(given: &[f64], n: usize, default_first: f64) -> Result<Vec<f64>> {
    if given.len() > n {
        bail!("{} weights for {} models", given.len(), n);
    }
    let mut weights = given.to_vec();
    if weights.is_empty() {
        weights.push(default_first);
    }
    let used: f64 = weights.iter().sum();
    let missing = n - weights.len();
    if missing > 0 {
        let share = (1.0 - used).max(0.0) / missing as f64;
        weights.extend(std::iter::repeat(share).take(missing));
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 || weights.iter().any(|&w| w < 0.0) {
        bail!("mixture weights must be non-negative with a positive sum");
    }
    Ok(weights.into_iter().map(|w| w / total).collect())
}

/// Static interpolation of all components into one model.
fn mix_static(models: Vec<Ngram>, weights: &[f64]) -> Result<Ngram> {
    let mut models = models.into_iter();
    let Some(mut mixed) = models.next() else { bail!("no models to mix") };
    let mut mass = weights[0];
    for (lm, &w) in models.zip(&weights[1..]) {
        if mass + w <= 0.0 {
            continue;
        }
        mixed = Ngram::mix(&mixed, &lm, mass / (mass + w))?;
        mass += w;
    }
    Ok(mixed)
}

/// Nested two-way posterior mixtures over borrowed components.
fn mix_bayes<'a>(models: &'a [Ngram], weights: &[f64], length: usize, scale: f64) -> LmHandle<'a> {
    let mut mixed = LmHandle::Borrowed(&models[0]);
    let mut mass = weights[0];
    for (lm, &w) in models[1..].iter().zip(&weights[1..]) {
        let prior = if mass + w > 0.0 { mass / (mass + w) } else { 0.5 };
        mixed = LmHandle::owned(BayesMix::new(mixed, LmHandle::Borrowed(lm), prior, length, scale));
        mass += w;
    }
    mixed
}

fn evaluate(lm: &dyn LanguageModel, args: &Args, order: usize) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if let Some(path) = &args.ppl {
        let mut reader = std::io::BufReader::new(
            std::fs::File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
        );
        let name = path.display().to_string();
        let mut stats = TextStats::default();
        lm.ppl_text(&mut reader, &name, &SentenceOptions::default(), &mut stats)?;
        writeln!(out, "file {}: {}", name, stats)?;
    }
    if let Some(path) = &args.counts {
        let mut counts = NgramCounts::new(lm.vocab().clone(), order.max(1));
        counts.read(&mut open_input(path)?)?;
        let mut stats = TextStats::default();
        lm.count_prob(&counts, order.max(1), &mut stats);
        writeln!(out, "file {}: {}", path.display(), stats)?;
    }
    if let Some(n) = args.gen {
        let mut rng = match args.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        for _ in 0..n {
            let words = lm.generate_sentence(100, &mut rng);
            writeln!(out, "{}", lm.vocab().words_of(&words).join(" "))?;
        }
    }
    out.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    if let Some(order) = args.order {
        config.order = order;
    }
    if let Some(length) = args.bayes {
        config.bayes_length = length;
    }
    if let Some(scale) = args.bayes_scale {
        config.bayes_scale = scale;
    }
    if let Some(prune) = args.prune {
        config.prune_threshold = prune;
    }
    if let Some(debug) = &args.debug {
        config.debug = debug.clone();
    }
    config.unk_is_word |= args.unk;
    config.to_lower |= args.tolower;
    init_logging(&config.debug);

    let vocab = config.make_vocab();
    if let Some(path) = &args.vocab {
        vocab.read(&mut open_input(path)?)?;
    }

    if let Some(addr) = &args.use_server {
        let remote = RemoteLm::connect(addr.as_str(), vocab, config.cache_order, config.cache_capacity)
            .with_context(|| format!("connecting to {}", addr))?;
        evaluate(&remote, &args, config.order)?;
        if let Some(e) = remote.take_error() {
            return Err(e).context("model server failed during the run");
        }
        return Ok(());
    }

    let Some(lm_path) = &args.lm else { bail!("give --lm or --use-server") };
    let mut models = vec![load_lm(lm_path, &vocab, args.limit_vocab, args.order.unwrap_or(0))?];
    for path in &args.mix_lms {
        models.push(load_lm(path, &vocab, args.limit_vocab, args.order.unwrap_or(0))?);
    }
    let weights = mixture_weights(&args.lambdas, models.len(), config.mix_lambda)?;
    tracing::info!(models = models.len(), ?weights, bayes = config.bayes_length, "loaded models");

    if config.bayes_length > 0 && models.len() > 1 {
        let lm = mix_bayes(&models, &weights, config.bayes_length, config.bayes_scale);
        evaluate(&*lm, &args, config.order)?;
        if let Some(port) = args.server_port {
            let listener = TcpListener::bind(("0.0.0.0", port))?;
            serve(&*lm, &listener, args.server_maxclients)?;
        }
        return Ok(());
    }

    let mut lm = mix_static(models, &weights)?;
    if let Some(path) = &args.rescore_lm {
        let other = load_lm(path, &vocab, args.limit_vocab, 0)?;
        lm.rescore_probs(&other);
    }
    if config.prune_threshold > 0.0 {
        let pruned = lm.prune_probs(config.prune_threshold, config.min_prune_order);
        tracing::info!(pruned, "pruned model");
    }
    if args.prune_lowprobs {
        let pruned = lm.prune_low_probs(config.min_prune_order);
        tracing::info!(pruned, "removed low probabilities");
    }
    evaluate(&lm, &args, lm.order())?;
    if let Some(path) = &args.write_lm {
        if path.as_os_str() == "-" {
            let mut out = open_output(path)?;
            lm.write_arpa(&mut out)?;
            out.flush()?;
        } else {
            lm.save(path, args.binary, args.quantize)?;
        }
    }
    if let Some(port) = args.server_port {
        let listener = TcpListener::bind(("0.0.0.0", port)).with_context(|| format!("binding port {}", port))?;
        serve(&lm, &listener, args.server_maxclients)?;
    }
    Ok(())
}
