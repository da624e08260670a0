use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use libngram_core::{LanguageModel, LineReader, Ngram, NullLm, Vocab};
use liblattice::{
    read_htk, read_pfsg, run_batch, write_htk, write_pfsg, Deadline, Lattice, LatticeConfig, LatticeError, WordMesh,
};
use lm_tools::{init_logging, load_lm, open_input};

/// Read lattices, rewrite them and decode them, one worker per lattice.
#[derive(Parser)]
struct Args {
    /// TOML configuration (model and lattice settings); flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// A single lattice file
    #[arg(long)]
    in_lattice: Option<PathBuf>,

    /// File listing lattice files, one per line
    #[arg(long)]
    in_lattice_list: Option<PathBuf>,

    /// Write processed lattices (and N-best lists, meshes) here
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Input lattices are HTK SLF
    #[arg(long)]
    read_htk: bool,

    /// Write lattices as HTK SLF
    #[arg(long)]
    write_htk: bool,

    #[arg(long)]
    lm: Option<PathBuf>,

    #[arg(long)]
    order: Option<usize>,

    /// Replace transition weights by LM scores, copying nodes per context
    #[arg(long)]
    expand: bool,

    #[arg(long)]
    compact_expansion: bool,

    #[arg(long)]
    no_backoff_weights: bool,

    #[arg(long)]
    max_nodes: Option<usize>,

    /// Merge redundant nodes
    #[arg(long)]
    reduce: bool,

    #[arg(long)]
    overlap_ratio: Option<f64>,

    #[arg(long)]
    reduce_iterations: Option<usize>,

    #[arg(long)]
    posterior_prune: Option<f64>,

    #[arg(long)]
    density: Option<f64>,

    #[arg(long)]
    nodes_prune: Option<usize>,

    #[arg(long)]
    fast_prune: bool,

    #[arg(long)]
    posterior_scale: Option<f64>,

    /// Turn pause nodes into optional bypasses
    #[arg(long)]
    remove_pauses: bool,

    /// Split multiword nodes on this delimiter
    #[arg(long)]
    split_multiwords: Option<char>,

    /// Print the best word string of every lattice
    #[arg(long)]
    viterbi_decode: bool,

    /// Write this many best hypotheses per lattice
    #[arg(long)]
    nbest_decode: Option<usize>,

    /// N-best lists as JSON lines
    #[arg(long)]
    nbest_json: bool,

    /// Write a word mesh per lattice
    #[arg(long)]
    write_mesh: bool,

    #[arg(long)]
    lm_weight: Option<f64>,

    #[arg(long)]
    word_penalty: Option<f64>,

    #[arg(long)]
    beam: Option<f64>,

    #[arg(long)]
    max_degree: Option<usize>,

    /// Seconds allowed per lattice
    #[arg(long)]
    timeout: Option<u64>,

    /// Worker threads; 0 uses one per CPU
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    debug: Option<String>,
}

impl Args {
    fn apply(&self, cfg: &mut LatticeConfig) {
        if let Some(v) = self.max_nodes {
            cfg.max_nodes = v;
        }
        if let Some(v) = self.overlap_ratio {
            cfg.overlap_ratio = v;
        }
        if let Some(v) = self.reduce_iterations {
            cfg.reduce_iterations = v;
        }
        if let Some(v) = self.posterior_prune {
            cfg.posterior_prune = v;
        }
        if let Some(v) = self.density {
            cfg.density_prune = v;
        }
        if let Some(v) = self.nodes_prune {
            cfg.nodes_prune = v;
        }
        if let Some(v) = self.posterior_scale {
            cfg.posterior_scale = v;
        }
        if let Some(v) = self.nbest_decode {
            cfg.nbest = v;
        }
        if let Some(v) = self.lm_weight {
            cfg.lm_weight = v;
        }
        if let Some(v) = self.word_penalty {
            cfg.word_penalty = v;
        }
        if let Some(v) = self.max_degree {
            cfg.max_degree = v;
        }
        if let Some(v) = self.timeout {
            cfg.timeout_secs = v;
        }
        if let Some(v) = self.workers {
            cfg.workers = v;
        }
        if let Some(order) = self.order {
            cfg.model.order = order;
        }
        if self.beam.is_some() {
            cfg.beam = self.beam;
        }
        if let Some(debug) = &self.debug {
            cfg.model.debug = debug.clone();
        }
        cfg.compact_expansion |= self.compact_expansion;
        cfg.no_backoff_weights |= self.no_backoff_weights;
        cfg.fast_prune |= self.fast_prune;
    }
}

fn lattice_files(args: &Args) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = args.in_lattice.iter().cloned().collect();
    if let Some(list) = &args.in_lattice_list {
        let mut input = open_input(list)?;
        while let Some(line) = input.next_nonblank()? {
            files.push(PathBuf::from(line.trim()));
        }
    }
    if files.is_empty() {
        bail!("give --in-lattice or --in-lattice-list");
    }
    Ok(files)
}

fn create(dir: &Path, name: &str, ext: &str) -> liblattice::Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(dir.join(format!("{}.{}", name, ext)))?))
}

struct Job<'a> {
    args: &'a Args,
    cfg: &'a LatticeConfig,
    vocab: &'a Vocab,
    lm: Option<&'a Ngram>,
}

impl Job<'_> {
    fn read(&self, path: &Path) -> liblattice::Result<Lattice> {
        let mut reader = LineReader::open(path)?;
        if self.args.read_htk {
            let (lat, _) = read_htk(self.vocab, &mut reader, &self.cfg.htk)?;
            return Ok(lat);
        }
        read_pfsg(self.vocab, &mut reader)?
            .ok_or_else(|| LatticeError::malformed(&path.display().to_string(), "no lattice in file"))
    }

    fn run(&self, path: &Path, deadline: &Deadline) -> liblattice::Result<()> {
        let (args, cfg) = (self.args, self.cfg);
        let mut lat = self.read(path)?;
        lat.check()?;
        let before = lat.num_nodes();

        if let Some(delim) = args.split_multiwords {
            lat.split_multiwords(delim);
        }
        if args.remove_pauses {
            lat.remove_pauses();
        }
        if args.reduce {
            lat.reduce(cfg.overlap_ratio, cfg.merge_policy, cfg.reduce_iterations, deadline)?;
        }
        let scale = cfg.posterior_scale;
        if cfg.posterior_prune > 0.0 {
            lat.prune_posteriors(cfg.posterior_prune, scale, cfg.fast_prune, deadline)?;
        }
        if cfg.density_prune > 0.0 {
            lat.prune_density(cfg.density_prune, scale, cfg.fast_prune, deadline)?;
        }
        if cfg.nodes_prune > 0 {
            lat.prune_nodes(cfg.nodes_prune, scale, cfg.fast_prune, deadline)?;
        }
        if args.expand {
            let Some(lm) = self.lm else {
                return Err(LatticeError::Config("--expand needs --lm".to_string()));
            };
            lat.expand_to_lm(lm, &cfg.expand_options(), deadline)?;
        }

        // After expansion the weights already carry the LM scores.
        let null = NullLm::new(self.vocab.clone());
        let decode_lm: &dyn LanguageModel = match self.lm {
            Some(lm) if !args.expand => lm,
            _ => &null,
        };
        let opts = cfg.decode_options();
        if args.viterbi_decode {
            let words = lat
                .decode_1best(decode_lm, &opts, deadline)?
                .map(|h| self.vocab.words_of(&h.words).join(" "))
                .unwrap_or_default();
            println!("{} {}", lat.name(), words);
        }

        let Some(dir) = &args.out_dir else { return Ok(()) };
        let name = lat.name().to_string();
        if args.nbest_decode.is_some() {
            let mut list = lat.decode_nbest(decode_lm, &opts, cfg.nbest, deadline)?;
            list.compute_posteriors(cfg.lm_weight, cfg.word_penalty, scale);
            if args.nbest_json {
                list.write_json(&mut create(dir, &name, "nbest.json")?)?;
            } else {
                list.write_text(&mut create(dir, &name, "nbest")?)?;
            }
        }
        if args.write_mesh {
            let mesh = WordMesh::from_lattice(&lat, cfg.mesh_nbest, scale, deadline)?;
            mesh.write(&mut create(dir, &name, "mesh")?)?;
        }
        if args.write_htk {
            let mut out = create(dir, &name, "htk")?;
            write_htk(&lat, &cfg.htk, cfg.htk_mapping, &mut out)?;
            out.flush()?;
        } else {
            let mut out = create(dir, &name, "pfsg")?;
            write_pfsg(&lat, &mut out)?;
            out.flush()?;
        }
        tracing::info!(lattice = %name, before, after = lat.num_nodes(), "processed");
        Ok(())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = match &args.config {
        Some(path) => LatticeConfig::load_toml(path).with_context(|| format!("reading {}", path.display()))?,
        None => LatticeConfig::default(),
    };
    args.apply(&mut cfg);
    init_logging(&cfg.model.debug);

    let files = lattice_files(&args)?;
    if let Some(dir) = &args.out_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let vocab = cfg.model.make_vocab();
    let lm = match &args.lm {
        Some(path) => Some(load_lm(path, &vocab, false, args.order.unwrap_or(0))?),
        None => None,
    };
    let job = Job {
        args: &args,
        cfg: &cfg,
        vocab: &vocab,
        lm: lm.as_ref(),
    };

    let summary = run_batch(
        &files,
        cfg.workers,
        cfg.timeout(),
        |p| p.display().to_string(),
        |path, deadline| job.run(path, deadline),
    );
    eprintln!(
        "{} lattices: {} done, {} failed, {} over limits",
        summary.total(),
        summary.succeeded,
        summary.failed,
        summary.timed_out
    );
    if summary.failed > 0 {
        bail!("{} lattices failed", summary.failed);
    }
    Ok(())
}
