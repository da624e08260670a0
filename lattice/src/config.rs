// lattice/src/config.rs
//
// Settings for lattice processing. The model settings of libngram-core
// sit at the top level of the same TOML file.

use serde::{Deserialize, Serialize};

use crate::decode::DecodeOptions;
use crate::error::Result;
use crate::expand::ExpandOptions;
use crate::graph::MergePolicy;
use crate::htk::{HtkHeader, HtkScoreMapping};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LatticeConfig {
    #[serde(flatten)]
    pub model: libngram_core::Config,

    // Posteriors and pruning
    /// Divides transition weights before posteriors are computed
    pub posterior_scale: f64,
    /// Posterior threshold relative to the best path; 0 disables
    pub posterior_prune: f64,
    /// Maximum nodes per best-path word; 0 disables
    pub density_prune: f64,
    /// Maximum node count; 0 disables
    pub nodes_prune: usize,
    /// Prune in a single pass
    pub fast_prune: bool,

    // Expansion
    pub max_nodes: usize,
    pub compact_expansion: bool,
    pub no_backoff_weights: bool,

    // Reduction
    /// Neighbor-set overlap needed to merge nodes; 0 means identical sets
    pub overlap_ratio: f64,
    pub reduce_iterations: usize,
    pub merge_policy: MergePolicy,

    // Decoding
    pub beam: Option<f64>,
    pub max_degree: usize,
    pub nbest: usize,
    pub nbest_duplicates: bool,
    pub nbest_max_hyps: usize,
    pub lm_weight: f64,
    pub word_penalty: f64,
    /// Paths aligned into a word mesh. Mesh posteriors are renormalized
    /// over these paths, so a lattice with more paths gets an approximate
    /// mesh.
    pub mesh_nbest: usize,

    // HTK
    pub htk: HtkHeader,
    pub htk_mapping: HtkScoreMapping,

    // Batches
    /// Per-lattice time limit in seconds; 0 disables
    pub timeout_secs: u64,
    /// Worker threads; 0 uses one per CPU
    pub workers: usize,
}

impl Default for LatticeConfig {
    fn default() -> Self {
        Self {
            model: libngram_core::Config::default(),
            posterior_scale: 1.0,
            posterior_prune: 0.0,
            density_prune: 0.0,
            nodes_prune: 0,
            fast_prune: false,
            max_nodes: 0,
            compact_expansion: false,
            no_backoff_weights: false,
            overlap_ratio: 0.0,
            reduce_iterations: 1,
            merge_policy: MergePolicy::default(),
            beam: None,
            max_degree: 0,
            nbest: 1,
            nbest_duplicates: false,
            nbest_max_hyps: 100_000,
            lm_weight: 1.0,
            word_penalty: 0.0,
            mesh_nbest: 100,
            htk: HtkHeader::default(),
            htk_mapping: HtkScoreMapping::default(),
            timeout_secs: 0,
            workers: 1,
        }
    }
}

impl LatticeConfig {
    pub fn load_toml<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    pub fn save_toml<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            lm_weight: self.lm_weight,
            word_penalty: self.word_penalty,
            beam: self.beam,
            max_degree: self.max_degree,
            nbest_duplicates: self.nbest_duplicates,
            max_hyps: self.nbest_max_hyps,
        }
    }

    pub fn expand_options(&self) -> ExpandOptions {
        ExpandOptions {
            max_nodes: self.max_nodes,
            no_backoff_weights: self.no_backoff_weights,
            compact: self.compact_expansion,
        }
    }

    pub fn timeout(&self) -> Option<std::time::Duration> {
        (self.timeout_secs > 0).then(|| std::time::Duration::from_secs(self.timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_and_lattice_settings_share_one_file() {
        let cfg = LatticeConfig::from_toml_str(
            r#"
order = 2
debug = "info"
posterior_scale = 8.0
merge_policy = "sum"
timeout_secs = 5

[htk]
lmscale = 12.0
"#,
        )
        .unwrap();
        assert_eq!(cfg.model.order, 2);
        assert_eq!(cfg.model.debug, "info");
        assert_eq!(cfg.posterior_scale, 8.0);
        assert_eq!(cfg.merge_policy, MergePolicy::Sum);
        assert_eq!(cfg.htk.lmscale, 12.0);
        assert_eq!(cfg.htk.acscale, 1.0);
        assert_eq!(cfg.timeout(), Some(std::time::Duration::from_secs(5)));
        assert_eq!(cfg.nbest, 1);
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lattice.toml");
        let mut cfg = LatticeConfig::default();
        cfg.compact_expansion = true;
        cfg.beam = Some(5.0);
        cfg.save_toml(&path).unwrap();
        let loaded = LatticeConfig::load_toml(&path).unwrap();
        assert_eq!(loaded, cfg);
        assert!(loaded.expand_options().compact);
        assert_eq!(loaded.decode_options().beam, Some(5.0));
    }
}
