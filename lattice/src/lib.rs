//! liblattice crate root
//!
//! Word lattices on top of the `libngram-core` language models: PFSG and
//! HTK file formats, structural editing, posterior computation and
//! pruning, node reduction, LM expansion, 1-best and N-best decoding, and
//! word-mesh alignment. `run_batch` drives many lattices over a worker
//! pool with per-lattice time limits.
//!
//! Public API exported here:
//! - `Lattice`, `LatticeNode`, `LatticeTransition` from `graph`
//! - `read_pfsg` / `write_pfsg` and `read_htk` / `write_htk`
//! - `NBestList` and `NBestHyp` from `nbest`
//! - `WordMesh` from `mesh`
//! - `LatticeConfig` from `config`

pub mod batch;
pub mod config;
pub mod deadline;
pub mod decode;
pub mod edit;
pub mod error;
pub mod expand;
pub mod graph;
pub mod htk;
pub mod mesh;
pub mod nbest;
pub mod pfsg;
pub mod posterior;
pub mod reduce;

pub use batch::{require_success, run_batch, BatchSummary};
pub use config::LatticeConfig;
pub use deadline::Deadline;
pub use decode::DecodeOptions;
pub use error::{LatticeError, Result};
pub use expand::ExpandOptions;
pub use graph::{
    HtkWordInfo, Lattice, LatticeNode, LatticeTransition, MergePolicy, NodeIndex, TRANS_BACKOFF, TRANS_PAUSE,
};
pub use htk::{read_htk, write_htk, HtkHeader, HtkScoreMapping};
pub use mesh::{word_errors, WordMesh};
pub use nbest::{NBestHyp, NBestList};
pub use pfsg::{read_pfsg, write_pfsg};
pub use posterior::ForwardBackward;
