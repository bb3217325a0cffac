use anyhow::Context;
use candle_core::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProteinMPNNConfig {
    pub num_letters: usize,
    pub node_features: usize,
    pub edge_features: usize,
    pub hidden_dim: usize,
    pub num_encoder_layers: usize,
    pub num_decoder_layers: usize,
    pub vocab: usize,
    pub k_neighbors: usize,
    pub num_rbf: usize,
    pub num_positional_embeddings: usize,
    pub max_relative_feature: usize,
    /// Std-dev of the coordinate noise added in training mode.
    pub augment_eps: f64,
    pub dropout: f32,
    /// Divisor for the summed messages of the standard layers.
    pub scale_factor: f64,
    /// Swap the standard layers for invariant point message passing.
    pub use_ipmp: bool,
    pub n_points: usize,
    /// Feed side-chain edge features into the decoder.
    pub side_chains: bool,
    /// Decode every residue with all other residues visible.
    pub single_res_rec: bool,
}

impl Default for ProteinMPNNConfig {
    fn default() -> Self {
        Self {
            num_letters: 21,
            node_features: 128,
            edge_features: 128,
            hidden_dim: 128,
            num_encoder_layers: 3,
            num_decoder_layers: 3,
            vocab: 21,
            k_neighbors: 32,
            num_rbf: 16,
            num_positional_embeddings: 16,
            max_relative_feature: 32,
            augment_eps: 0.1,
            dropout: 0.1,
            scale_factor: 30.0,
            use_ipmp: false,
            n_points: 8,
            side_chains: false,
            single_res_rec: false,
        }
    }
}

impl ProteinMPNNConfig {
    /// Layout of the vanilla 48-neighbour ProteinMPNN weights.
    pub fn proteinmpnn() -> Self {
        Self {
            k_neighbors: 48,
            augment_eps: 0.2,
            ..Self::default()
        }
    }

    pub fn ipmp() -> Self {
        Self {
            use_ipmp: true,
            ..Self::default()
        }
    }

    pub fn side_chain() -> Self {
        Self {
            side_chains: true,
            ..Self::default()
        }
    }

    pub fn from_json_str(s: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(s).context("parsing ProteinMPNN config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hidden_dim == 0 || self.edge_features == 0 {
            bail!("hidden_dim and edge_features must be non-zero")
        }
        if self.k_neighbors == 0 {
            bail!("k_neighbors must be at least 1")
        }
        if self.num_rbf == 0 {
            bail!("num_rbf must be at least 1")
        }
        if self.use_ipmp && self.n_points == 0 {
            bail!("n_points must be at least 1 when use_ipmp is set")
        }
        if self.num_letters == 0 || self.vocab < self.num_letters {
            bail!(
                "vocab ({}) must cover num_letters ({})",
                self.vocab,
                self.num_letters
            )
        }
        if !(0.0..1.0).contains(&self.dropout) {
            bail!("dropout must be in [0, 1), got {}", self.dropout)
        }
        Ok(())
    }
}

/// Options for a sampling call.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleOptions {
    /// `<= 0` picks the arg-max residue.
    pub temperature: f64,
    pub seed: u64,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            seed: 0,
        }
    }
}
