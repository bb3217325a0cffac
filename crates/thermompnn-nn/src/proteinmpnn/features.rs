//! K-nearest-neighbour residue graph with RBF distance and relative position features.
//!
//! Two modes share the same weights layout:
//! - backbone: N, CA, C, O plus a virtual C-beta, every ordered pair of the five atoms (25
//!   RBF blocks).
//! - side chain: the five backbone/C-beta slots of residue i against all 14 slots of residue
//!   j (70 blocks), gated by per-atom validity. Self pairs are removed and side-chain slots of
//!   same-chain neighbours are zeroed.
use super::configs::ProteinMPNNConfig;
use super::utilities::{atom, gather_edges, linspace, topk_smallest, virtual_cb};
use candle_core::{bail, DType, Module, Result, Tensor, D};
use candle_nn::encoding::one_hot;
use candle_nn::{layer_norm, linear, linear_no_bias, LayerNorm, Linear, VarBuilder};
use itertools::iproduct;

const RBF_D_MIN: f64 = 2.0;
const RBF_D_MAX: f64 = 22.0;
const DIST_EPS: f64 = 1e-6;
const BACKBONE_SLOTS: usize = 5;
const ALL_SLOTS: usize = 14;

#[derive(Clone, Debug)]
pub struct PositionalEncodings {
    num_embeddings: usize,
    max_relative_feature: usize,
    linear: Linear,
}

impl PositionalEncodings {
    pub fn new(num_embeddings: usize, max_relative_feature: usize, vb: VarBuilder) -> Result<Self> {
        let linear = linear(
            2 * max_relative_feature + 2,
            num_embeddings,
            vb.pp("linear"),
        )?;
        Ok(Self {
            num_embeddings,
            max_relative_feature,
            linear,
        })
    }

    /// One-hot class per edge: `clip(offset + M, 0, 2M)` within a chain, `2M + 1` across chains.
    pub fn classes(&self, offset: &Tensor, same_chain: &Tensor) -> Result<Tensor> {
        let max_rel = self.max_relative_feature as f64;
        let same_chain = same_chain.to_dtype(DType::F32)?;
        let d = (offset.to_dtype(DType::F32)? + max_rel)?.clamp(0f32, 2.0 * max_rel as f32)?;
        let within = (&d * &same_chain)?;
        let across = (same_chain.affine(-1.0, 1.0)? * (2.0 * max_rel + 1.0))?;
        (within + across)?.to_dtype(DType::I64)
    }

    pub fn forward(&self, offset: &Tensor, same_chain: &Tensor) -> Result<Tensor> {
        let d = self.classes(offset, same_chain)?;
        let d_onehot = one_hot(d, 2 * self.max_relative_feature + 2, 1f32, 0f32)?;
        self.linear.forward(&d_onehot)
    }

    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }
}

/// Geometry-only output of the graph builder, before the learned edge projection.
#[derive(Clone, Debug)]
pub struct EdgeGraph {
    /// `[B, L, K]` u32 neighbour indices, nearest first.
    pub e_idx: Tensor,
    /// `[B, L, K]` CA-CA distances of the selected neighbours (masked pairs inflated).
    pub d_neighbors: Tensor,
    /// `[B, L, K, blocks * num_rbf]`.
    pub rbf: Tensor,
    /// `[B, L, K]` residue index offset `i - j`.
    pub offsets: Tensor,
    /// `[B, L, K]` 1 where i and j share a chain.
    pub same_chain: Tensor,
    /// Input coordinates: backbone `[B, L, 4, 3]`, or `[B, L, 14, 3]` with the virtual C-beta
    /// written to slot 4 in side-chain mode.
    pub coords: Tensor,
}

#[derive(Clone, Debug)]
pub struct ProteinFeaturesModel {
    top_k: usize,
    num_rbf: usize,
    augment_eps: f64,
    side_chains: bool,
    embeddings: PositionalEncodings,
    edge_embedding: Linear,
    norm_edges: LayerNorm,
}

impl ProteinFeaturesModel {
    pub fn load(vb: VarBuilder, config: &ProteinMPNNConfig, side_chains: bool) -> Result<Self> {
        let blocks = if side_chains {
            BACKBONE_SLOTS * ALL_SLOTS
        } else {
            BACKBONE_SLOTS * BACKBONE_SLOTS
        };
        let edge_in = config.num_positional_embeddings + config.num_rbf * blocks;
        let embeddings = PositionalEncodings::new(
            config.num_positional_embeddings,
            config.max_relative_feature,
            vb.pp("embeddings"),
        )?;
        let edge_embedding =
            linear_no_bias(edge_in, config.edge_features, vb.pp("edge_embedding"))?;
        let norm_edges = layer_norm(config.edge_features, 1e-5, vb.pp("norm_edges"))?;
        log::debug!(
            "graph builder: side_chains = {}, top_k = {}, edge_in = {}",
            side_chains,
            config.k_neighbors,
            edge_in
        );
        Ok(Self {
            top_k: config.k_neighbors,
            num_rbf: config.num_rbf,
            augment_eps: config.augment_eps,
            side_chains,
            embeddings,
            edge_embedding,
            norm_edges,
        })
    }

    pub fn positional(&self) -> &PositionalEncodings {
        &self.embeddings
    }

    /// CA-CA neighbour search. Pairs with an invalid residue are pushed past the row maximum
    /// so they sort last. Returns `(distances, u32 indices)` of the `min(top_k, L)` closest.
    pub fn nearest_neighbors(&self, ca: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, l, _) = ca.dims3()?;
        let mask_2d = mask.unsqueeze(1)?.broadcast_mul(&mask.unsqueeze(2)?)?;
        let dx = ca.unsqueeze(1)?.broadcast_sub(&ca.unsqueeze(2)?)?;
        let d = ((dx.sqr()?.sum(3)? + DIST_EPS)?.sqrt()? * &mask_2d)?;
        let d_max = d.max_keepdim(D::Minus1)?;
        let d_adjust = (&d + mask_2d.affine(-1.0, 1.0)?.broadcast_mul(&d_max)?)?;
        topk_smallest(&d_adjust, self.top_k.min(l))
    }

    /// Gaussian bank over `[2, 22]` Å: `exp(-((d - mu) / sigma)^2)`, `sigma = 20 / num_rbf`.
    pub fn rbf(&self, d: &Tensor) -> Result<Tensor> {
        let d_mu = linspace(RBF_D_MIN, RBF_D_MAX, self.num_rbf, d.device())?;
        let d_sigma = (RBF_D_MAX - RBF_D_MIN) / self.num_rbf as f64;
        let diff = (d.unsqueeze(D::Minus1)?.broadcast_sub(&d_mu)? / d_sigma)?;
        diff.sqr()?.neg()?.exp()
    }

    fn pair_distances(a: &Tensor, b: &Tensor, e_idx: &Tensor) -> Result<Tensor> {
        let diff = a.unsqueeze(2)?.broadcast_sub(&b.unsqueeze(1)?)?;
        let d_a_b = (diff.sqr()?.sum(D::Minus1)? + DIST_EPS)?.sqrt()?;
        gather_edges(&d_a_b.unsqueeze(D::Minus1)?, e_idx)?.squeeze(D::Minus1)
    }

    /// RBF of `|a_i - b_j|` for each neighbour j of i.
    pub fn rbf_pairs(&self, a: &Tensor, b: &Tensor, e_idx: &Tensor) -> Result<Tensor> {
        self.rbf(&Self::pair_distances(a, b, e_idx)?)
    }

    /// [`Self::rbf_pairs`] gated by `a_mask[i] * b_mask[j]` with the self pair removed. With
    /// `chain_labels`, neighbours from the same chain are zeroed as well.
    pub fn rbf_pairs_masked(
        &self,
        a: &Tensor,
        b: &Tensor,
        e_idx: &Tensor,
        a_mask: &Tensor,
        b_mask: &Tensor,
        chain_labels: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch, l) = a_mask.dims2()?;
        let rbf = self.rbf_pairs(a, b, e_idx)?;
        let not_self = Tensor::eye(l, DType::F32, a_mask.device())?.affine(-1.0, 1.0)?;
        let combo = a_mask
            .unsqueeze(2)?
            .broadcast_mul(&b_mask.unsqueeze(1)?)?
            .broadcast_mul(&not_self)?;
        let combo = gather_edges(&combo.unsqueeze(D::Minus1)?, e_idx)?;
        let rbf = rbf.broadcast_mul(&combo)?;
        match chain_labels {
            None => Ok(rbf),
            Some(labels) => {
                let li = labels.unsqueeze(2)?.broadcast_as((batch, l, l))?;
                let lj = labels.unsqueeze(1)?.broadcast_as((batch, l, l))?;
                let other_chain = li.ne(&lj)?.to_dtype(DType::F32)?;
                let other_chain = gather_edges(&other_chain.unsqueeze(D::Minus1)?, e_idx)?;
                rbf.broadcast_mul(&other_chain)
            }
        }
    }

    /// Gaussian coordinate noise with std-dev `augment_eps`, training mode only.
    ///
    /// Applied once per pass by the caller, so every builder sharing a pass sees the same draw.
    pub fn augment(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if train && self.augment_eps > 0.0 {
            x + x.randn_like(0.0, self.augment_eps)?
        } else {
            Ok(x.clone())
        }
    }

    /// Geometry half of the builder: neighbours, RBF blocks and relative positions.
    ///
    /// `x` must be NaN-free. `mask_per_atom` (`[B, L, 14]`) is required in side-chain mode.
    /// With `neighbors` (`[B, L, K]` u32) the search is skipped and that list is used as is;
    /// `d_neighbors` then holds the unmasked CA-CA distances.
    pub fn graph(
        &self,
        x: &Tensor,
        mask: &Tensor,
        residue_idx: &Tensor,
        chain_labels: &Tensor,
        mask_per_atom: Option<&Tensor>,
        neighbors: Option<&Tensor>,
    ) -> Result<EdgeGraph> {
        let (b, l, n_atoms, three) = x.dims4()?;
        if three != 3 {
            bail!("coordinates must end in xyz, got shape {:?}", x.dims())
        }
        if mask.dims() != [b, l] || residue_idx.dims() != [b, l] || chain_labels.dims() != [b, l]
        {
            bail!(
                "mask / residue_idx / chain labels must be [{b}, {l}], got {:?} / {:?} / {:?}",
                mask.dims(),
                residue_idx.dims(),
                chain_labels.dims()
            )
        }
        let ca = atom(x, 1)?;
        let (d_neighbors, e_idx) = match neighbors {
            None => self.nearest_neighbors(&ca, mask)?,
            Some(e_idx) => {
                let (eb, el, _) = e_idx.dims3()?;
                if (eb, el) != (b, l) {
                    bail!("neighbour list {:?} does not match [{b}, {l}]", e_idx.dims())
                }
                (Self::pair_distances(&ca, &ca, e_idx)?, e_idx.clone())
            }
        };
        let cb = virtual_cb(x)?;

        let (rbf_blocks, coords) = if !self.side_chains {
            if n_atoms != 4 {
                bail!("backbone graph expects N, CA, C, O coordinates, got {n_atoms} atoms")
            }
            let mut slots = (0..4).map(|a| atom(x, a)).collect::<Result<Vec<_>>>()?;
            slots.push(cb);
            let blocks = iproduct!(0..BACKBONE_SLOTS, 0..BACKBONE_SLOTS)
                .map(|(c1, c2)| self.rbf_pairs(&slots[c1], &slots[c2], &e_idx))
                .collect::<Result<Vec<_>>>()?;
            (blocks, x.clone())
        } else {
            if n_atoms != ALL_SLOTS {
                bail!("side-chain graph expects {ALL_SLOTS} atom slots, got {n_atoms}")
            }
            let Some(mask_per_atom) = mask_per_atom else {
                bail!("side-chain graph needs a per-atom mask")
            };
            let x = Tensor::cat(
                &[
                    &x.narrow(2, 0, 4)?,
                    &cb.unsqueeze(2)?,
                    &x.narrow(2, 5, ALL_SLOTS - 5)?,
                ],
                2,
            )?;
            let mask_per_atom = Tensor::cat(
                &[
                    &mask_per_atom.narrow(2, 0, 4)?,
                    &mask.unsqueeze(2)?,
                    &mask_per_atom.narrow(2, 5, ALL_SLOTS - 5)?,
                ],
                2,
            )?;
            let slots = (0..ALL_SLOTS)
                .map(|a| atom(&x, a))
                .collect::<Result<Vec<_>>>()?;
            let blocks = iproduct!(0..BACKBONE_SLOTS, 0..ALL_SLOTS)
                .map(|(c1, c2)| {
                    // side-chain slots only see the other chains
                    let labels = (c2 >= BACKBONE_SLOTS).then_some(chain_labels);
                    let b_mask = mask_per_atom.narrow(2, c2, 1)?.squeeze(2)?;
                    self.rbf_pairs_masked(&slots[c1], &slots[c2], &e_idx, mask, &b_mask, labels)
                })
                .collect::<Result<Vec<_>>>()?;
            (blocks, x)
        };
        let rbf = Tensor::cat(&rbf_blocks, D::Minus1)?;

        let offset = residue_idx
            .unsqueeze(2)?
            .broadcast_sub(&residue_idx.unsqueeze(1)?)?;
        let offsets = gather_edges(&offset.unsqueeze(D::Minus1)?, &e_idx)?.squeeze(D::Minus1)?;
        let li = chain_labels.unsqueeze(2)?.broadcast_as((b, l, l))?;
        let lj = chain_labels.unsqueeze(1)?.broadcast_as((b, l, l))?;
        let d_chains = li.eq(&lj)?.to_dtype(DType::F32)?;
        let same_chain =
            gather_edges(&d_chains.unsqueeze(D::Minus1)?, &e_idx)?.squeeze(D::Minus1)?;

        log::trace!(
            "graph: e_idx {:?}, rbf {:?}, coords {:?}",
            e_idx.dims(),
            rbf.dims(),
            coords.dims()
        );
        Ok(EdgeGraph {
            e_idx,
            d_neighbors,
            rbf,
            offsets,
            same_chain,
            coords,
        })
    }

    /// Edge features `[B, L, K, edge_features]`, neighbour indices and coordinates.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        residue_idx: &Tensor,
        chain_labels: &Tensor,
        mask_per_atom: Option<&Tensor>,
        neighbors: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let graph = self.graph(x, mask, residue_idx, chain_labels, mask_per_atom, neighbors)?;
        let e_positional = self.embeddings.forward(&graph.offsets, &graph.same_chain)?;
        let e = Tensor::cat(&[&e_positional, &graph.rbf], D::Minus1)?;
        let e = self.norm_edges.forward(&self.edge_embedding.forward(&e)?)?;
        Ok((e, graph.e_idx, graph.coords))
    }
}
